//! Tower middleware layers for the dispatch pipeline.
//!
//! - [`load_shed`]: Semaphore-based concurrency limiting
//! - [`metrics`]: Dispatch span and latency histogram
//! - [`pipeline`]: Composes all layers around the dispatcher

pub mod load_shed;
pub mod metrics;
pub mod pipeline;

pub use load_shed::LoadShedLayer;
pub use metrics::MetricsLayer;
pub use pipeline::{build_dispatch_pipeline, DispatchPipeline};
