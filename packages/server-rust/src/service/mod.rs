//! Dispatch framework.
//!
//! 1. **Catalog** (`catalog`): constructor and method tables built at startup
//! 2. **Dispatcher** (`dispatcher`): reserved actions, gate, resolution, invocation
//! 3. **Middleware** (`middleware`): Tower layers (load shedding, dispatch span)
//! 4. **Async calls** (`async_call`, `retry`): call handles and bounded reply waits
//! 5. **Background workers** (`worker`): periodic tasks (session expiry)

pub mod async_call;
pub mod catalog;
pub mod config;
pub mod dispatcher;
pub mod middleware;
pub mod operation;
pub mod retry;
pub mod worker;

pub use async_call::{AsyncCallManager, CallOwner, ReplyPoll};
pub use catalog::{ActionBuilder, ActionCatalog, ActionContext, ActionSpec, InvokeContext};
pub use config::{RelayConfig, UserRecord};
pub use dispatcher::Dispatcher;
pub use middleware::{build_dispatch_pipeline, DispatchPipeline};
pub use operation::{Call, RelayError};
pub use worker::{BackgroundRunnable, BackgroundWorker};
