//! Pipeline composition: the dispatcher wrapped in its middleware layers.

use tower::ServiceBuilder;

use super::load_shed::{LoadShedLayer, LoadShedService};
use super::metrics::{MetricsLayer, MetricsService};
use crate::service::config::RelayConfig;
use crate::service::dispatcher::Dispatcher;

/// The composed dispatch service handed to the HTTP layer.
pub type DispatchPipeline = LoadShedService<MetricsService<Dispatcher>>;

/// Wraps the `Dispatcher` with middleware layers.
///
/// Layer order (outermost to innermost):
/// 1. `LoadShedLayer` -- refuse when overloaded, before any work is done
/// 2. `MetricsLayer` -- span and timing around the dispatch itself
///
/// There is no timeout layer: reply waits are bounded by their own timeout.
#[must_use]
pub fn build_dispatch_pipeline(dispatcher: Dispatcher, config: &RelayConfig) -> DispatchPipeline {
    ServiceBuilder::new()
        .layer(LoadShedLayer::new(config.max_concurrent_dispatches))
        .layer(MetricsLayer)
        .service(dispatcher)
}
