//! HTTP handlers and the shared `AppState`.

pub mod diagnostics;
pub mod health;
pub mod relay;

pub use diagnostics::{diagnostics_handler, metrics_handler};
pub use health::{health_handler, liveness_handler, readiness_handler};
pub use relay::relay_handler;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusHandle;

use super::{NetworkConfig, ShutdownController};
use crate::app::RelayApp;
use crate::service::DispatchPipeline;
use crate::session::SessionStore;
use crate::telemetry::UsageCounters;

/// Shared state passed to every handler. Cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionStore>,
    /// Cloned per request and driven with `oneshot`.
    pub pipeline: DispatchPipeline,
    pub telemetry: Arc<UsageCounters>,
    pub shutdown: Arc<ShutdownController>,
    pub config: Arc<NetworkConfig>,
    pub start_time: Instant,
    /// Source of dispatch call ids, shared by all sessions.
    pub call_ids: Arc<AtomicU64>,
    /// Set when the Prometheus recorder is installed.
    pub prometheus: Option<PrometheusHandle>,
}

impl AppState {
    #[must_use]
    pub fn new(
        app: &RelayApp,
        shutdown: Arc<ShutdownController>,
        config: Arc<NetworkConfig>,
        prometheus: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            sessions: Arc::clone(&app.sessions),
            pipeline: app.pipeline.clone(),
            telemetry: Arc::clone(&app.telemetry),
            shutdown,
            config,
            start_time: Instant::now(),
            call_ids: Arc::new(AtomicU64::new(1)),
            prometheus,
        }
    }
}
