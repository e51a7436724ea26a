//! Network module with deferred startup lifecycle.
//!
//! `new()` assembles shared state, `start()` binds the TCP listener, and
//! `serve()` accepts connections until the shutdown signal fires.

use std::future::Future;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::{NetworkConfig, TlsConfig};
use super::handlers::{
    diagnostics_handler, health_handler, liveness_handler, metrics_handler, readiness_handler,
    relay_handler, AppState,
};
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;
use crate::app::RelayApp;
use crate::service::BackgroundWorker;
use crate::session::SessionReaper;

/// Assembles every route around `state`.
///
/// - `POST /relay` -- RPC exchange
/// - `GET /relay` -- diagnostics page
/// - `GET /health`, `/health/live`, `/health/ready` -- probes
/// - `GET /metrics` -- Prometheus exposition
pub fn relay_router(state: AppState) -> Router {
    let layers = build_http_layers(&state.config);

    Router::new()
        .route("/relay", get(diagnostics_handler).post(relay_handler))
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .layer(DefaultBodyLimit::max(state.config.max_body_bytes))
        .layer(layers)
        .with_state(state)
}

/// Owns the HTTP server lifecycle and the session reaper.
pub struct NetworkModule {
    config: Arc<NetworkConfig>,
    app: RelayApp,
    listener: Option<TcpListener>,
    shutdown: Arc<ShutdownController>,
    prometheus: Option<PrometheusHandle>,
}

impl NetworkModule {
    #[must_use]
    pub fn new(config: NetworkConfig, app: RelayApp, prometheus: Option<PrometheusHandle>) -> Self {
        let shutdown = Arc::new(ShutdownController::new(app.root.clone()));
        Self {
            config: Arc::new(config),
            app,
            listener: None,
            shutdown,
            prometheus,
        }
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    #[must_use]
    pub fn app_state(&self) -> AppState {
        AppState::new(
            &self.app,
            Arc::clone(&self.shutdown),
            Arc::clone(&self.config),
            self.prometheus.clone(),
        )
    }

    pub fn build_router(&self) -> Router {
        relay_router(self.app_state())
    }

    /// Binds the listener and returns the bound port (OS-assigned when 0).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!("TCP listener bound to {}:{}", self.config.host, port);

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `shutdown` resolves, then drains.
    ///
    /// When the signal fires the health state moves to Draining and the root
    /// token is cancelled, which ends pending reply waits. The server then
    /// waits up to `drain_timeout` for in-flight requests, stops the reaper
    /// and closes every session.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called, TLS material cannot be
    /// loaded, or the server hits a fatal I/O error.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let Some(listener) = self.listener.take() else {
            anyhow::bail!("start() must be called before serve()");
        };
        let router = self.build_router();

        let reaper = SessionReaper::new(
            Arc::clone(&self.app.sessions),
            self.app.config.session_idle_timeout,
        );
        let mut reaper = BackgroundWorker::start(reaper, self.app.config.reaper_interval);

        let ctrl = Arc::clone(&self.shutdown);
        let signal = async move {
            shutdown.await;
            info!("shutdown signal received");
            ctrl.trigger_shutdown();
        };

        self.shutdown.set_ready();

        let served = match &self.config.tls {
            Some(tls) => serve_tls(listener, router, tls, signal).await,
            None => serve_plain(listener, router, signal).await,
        };

        self.shutdown.trigger_shutdown();
        if self.shutdown.wait_for_drain(self.config.drain_timeout).await {
            info!("all requests drained");
        } else {
            warn!(
                in_flight = self.shutdown.in_flight_count(),
                "drain timeout expired with requests remaining"
            );
        }
        reaper.stop().await;
        served
    }
}

async fn serve_plain(
    listener: TcpListener,
    router: Router,
    signal: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!("serving plain HTTP");

    axum::serve(listener, router)
        .with_graceful_shutdown(signal)
        .await?;
    Ok(())
}

/// Serves TLS with `axum-server`, reusing the bound listener.
async fn serve_tls(
    listener: TcpListener,
    router: Router,
    tls: &TlsConfig,
    signal: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    use axum_server::tls_rustls::RustlsConfig;

    let rustls_config = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load TLS certificates: {e}"))?;

    let addr = listener.local_addr()?;
    let std_listener = listener.into_std()?;
    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();

    tokio::spawn(async move {
        signal.await;
        shutdown_handle.graceful_shutdown(None);
    });

    info!("serving TLS on {}", addr);

    axum_server::from_tcp_rustls(std_listener, rustls_config)
        .handle(handle)
        .serve(router.into_make_service())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::network::HealthState;
    use crate::service::RelayConfig;

    fn module() -> NetworkModule {
        let config = NetworkConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..NetworkConfig::default()
        };
        NetworkModule::new(config, RelayApp::build(RelayConfig::default()).unwrap(), None)
    }

    #[test]
    fn shutdown_controller_returns_shared_arc() {
        let module = module();
        assert!(Arc::ptr_eq(&module.shutdown_controller(), &module.shutdown_controller()));
    }

    #[tokio::test]
    async fn start_binds_to_os_assigned_port() {
        let mut module = module();
        let port = module.start().await.expect("start should succeed");
        assert!(port > 0);
        assert!(module.listener.is_some());
    }

    #[tokio::test]
    async fn serve_without_start_is_an_error() {
        let err = module().serve(std::future::pending::<()>()).await.unwrap_err();
        assert!(err.to_string().contains("start()"));
    }

    #[tokio::test]
    async fn serve_stops_on_signal_and_closes_sessions() {
        let mut module = module();
        module.start().await.unwrap();
        let ctrl = module.shutdown_controller();
        let state = module.app_state();
        let session = state.sessions.create();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(module.serve(async {
            let _ = rx.await;
        }));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ctrl.health_state(), HealthState::Ready);

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();

        assert_eq!(ctrl.health_state(), HealthState::Stopped);
        assert!(session.is_closed());
        assert_eq!(state.sessions.count(), 0);
    }
}
