//! Wiring of the relay: backend, catalog, gate, sessions, telemetry and the
//! dispatch pipeline, all built once from an immutable [`RelayConfig`].

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::backend;
use crate::delegates::default_catalog;
use crate::security::{IdentityResolvers, SecurityGate};
use crate::service::{build_dispatch_pipeline, ActionContext, DispatchPipeline, Dispatcher, RelayConfig};
use crate::session::SessionStore;
use crate::telemetry::UsageCounters;

/// Everything the network module needs to serve relay requests.
#[derive(Debug, Clone)]
pub struct RelayApp {
    pub config: Arc<RelayConfig>,
    pub sessions: Arc<SessionStore>,
    pub telemetry: Arc<UsageCounters>,
    pub pipeline: DispatchPipeline,
    /// Parent of every session token. Cancelled on shutdown.
    pub root: CancellationToken,
}

impl RelayApp {
    /// Builds the relay with the built-in identity resolvers.
    ///
    /// # Errors
    ///
    /// Fails on invalid intervals or limits, an unsupported backend endpoint,
    /// an unknown identity resolver, a malformed user table, or a catalog
    /// with conflicting registrations.
    pub fn build(config: RelayConfig) -> anyhow::Result<Self> {
        Self::build_with(config, &IdentityResolvers::builtin())
    }

    /// Builds the relay choosing the identity resolver from `resolvers`.
    ///
    /// # Errors
    ///
    /// Same as [`RelayApp::build`].
    pub fn build_with(config: RelayConfig, resolvers: &IdentityResolvers) -> anyhow::Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let backend = backend::connect(&config.backend_endpoint)?;
        let catalog = Arc::new(default_catalog()?);
        let gate = Arc::new(SecurityGate::new(&config, resolvers)?);

        let root = CancellationToken::new();
        let sessions = Arc::new(SessionStore::new(Arc::clone(&config), root.clone()));
        let telemetry = Arc::new(UsageCounters::new());

        let ctx = ActionContext {
            config: Arc::clone(&config),
            backend,
        };
        let dispatcher = Dispatcher::new(
            Arc::clone(&catalog),
            Arc::clone(&sessions),
            gate,
            Arc::clone(&telemetry),
            ctx,
        );
        let pipeline = build_dispatch_pipeline(dispatcher, &config);

        info!(
            backend = %config.backend_endpoint,
            security = config.security_enabled,
            resolver = %config.identity_resolver,
            actions = ?catalog.action_names(),
            "relay assembled"
        );

        Ok(Self {
            config,
            sessions,
            telemetry,
            pipeline,
            root,
        })
    }

    /// Cancels every session token and tears all sessions down.
    pub fn shutdown(&self) -> usize {
        self.root.cancel();
        self.sessions.close_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_with_defaults() {
        let app = RelayApp::build(RelayConfig::default()).unwrap();
        assert_eq!(app.sessions.count(), 0);
        assert!(!app.root.is_cancelled());
    }

    #[test]
    fn unknown_backend_scheme_is_rejected() {
        let config = RelayConfig {
            backend_endpoint: "tango://db:10000".to_string(),
            ..RelayConfig::default()
        };
        assert!(RelayApp::build(config).is_err());
    }

    #[test]
    fn unknown_resolver_is_rejected_when_security_enabled() {
        let config = RelayConfig {
            security_enabled: true,
            identity_resolver: "ldap".to_string(),
            ..RelayConfig::default()
        };
        assert!(RelayApp::build(config).is_err());
    }

    #[test]
    fn zero_reaper_interval_is_rejected() {
        let config = RelayConfig {
            reaper_interval: std::time::Duration::ZERO,
            ..RelayConfig::default()
        };
        let err = RelayApp::build(config).unwrap_err();
        assert!(err.to_string().contains("reaper_interval"));
    }

    #[test]
    fn shutdown_cancels_root_and_closes_sessions() {
        let app = RelayApp::build(RelayConfig::default()).unwrap();
        let session = app.sessions.create();
        assert_eq!(app.shutdown(), 1);
        assert!(app.root.is_cancelled());
        assert!(session.is_closed());
    }
}
