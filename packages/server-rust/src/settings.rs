//! TOML configuration file.
//!
//! ```toml
//! [relay]
//! backend_endpoint = "memory://lab"
//! security_enabled = true
//! identity_resolver = "static"
//! session_idle_timeout_secs = 1800
//!
//! [[relay.users]]
//! id = "1"
//! login = "operator"
//! password_sha256 = "..."
//!
//! [network]
//! port = 8080
//! ```
//!
//! Every key is optional. Missing keys keep their defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use serde::Deserialize;

use crate::network::{NetworkConfig, TlsConfig};
use crate::service::{RelayConfig, UserRecord};

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileSettings {
    pub relay: RelaySection,
    pub network: NetworkSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelaySection {
    pub backend_endpoint: Option<String>,
    pub security_enabled: Option<bool>,
    pub identity_resolver: Option<String>,
    pub users: Vec<UserRecord>,
    pub session_idle_timeout_secs: Option<u64>,
    pub reaper_interval_secs: Option<u64>,
    pub reply_poll_interval_ms: Option<u64>,
    pub max_concurrent_dispatches: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub cors_origins: Option<Vec<String>>,
    pub max_body_bytes: Option<usize>,
    pub drain_timeout_secs: Option<u64>,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
}

impl FileSettings {
    /// Reads and parses a settings file.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read or is not valid settings TOML.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// # Errors
    ///
    /// Fails on malformed TOML or unknown keys.
    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Resolves the file values over the defaults.
    ///
    /// # Errors
    ///
    /// Fails when only one of the two TLS paths is given, and on relay
    /// values rejected by [`RelayConfig::validate`].
    pub fn into_configs(self) -> anyhow::Result<(RelayConfig, NetworkConfig)> {
        let relay = self.relay;
        let net = self.network;
        let defaults = RelayConfig::default();

        let relay_config = RelayConfig {
            backend_endpoint: relay.backend_endpoint.unwrap_or(defaults.backend_endpoint),
            security_enabled: relay.security_enabled.unwrap_or(defaults.security_enabled),
            identity_resolver: relay.identity_resolver.unwrap_or(defaults.identity_resolver),
            users: relay.users,
            session_idle_timeout: relay
                .session_idle_timeout_secs
                .map_or(defaults.session_idle_timeout, Duration::from_secs),
            reaper_interval: relay
                .reaper_interval_secs
                .map_or(defaults.reaper_interval, Duration::from_secs),
            reply_poll_interval: relay
                .reply_poll_interval_ms
                .map_or(defaults.reply_poll_interval, Duration::from_millis),
            max_concurrent_dispatches: relay
                .max_concurrent_dispatches
                .unwrap_or(defaults.max_concurrent_dispatches),
        };
        relay_config.validate()?;

        let net_defaults = NetworkConfig::default();
        let network_config = NetworkConfig {
            host: net.host.unwrap_or(net_defaults.host),
            port: net.port.unwrap_or(net_defaults.port),
            tls: tls_config(net.tls_cert_path, net.tls_key_path)?,
            cors_origins: net.cors_origins.unwrap_or(net_defaults.cors_origins),
            max_body_bytes: net.max_body_bytes.unwrap_or(net_defaults.max_body_bytes),
            drain_timeout: net
                .drain_timeout_secs
                .map_or(net_defaults.drain_timeout, Duration::from_secs),
        };

        Ok((relay_config, network_config))
    }
}

/// Both paths or neither.
///
/// # Errors
///
/// Fails when exactly one path is present.
pub fn tls_config(cert: Option<PathBuf>, key: Option<PathBuf>) -> anyhow::Result<Option<TlsConfig>> {
    match (cert, key) {
        (Some(cert_path), Some(key_path)) => Ok(Some(TlsConfig { cert_path, key_path })),
        (None, None) => Ok(None),
        _ => anyhow::bail!("TLS needs both a certificate and a key path"),
    }
}
