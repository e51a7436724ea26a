use std::time::Duration;

use serde::Deserialize;

/// Relay-level configuration: backend, security, sessions and dispatch limits.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Endpoint of the device backend (`memory://<name>` for the in-process backend).
    pub backend_endpoint: String,
    /// When false, a session authenticates iff `login == password`.
    pub security_enabled: bool,
    /// Identity resolver used when security is enabled.
    pub identity_resolver: String,
    /// User table consumed by the `static` resolver.
    pub users: Vec<UserRecord>,
    /// Sessions idle for longer than this are expired by the reaper.
    pub session_idle_timeout: Duration,
    /// How often the reaper scans for idle sessions.
    pub reaper_interval: Duration,
    /// Sleep between reply polls while awaiting an asynchronous call.
    pub reply_poll_interval: Duration,
    /// Maximum number of concurrent dispatches before load shedding.
    pub max_concurrent_dispatches: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            backend_endpoint: "memory://local".to_string(),
            security_enabled: false,
            identity_resolver: "equality".to_string(),
            users: Vec::new(),
            session_idle_timeout: Duration::from_secs(30 * 60),
            reaper_interval: Duration::from_secs(60),
            reply_poll_interval: Duration::from_millis(50),
            max_concurrent_dispatches: 1000,
        }
    }
}

impl RelayConfig {
    /// Rejects settings the relay cannot run with.
    ///
    /// # Errors
    ///
    /// Fails when the reaper interval or the reply poll interval is zero,
    /// or when no dispatch may run concurrently.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.reaper_interval.is_zero() {
            anyhow::bail!("reaper_interval must be greater than zero");
        }
        if self.reply_poll_interval.is_zero() {
            anyhow::bail!("reply_poll_interval must be greater than zero");
        }
        if self.max_concurrent_dispatches == 0 {
            anyhow::bail!("max_concurrent_dispatches must be at least 1");
        }
        Ok(())
    }
}

/// One entry of the static user table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub login: String,
    /// Lowercase hex SHA-256 of the password.
    pub password_sha256: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}
