//! Idle-session expiry, driven by a [`BackgroundWorker`](crate::service::BackgroundWorker).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::SessionStore;
use crate::service::worker::BackgroundRunnable;

/// Expires idle sessions on every tick and closes all sessions on shutdown.
pub struct SessionReaper {
    sessions: Arc<SessionStore>,
    idle_timeout: Duration,
}

impl SessionReaper {
    #[must_use]
    pub fn new(sessions: Arc<SessionStore>, idle_timeout: Duration) -> Self {
        Self {
            sessions,
            idle_timeout,
        }
    }

    fn sweep(&self) -> usize {
        self.sessions.expire_idle(self.idle_timeout)
    }
}

#[async_trait]
impl BackgroundRunnable for SessionReaper {
    async fn on_tick(&mut self) {
        self.sweep();
    }

    async fn shutdown(&mut self) {
        let closed = self.sessions.close_all();
        info!(closed, "session reaper stopped");
    }
}
