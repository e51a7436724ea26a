//! Client sessions: authentication state, object registry and async calls.
//!
//! A session is identified by a random token carried in the
//! [`SESSION_COOKIE`] cookie. Each session owns its registry and async call
//! manager and a cancellation token derived from the server's root token,
//! so tearing a session down (or shutting the server down) stops every wait
//! and background call it started.

pub mod reaper;
pub mod registry;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

pub use reaper::SessionReaper;
pub use registry::{ObjectRegistry, RegistryEntry};

use crate::service::async_call::AsyncCallManager;
use crate::service::config::RelayConfig;

/// Cookie carrying the session token.
pub const SESSION_COOKIE: &str = "DEVRELAY_SESSION";

// ---------------------------------------------------------------------------
// SessionId
// ---------------------------------------------------------------------------

/// Opaque session token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Authentication state of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticated { login: String },
}

/// One client session.
pub struct Session {
    id: SessionId,
    auth: ArcSwap<AuthState>,
    registry: ObjectRegistry,
    calls: AsyncCallManager,
    cancel: CancellationToken,
    created_at: Instant,
    last_seen: Mutex<Instant>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("auth", &**self.auth.load())
            .field("objects", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Creates a session whose cancellation token is a child of `parent`.
    #[must_use]
    pub fn new(id: SessionId, parent: &CancellationToken, config: &RelayConfig) -> Self {
        let cancel = parent.child_token();
        let now = Instant::now();
        Self {
            id,
            auth: ArcSwap::from_pointee(AuthState::Unauthenticated),
            registry: ObjectRegistry::new(),
            calls: AsyncCallManager::new(config.reply_poll_interval, cancel.clone()),
            cancel,
            created_at: now,
            last_seen: Mutex::new(now),
        }
    }

    /// A session with default configuration and no parent, for tests.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self::new(SessionId::new(), &CancellationToken::new(), &RelayConfig::default())
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Key used for per-session telemetry.
    #[must_use]
    pub fn key(&self) -> String {
        self.id.to_string()
    }

    #[must_use]
    pub fn auth_state(&self) -> AuthState {
        (**self.auth.load()).clone()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        matches!(**self.auth.load(), AuthState::Authenticated { .. })
    }

    /// Marks the session authenticated. Once authenticated a session stays
    /// authenticated; a later login replaces the recorded login only.
    pub fn mark_authenticated(&self, login: &str) {
        self.auth.store(Arc::new(AuthState::Authenticated {
            login: login.to_string(),
        }));
    }

    #[must_use]
    pub fn registry(&self) -> &ObjectRegistry {
        &self.registry
    }

    #[must_use]
    pub fn calls(&self) -> &AsyncCallManager {
        &self.calls
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Cancels outstanding waits and calls and drops every instance.
    pub fn teardown(&self) {
        self.cancel.cancel();
        self.calls.clear();
        let dropped = self.registry.close();
        debug!(session = %self.id, dropped, "session torn down");
    }
}

// ---------------------------------------------------------------------------
// SessionStore
// ---------------------------------------------------------------------------

/// All live sessions, keyed by token.
pub struct SessionStore {
    sessions: DashMap<SessionId, Arc<Session>>,
    root: CancellationToken,
    config: Arc<RelayConfig>,
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    #[must_use]
    pub fn new(config: Arc<RelayConfig>, root: CancellationToken) -> Self {
        Self {
            sessions: DashMap::new(),
            root,
            config,
        }
    }

    /// Opens a fresh session.
    pub fn create(&self) -> Arc<Session> {
        let session = Arc::new(Session::new(SessionId::new(), &self.root, &self.config));
        self.sessions.insert(session.id(), Arc::clone(&session));
        debug!(session = %session.id(), "session opened");
        session
    }

    #[must_use]
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Returns the session named by `id`, or a new one when `id` is absent
    /// or unknown. The flag is true when a session was created.
    pub fn get_or_create(&self, id: Option<SessionId>) -> (Arc<Session>, bool) {
        match id.and_then(|id| self.get(id)) {
            Some(session) => (session, false),
            None => (self.create(), true),
        }
    }

    /// Tears down and forgets a session. Returns false when it was unknown.
    pub fn invalidate(&self, id: SessionId) -> bool {
        match self.sessions.remove(&id) {
            Some((_, session)) => {
                session.teardown();
                info!(session = %id, "session invalidated");
                true
            }
            None => false,
        }
    }

    /// Tears down every session idle for at least `idle`. Returns how many expired.
    pub fn expire_idle(&self, idle: Duration) -> usize {
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for() >= idle)
            .map(|entry| *entry.key())
            .collect();
        for id in &expired {
            if let Some((_, session)) = self.sessions.remove(id) {
                session.teardown();
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired idle sessions");
        }
        expired.len()
    }

    /// Tears down every session.
    pub fn close_all(&self) -> usize {
        let ids: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        for id in &ids {
            if let Some((_, session)) = self.sessions.remove(id) {
                session.teardown();
            }
        }
        ids.len()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Total live instances across every session.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.sessions
            .iter()
            .map(|entry| entry.value().registry().len())
            .sum()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
