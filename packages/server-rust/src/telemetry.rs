//! Usage telemetry: monotonic counters keyed by action, method and session.
//!
//! Every counter is mirrored to the global `metrics` recorder so the
//! Prometheus endpoint exports the same figures the diagnostics page prints.
//! Recording is infallible; nothing here can fail a dispatch.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Access key shared by every request naming an action the catalog lacks.
pub const UNKNOWN_ACTION: &str = "unknown";

// ---------------------------------------------------------------------------
// CounterFamily
// ---------------------------------------------------------------------------

/// A family of named monotonic counters.
#[derive(Debug, Default)]
struct CounterFamily {
    counters: DashMap<String, AtomicU64>,
}

impl CounterFamily {
    fn increment(&self, key: &str) {
        if let Some(counter) = self.counters.get(key) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.counters
            .entry(key.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self, key: &str) -> u64 {
        self.counters
            .get(key)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// UsageCounters
// ---------------------------------------------------------------------------

/// Process-wide usage counters.
#[derive(Debug, Default)]
pub struct UsageCounters {
    access: CounterFamily,
    removals: CounterFamily,
    methods: CounterFamily,
    creations: CounterFamily,
    uses: CounterFamily,
    sessions: CounterFamily,
}

impl UsageCounters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one request for `action` that reached dispatch. Callers pass
    /// [`UNKNOWN_ACTION`] for names outside the catalog.
    pub fn record_access(&self, action: &str) {
        self.access.increment(action);
        metrics::counter!("devrelay_access_total", "action" => action.to_string()).increment(1);
    }

    /// Counts one removal, keyed by the removed instance's action.
    pub fn record_removal(&self, action: &str) {
        self.removals.increment(action);
        metrics::counter!("devrelay_removals_total", "action" => action.to_string()).increment(1);
    }

    /// Counts one method invocation; `created` marks the call that minted its instance.
    pub fn record_invocation(&self, action: &str, method: &str, session_key: &str, created: bool) {
        let qualified = format!("{action}.{method}");
        self.methods.increment(&qualified);
        self.uses.increment(action);
        self.sessions.increment(&format!("{action}|{session_key}"));
        metrics::counter!("devrelay_method_calls_total", "method" => qualified).increment(1);
        metrics::counter!("devrelay_uses_total", "action" => action.to_string()).increment(1);
        if created {
            self.creations.increment(action);
            metrics::counter!("devrelay_creations_total", "action" => action.to_string())
                .increment(1);
        }
    }

    #[must_use]
    pub fn access_count(&self, action: &str) -> u64 {
        self.access.get(action)
    }

    #[must_use]
    pub fn removal_count(&self, action: &str) -> u64 {
        self.removals.get(action)
    }

    #[must_use]
    pub fn method_count(&self, action: &str, method: &str) -> u64 {
        self.methods.get(&format!("{action}.{method}"))
    }

    #[must_use]
    pub fn creation_count(&self, action: &str) -> u64 {
        self.creations.get(action)
    }

    #[must_use]
    pub fn use_count(&self, action: &str) -> u64 {
        self.uses.get(action)
    }

    #[must_use]
    pub fn session_use_count(&self, action: &str, session_key: &str) -> u64 {
        self.sessions.get(&format!("{action}|{session_key}"))
    }

    /// Point-in-time copy of every counter, sorted by key.
    #[must_use]
    pub fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            access: self.access.snapshot(),
            removals: self.removals.snapshot(),
            methods: self.methods.snapshot(),
            creations: self.creations.snapshot(),
            uses: self.uses.snapshot(),
            sessions: self.sessions.snapshot(),
        }
    }
}

/// Sorted copy of [`UsageCounters`], used by the diagnostics page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub access: BTreeMap<String, u64>,
    pub removals: BTreeMap<String, u64>,
    pub methods: BTreeMap<String, u64>,
    pub creations: BTreeMap<String, u64>,
    pub uses: BTreeMap<String, u64>,
    pub sessions: BTreeMap<String, u64>,
}

impl UsageSnapshot {
    /// Every action that was accessed or removed, with both counts.
    #[must_use]
    pub fn access_rows(&self) -> Vec<(String, u64, u64)> {
        let mut keys: Vec<&String> = self.access.keys().chain(self.removals.keys()).collect();
        keys.sort();
        keys.dedup();
        keys.into_iter()
            .map(|k| {
                (
                    k.clone(),
                    self.access.get(k).copied().unwrap_or(0),
                    self.removals.get(k).copied().unwrap_or(0),
                )
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
