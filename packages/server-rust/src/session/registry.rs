//! Per-session object registry: maps minted handles to live delegate instances.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use devrelay_core::{ObjectId, Value};
use parking_lot::Mutex;

use crate::service::catalog::{ActionContext, ActionSpec, Instance};
use crate::service::operation::RelayError;

/// A live instance together with the action that created it.
#[derive(Clone)]
pub struct RegistryEntry {
    pub action: Arc<ActionSpec>,
    pub instance: Instance,
}

impl std::fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("action", &self.action.name())
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<ObjectId, RegistryEntry>,
    next_id: u64,
    closed: bool,
}

/// Instances owned by one session.
///
/// Handles are minted from 1 and never reused within the session, even
/// after removal.
pub struct ObjectRegistry {
    state: Mutex<RegistryState>,
    removals: AtomicU64,
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ObjectRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectRegistry")
            .field("len", &self.len())
            .field("removals", &self.removal_count())
            .finish()
    }
}

impl ObjectRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                next_id: 1,
                ..RegistryState::default()
            }),
            removals: AtomicU64::new(0),
        }
    }

    /// Instantiates `action` from `class_param` and stores it under a fresh handle.
    ///
    /// # Errors
    ///
    /// `Instantiation` when the constructor cannot be matched or fails, or
    /// when the session has already been torn down.
    pub fn create(
        &self,
        action: &Arc<ActionSpec>,
        ctx: &ActionContext,
        class_param: Vec<Value>,
    ) -> Result<(ObjectId, RegistryEntry), RelayError> {
        // Constructors run outside the lock.
        let instance = action.instantiate(ctx, class_param)?;
        let entry = RegistryEntry {
            action: Arc::clone(action),
            instance,
        };

        let mut state = self.state.lock();
        if state.closed {
            return Err(RelayError::Instantiation {
                action: action.name().to_string(),
                signature: String::new(),
                reason: "session has ended".to_string(),
                cause: None,
            });
        }
        let id = ObjectId(state.next_id);
        state.next_id += 1;
        state.entries.insert(id, entry.clone());
        Ok((id, entry))
    }

    /// # Errors
    ///
    /// `UnknownObject` when no instance is stored under `id`.
    pub fn get(&self, id: ObjectId) -> Result<RegistryEntry, RelayError> {
        self.state
            .lock()
            .entries
            .get(&id)
            .cloned()
            .ok_or(RelayError::UnknownObject { object_id: id })
    }

    /// Removes the instance if present. Removing an absent handle is a
    /// no-op; the removal counter advances either way.
    pub fn remove(&self, id: ObjectId) -> Option<RegistryEntry> {
        self.removals.fetch_add(1, Ordering::Relaxed);
        self.state.lock().entries.remove(&id)
    }

    /// Drops an instance whose handle was never handed out. Unlike
    /// [`remove`](Self::remove) this is not counted as a removal.
    pub fn discard(&self, id: ObjectId) {
        self.state.lock().entries.remove(&id);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total removal requests, including no-ops.
    #[must_use]
    pub fn removal_count(&self) -> u64 {
        self.removals.load(Ordering::Relaxed)
    }

    /// Drops every instance and refuses further creations. Returns how many
    /// instances were dropped.
    pub fn close(&self) -> usize {
        let mut state = self.state.lock();
        state.closed = true;
        let dropped = state.entries.len();
        state.entries.clear();
        dropped
    }
}
