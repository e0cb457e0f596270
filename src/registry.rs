//! Node-local mapping from client ID to active session.
//!
//! Grounded on the teacher's `Db`: a single `RwLock<HashMap<..>>` behind an
//! `Arc`, cheap to clone, no lock-ordering requirements beyond the one map.
//! Unlike `Db` there is no background purge task here — liveness is driven
//! by the session controllers themselves, not by a TTL on this map.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::session::SessionHandle;

#[derive(Clone, Default)]
pub struct Registry {
    entries: Arc<RwLock<HashMap<String, SessionHandle>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically swap the entry for `id`. Returns the prior session, if
    /// any, so the caller can close it. The new entry is visible to
    /// `lookup` as soon as this call returns; callers racing `lookup(id)`
    /// during the changeover may legally observe either session.
    pub fn insert(&self, id: String, session: SessionHandle) -> Option<SessionHandle> {
        self.entries.write().unwrap().insert(id, session)
    }

    /// Current session for `id`, or a miss.
    pub fn lookup(&self, id: &str) -> Option<SessionHandle> {
        self.entries.read().unwrap().get(id).cloned()
    }

    /// Remove the entry for `id` if present. Idempotent.
    pub fn remove(&self, id: &str) {
        self.entries.write().unwrap().remove(id);
    }

    /// Remove the entry for `id` only if it still points at `session`.
    ///
    /// Used by a session's own teardown so that a duplicate admission that
    /// has already replaced this entry isn't accidentally evicted — the
    /// race spec.md §8 property 7 guards against.
    pub fn remove_if_current(&self, id: &str, session: &SessionHandle) {
        let mut entries = self.entries.write().unwrap();
        if let Some(current) = entries.get(id) {
            if current.same_session(session) {
                entries.remove(id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
