use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::Mutex;

use crate::session::TransferSession;

/// A session behind its own lock. Whoever holds the guard is the only
/// mutator of that session.
pub type SessionHandle = Arc<Mutex<TransferSession>>;

/// Where in-progress sessions live.
///
/// Implementations only map ids to handles; per-session exclusivity comes
/// from the handle's mutex. The in-memory store is single-process: sessions
/// vanish on restart and are not shared between instances.
pub trait SessionStore: Send + Sync {
    /// Adds a session. Returns `false` (and stores nothing) if the id is taken.
    fn insert(&self, upload_id: String, handle: SessionHandle) -> bool;

    fn get(&self, upload_id: &str) -> Option<SessionHandle>;

    fn remove(&self, upload_id: &str) -> Option<SessionHandle>;

    /// Snapshot of every live session.
    fn handles(&self) -> Vec<(String, SessionHandle)>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-local session table.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn insert(&self, upload_id: String, handle: SessionHandle) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if sessions.contains_key(&upload_id) {
            return false;
        }
        sessions.insert(upload_id, handle);
        true
    }

    fn get(&self, upload_id: &str) -> Option<SessionHandle> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.get(upload_id).cloned()
    }

    fn remove(&self, upload_id: &str) -> Option<SessionHandle> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.remove(upload_id)
    }

    fn handles(&self) -> Vec<(String, SessionHandle)> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect()
    }

    fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}
