use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

/// What the registry needs to know about a live session.
pub trait Registered: Send + Sync + 'static {
    fn id(&self) -> &str;
    fn backend_id(&self) -> &str;
}

/// Read-only view used by the shared-port listener to pick a TLS config.
pub trait BackendLookup: Send + Sync {
    fn backend_for(&self, session_id: &str) -> Option<String>;
}

/// Process-local directory of the sessions live on this node.
///
/// Entries are weak: the session task that owns a session is the only one
/// that can keep it alive, and it removes the entry during teardown.
pub struct Registry<S> {
    sessions: RwLock<HashMap<String, Weak<S>>>,
}

impl<S> Default for Registry<S> {
    fn default() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

impl<S: Registered> Registry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: &Arc<S>) {
        self.sessions
            .write()
            .insert(session.id().to_string(), Arc::downgrade(session));
    }

    pub fn get(&self, id: &str) -> Option<Arc<S>> {
        self.sessions.read().get(id).and_then(Weak::upgrade)
    }

    pub fn remove(&self, id: &str) -> bool {
        self.sessions.write().remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Strong handles to every live session.
    pub fn sessions(&self) -> Vec<Arc<S>> {
        self.sessions
            .read()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

impl<S: Registered> BackendLookup for Registry<S> {
    fn backend_for(&self, session_id: &str) -> Option<String> {
        self.get(session_id)
            .map(|session| session.backend_id().to_string())
    }
}
