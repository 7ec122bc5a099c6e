//! Registry of live sessions.
//!
//! A concurrent map from session ID to adapter. Every operation is a single
//! map operation, so create, find and remove are linearizable.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::adapter::{SessionAdapter, SessionError, SessionId, SessionStats};

/// Map of live sessions, shared by `Arc` between the manager and the edge.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<SessionAdapter>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Registers `adapter` under `id`.
    pub fn create(&self, id: SessionId, adapter: Arc<SessionAdapter>) -> Result<(), SessionError> {
        match self.sessions.entry(id) {
            Entry::Occupied(entry) => Err(SessionError::DuplicateSession(entry.key().clone())),
            Entry::Vacant(entry) => {
                tracing::debug!(session_id = %entry.key(), "Registered session");
                entry.insert(adapter);
                Ok(())
            }
        }
    }

    /// Looks up a live session.
    pub fn find(&self, id: &str) -> Option<Arc<SessionAdapter>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Removes a session. Removing an unknown ID is a no-op.
    pub fn remove(&self, id: &str) -> Option<Arc<SessionAdapter>> {
        let removed = self.sessions.remove(id).map(|(_, adapter)| adapter);
        if removed.is_some() {
            tracing::debug!(session_id = %id, "Removed session from registry");
        }
        removed
    }

    /// Returns the number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns true if no session is registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Returns the IDs of all live sessions.
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Returns a snapshot of every live session.
    pub async fn list(&self) -> Vec<SessionStats> {
        // Collect first so no map shard lock is held across an await.
        let adapters: Vec<Arc<SessionAdapter>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut stats = Vec::with_capacity(adapters.len());
        for adapter in adapters {
            stats.push(adapter.stats().await);
        }
        stats
    }
}
