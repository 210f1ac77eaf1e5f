use std::sync::Arc;

use dashmap::DashMap;

use murmur_core::{CloseReason, SessionId};

use crate::session::TransportSession;

/// Live sessions, for health reporting and shutdown only.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<TransportSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<TransportSession>) {
        self.sessions.insert(session.id().clone(), session);
    }

    pub fn remove(&self, id: &SessionId) -> Option<Arc<TransportSession>> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    /// Number of connected sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Close every open session. Returns how many accepted the close.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        // Collect first so no shard lock is held while closing.
        let sessions: Vec<Arc<TransportSession>> =
            self.sessions.iter().map(|entry| Arc::clone(entry.value())).collect();

        let closed = sessions.iter().filter(|s| s.close(reason)).count();
        if closed > 0 {
            tracing::info!(closed, code = reason.code(), "closed all sessions");
        }
        closed
    }
}
