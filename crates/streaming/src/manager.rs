//! Process-wide session registry.
//!
//! Maps session id → [`StreamingSession`]. Creating a session under an id
//! that is already live replaces it: the old session is stopped in a
//! background task so creation never blocks on slow handler shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::session::StreamingSession;

#[derive(Default)]
pub struct StreamingManager {
    sessions: Mutex<HashMap<String, Arc<StreamingSession>>>,
}

impl StreamingManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) the session for `session_id`.
    pub fn create_session(&self, session_id: &str) -> Arc<StreamingSession> {
        let session = Arc::new(StreamingSession::new(session_id));

        let replaced = self
            .sessions
            .lock()
            .insert(session_id.to_string(), session.clone());

        if let Some(old) = replaced {
            if old.is_active() {
                tracing::debug!(session_id, "replacing active streaming session");
                tokio::spawn(async move { old.stop().await });
            }
        }

        session
    }

    pub fn get_session(&self, session_id: &str) -> Option<Arc<StreamingSession>> {
        self.sessions.lock().get(session_id).cloned()
    }

    pub async fn close_session(&self, session_id: &str) {
        let removed = self.sessions.lock().remove(session_id);
        if let Some(session) = removed {
            session.stop().await;
        }
    }

    pub async fn close_all(&self) {
        let sessions: Vec<Arc<StreamingSession>> =
            self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.stop().await;
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}
