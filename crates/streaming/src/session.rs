//! Per-request event fan-out.
//!
//! A `StreamingSession` owns the handlers subscribed to one conversation
//! run. Emission stamps the session id onto each event and delivers to
//! every handler in registration order; one handler failing never
//! suppresses delivery to the rest.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::event::StreamEvent;
use crate::handler::StreamHandler;

pub struct StreamingSession {
    session_id: String,
    active: AtomicBool,
    handlers: Mutex<Vec<Arc<dyn StreamHandler>>>,
    metadata: Mutex<Map<String, Value>>,
}

impl StreamingSession {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            active: AtomicBool::new(false),
            handlers: Mutex::new(Vec::new()),
            metadata: Mutex::new(Map::new()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn add_handler(&self, handler: Arc<dyn StreamHandler>) {
        self.handlers.lock().push(handler);
    }

    /// Remove a previously added handler (matched by identity).
    pub fn remove_handler(&self, handler: &Arc<dyn StreamHandler>) {
        self.handlers
            .lock()
            .retain(|h| !Arc::ptr_eq(h, handler));
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: Value) {
        self.metadata.lock().insert(key.into(), value);
    }

    pub fn metadata(&self) -> Map<String, Value> {
        self.metadata.lock().clone()
    }

    pub fn start(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    /// Deliver an event to every handler. The event's session id is
    /// overwritten with this session's id first. No-op once stopped.
    pub async fn emit_event(&self, mut event: StreamEvent) {
        if !self.is_active() {
            tracing::debug!(
                session_id = %self.session_id,
                kind = event.kind.as_str(),
                "dropping event emitted on inactive session"
            );
            return;
        }

        event.session_id = self.session_id.clone();

        // Snapshot so handler calls run without holding the lock.
        let handlers: Vec<Arc<dyn StreamHandler>> = self.handlers.lock().clone();
        for handler in handlers {
            if let Err(e) = handler.handle_event(&event).await {
                // The failing handler hears about its own error and stays
                // subscribed; remaining handlers still get the event.
                handler.handle_error(&e, &self.session_id).await;
            }
        }
    }

    /// Stop the session: no further emits, all handlers closed and dropped.
    pub async fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        let handlers: Vec<Arc<dyn StreamHandler>> =
            std::mem::take(&mut *self.handlers.lock());
        for handler in &handlers {
            handler.close().await;
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
