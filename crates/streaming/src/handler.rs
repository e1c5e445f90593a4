use pw_domain::error::{Error, Result};

use crate::event::StreamEvent;

/// A consumer of conversation events: a terminal renderer, an SSE writer,
/// or a test collector.
///
/// Handlers are driven by one session at a time; the session serializes
/// calls per handler, and implementations keep any mutable state behind
/// their own locks.
#[async_trait::async_trait]
pub trait StreamHandler: Send + Sync {
    /// Process one event. Failures are reported back through
    /// [`StreamHandler::handle_error`] and never stop delivery to other
    /// handlers.
    async fn handle_event(&self, event: &StreamEvent) -> Result<()>;

    /// Called when this handler's own `handle_event` failed.
    async fn handle_error(&self, error: &Error, session_id: &str);

    /// Release resources. The handler must tolerate events arriving after
    /// close (they are dropped).
    async fn close(&self);
}
