use std::sync::Arc;

use pw_domain::config::Config;
use pw_persistence::{Compressor, Dao, SessionManager};
use pw_providers::ProviderRegistry;
use pw_streaming::StreamingManager;

use crate::runtime::ToolRegistry;

/// Shared application state passed to all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub dao: Arc<Dao>,
    pub llm: Arc<ProviderRegistry>,
    pub sessions: Arc<SessionManager>,
    /// `None` when no summarizer provider is configured.
    pub compressor: Option<Arc<Compressor>>,
    pub streams: Arc<StreamingManager>,
    pub tools: Arc<ToolRegistry>,
}
