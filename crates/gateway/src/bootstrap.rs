//! Process bootstrap: wire config into the service graph.

use std::sync::Arc;

use pw_domain::config::Config;
use pw_persistence::{Compressor, Dao, SessionManager};
use pw_providers::ProviderRegistry;
use pw_streaming::StreamingManager;

use crate::runtime::ToolRegistry;
use crate::state::AppState;

/// Build the shared application state. The compressor only starts when a
/// summarizer-capable provider exists; everything else is unconditional.
pub fn build_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    let dao = Arc::new(Dao::open(&config.persistence.db_path)?);
    let sessions = Arc::new(SessionManager::new(dao.clone()));
    let llm = Arc::new(ProviderRegistry::from_config(&config.llm)?);
    let tools = Arc::new(ToolRegistry::new());
    let streams = Arc::new(StreamingManager::new());

    let compressor = match llm.resolve("summarizer") {
        Some(provider) => Some(Compressor::start(
            dao.clone(),
            provider,
            config.compression.clone(),
        )),
        None => {
            tracing::warn!("no LLM provider available for summarization; context compression disabled");
            None
        }
    };

    Ok(AppState {
        config,
        dao,
        llm,
        sessions,
        compressor,
        streams,
        tools,
    })
}
