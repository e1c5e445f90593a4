use axum::extract::State;
use axum::response::Json;

use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "planweaver",
        "version": env!("CARGO_PKG_VERSION"),
        "llm_providers": state.llm.len(),
        "compression_enabled": state.compressor.is_some(),
        "registered_tools": state.tools.len(),
    }))
}
