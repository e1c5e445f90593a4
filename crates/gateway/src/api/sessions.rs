//! Session management endpoints over the persistence facade.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default = "d_limit")]
    pub limit: usize,
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: String,
    #[serde(default = "d_limit")]
    pub limit: usize,
}

fn d_limit() -> usize {
    50
}

pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    match state.sessions.list_sessions(params.limit) {
        Ok(sessions) => Json(serde_json::json!({ "sessions": sessions })).into_response(),
        Err(e) => persistence_error(e),
    }
}

pub async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> impl IntoResponse {
    match state.sessions.search_sessions(&params.q, params.limit) {
        Ok(hits) => Json(serde_json::json!({
            "query": params.q,
            "results": hits,
        }))
        .into_response(),
        Err(e) => persistence_error(e),
    }
}

pub async fn global_statistics(State(state): State<AppState>) -> impl IntoResponse {
    match state.sessions.get_global_statistics() {
        Ok(stats) => Json(serde_json::json!(stats)).into_response(),
        Err(e) => persistence_error(e),
    }
}

pub async fn statistics(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state.sessions.get_session_statistics(Some(&session_id)) {
        Ok(Some(stats)) => Json(serde_json::json!(stats)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "session not found" })),
        )
            .into_response(),
        Err(e) => persistence_error(e),
    }
}

fn persistence_error(e: pw_domain::error::Error) -> axum::response::Response {
    tracing::warn!(error = %e, "session endpoint failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": e.to_string() })),
    )
        .into_response()
}
