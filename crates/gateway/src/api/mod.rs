//! HTTP surface.
//!
//! - `POST /api/chat`            — full turn, JSON envelope + captured frames
//! - `GET  /api/chat/stream`     — live SSE event stream
//! - `GET  /health`              — API status
//! - `GET  /api/sessions`        — session listing
//! - `GET  /api/sessions/search` — full-text session search
//! - `GET  /api/sessions/statistics` — store-wide counts
//! - `GET  /api/sessions/{id}/statistics`

pub mod chat;
pub mod health;
pub mod sessions;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/api/chat", post(chat::chat))
        .route("/api/chat/stream", get(chat::chat_stream))
        .route("/api/sessions", get(sessions::list))
        .route("/api/sessions/search", get(sessions::search))
        .route("/api/sessions/statistics", get(sessions::global_statistics))
        .route("/api/sessions/:session_id/statistics", get(sessions::statistics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
