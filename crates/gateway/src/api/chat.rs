//! Chat endpoints — the primary interface for running planning turns.
//!
//! - `POST /api/chat` — runs a full turn, then returns a JSON envelope
//!   with the final result plus the SSE frames captured along the way.
//! - `GET /api/chat/stream` — long-lived `text/event-stream` response fed
//!   by an [`SseHandler`]; the turn runs in a background task and
//!   persistence happens even if the client disconnects mid-stream.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use parking_lot::Mutex;
use serde::Deserialize;

use pw_domain::context::AgentContext;
use pw_domain::error::Error;
use pw_streaming::sse::{SseWriteFuture, SseWriter};
use pw_streaming::{SseHandler, SseHandlerConfig, StreamEvent, StreamHandler};

use crate::runtime::{audit, Planner, PlannerRun};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ChatBody {
    pub user_input: String,
    /// Existing session to continue; a new session is created when absent.
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub include_metadata: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    pub user_input: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub include_metadata: Option<bool>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/chat
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn chat(State(state): State<AppState>, Json(body): Json<ChatBody>) -> Response {
    let Some(provider) = state.llm.resolve("executor") else {
        return no_provider_response();
    };

    let (session_id, context) = match resolve_context(&state, body.session_id.as_deref()) {
        Ok(resolved) => resolved,
        Err((code, message)) => {
            return (code, Json(serde_json::json!({ "error": message }))).into_response();
        }
    };

    let session = state.streams.create_session(&session_id);
    let capture = Arc::new(FrameCapture::new(body.include_metadata.unwrap_or(false)));
    session.add_handler(capture.clone());
    session.start();

    let planner = Planner::new(
        provider,
        state.tools.clone(),
        state.config.orchestrator.clone(),
    );
    let run = planner
        .process(&body.user_input, &context, session.clone())
        .await;

    state.streams.close_session(&session_id).await;
    persist_run(&state, &session_id, &body.user_input, &run);

    Json(serde_json::json!({
        "success": run.result.success,
        "session_id": session_id,
        "final_message": run.result.final_message(),
        "tool_execution_results_updates": run.result.tool_execution_results_updates,
        "error": run.result.error,
        "execution_time": run.result.execution_time,
        "events": capture.frames(),
    }))
    .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /api/chat/stream
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn chat_stream(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> Response {
    let Some(provider) = state.llm.resolve("executor") else {
        return sse_error_response("no LLM providers are configured");
    };

    let (session_id, context) = match resolve_context(&state, params.session_id.as_deref()) {
        Ok(resolved) => resolved,
        Err((_, message)) => return sse_error_response(&message),
    };

    // Frames travel: SseHandler -> writer fn -> this channel -> response
    // body. The channel closes when the handler's writer task exits.
    let (tx, rx) = tokio::sync::mpsc::channel::<String>(64);
    let writer: SseWriter = Arc::new(move |frame: String| {
        let tx = tx.clone();
        Box::pin(async move {
            tx.send(frame)
                .await
                .map_err(|_| Error::Http("SSE client disconnected".into()))
        }) as SseWriteFuture
    });

    let handler = Arc::new(SseHandler::new(
        writer,
        SseHandlerConfig {
            heartbeat: Duration::from_secs(state.config.streaming.heartbeat_secs),
            include_metadata: params
                .include_metadata
                .unwrap_or(state.config.streaming.include_metadata),
            buffer_events: state.config.streaming.buffer_events,
        },
    ));

    let session = state.streams.create_session(&session_id);
    session.add_handler(handler);
    session.start();

    // The turn runs detached: a disconnecting client closes its handler,
    // but orchestration and persistence still complete.
    let run_state = state.clone();
    let user_input = params.user_input.clone();
    let run_session_id = session_id.clone();
    tokio::spawn(async move {
        let planner = Planner::new(
            provider,
            run_state.tools.clone(),
            run_state.config.orchestrator.clone(),
        );
        let run = planner
            .process(&user_input, &context, session.clone())
            .await;
        run_state.streams.close_session(&run_session_id).await;
        persist_run(&run_state, &run_session_id, &user_input, &run);
    });

    sse_body_response(rx)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared pieces
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolve the target session and build its orchestration context.
fn resolve_context(
    state: &AppState,
    session_id: Option<&str>,
) -> Result<(String, AgentContext), (StatusCode, String)> {
    let session_id = match session_id {
        Some(id) => id.to_string(),
        None => state
            .sessions
            .create_session(None)
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?,
    };

    match state.sessions.build_agent_context(Some(&session_id)) {
        Ok(Some(context)) => Ok((session_id, context)),
        Ok(None) => Err((StatusCode::NOT_FOUND, "session not found".to_string())),
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "context build failed");
            Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

/// Persist a successful run's delta, audit its tool calls, and let the
/// compressor check thresholds. Persistence failures are logged by the
/// facade; the stream has already been delivered either way.
fn persist_run(state: &AppState, session_id: &str, user_input: &str, run: &PlannerRun) {
    if !run.result.success {
        return;
    }
    match state
        .sessions
        .update_from_agent_result(Some(session_id), &run.result, Some(user_input))
    {
        Ok(true) => {}
        Ok(false) => tracing::warn!(session_id, "turn delta was not saved"),
        Err(e) => tracing::warn!(session_id, error = %e, "turn delta save failed"),
    }
    audit::record_tool_outcomes(&state.dao, session_id, &run.tool_outcomes);
    if let Some(compressor) = &state.compressor {
        compressor.compress_if_needed(session_id);
    }
}

fn no_provider_response() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({
            "error": "no_llm_provider",
            "reason": "No LLM providers are available. Configure at least one \
                       provider under [[llm.providers]] in the config file.",
        })),
    )
        .into_response()
}

/// A pre-stream failure still answers in SSE form: one `error` event.
fn sse_error_response(message: &str) -> Response {
    let mut details = serde_json::Map::new();
    details.insert(
        "error_type".into(),
        serde_json::Value::String("ValidationError".into()),
    );
    let frame = StreamEvent::error("", message, details).to_sse();
    match Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from(frame))
    {
        Ok(response) => response,
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn sse_body_response(mut rx: tokio::sync::mpsc::Receiver<String>) -> Response {
    let stream = async_stream::stream! {
        while let Some(frame) = rx.recv().await {
            yield Ok::<_, std::convert::Infallible>(Bytes::from(frame));
        }
    };

    match Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
    {
        Ok(response) => response,
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Handler that captures serialized SSE frames for the non-streaming
/// endpoint's response envelope.
struct FrameCapture {
    frames: Mutex<Vec<String>>,
    include_metadata: bool,
}

impl FrameCapture {
    fn new(include_metadata: bool) -> Self {
        Self {
            frames: Mutex::new(Vec::new()),
            include_metadata,
        }
    }

    fn frames(&self) -> Vec<String> {
        self.frames.lock().clone()
    }
}

#[async_trait::async_trait]
impl StreamHandler for FrameCapture {
    async fn handle_event(&self, event: &StreamEvent) -> pw_domain::error::Result<()> {
        let frame = if self.include_metadata || event.metadata.is_empty() {
            event.to_sse()
        } else {
            let mut stripped = event.clone();
            stripped.metadata = Default::default();
            stripped.to_sse()
        };
        self.frames.lock().push(frame);
        Ok(())
    }

    async fn handle_error(&self, error: &Error, session_id: &str) {
        tracing::warn!(session_id, error = %error, "frame capture error");
    }

    async fn close(&self) {}
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
