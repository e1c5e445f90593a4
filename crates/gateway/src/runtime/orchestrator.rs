//! The ReAct orchestration engine.
//!
//! One bounded cycle drives the whole LLM ↔ tool interaction: stream the
//! assistant turn (folding content chunks and index-keyed tool-call
//! fragments as they arrive), close the turn, then either finish — the
//! content is the user-visible answer — or dispatch the tool batch and go
//! around again with the results in history. Tool-tag filtering happens at
//! stream-read time so chunk events never leak `<tool_call>` spans, even
//! ones split across chunk boundaries.
//!
//! Execution is streaming-only: a session with no handlers attached gets a
//! static refusal instead of a synthesized non-streaming path. Cycle
//! errors are contained — recorded on the turn state and returned as a
//! failure outcome — so the caller can still emit `error` and
//! `conversation_end` on the live stream.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use serde_json::{Map, Value};

use pw_domain::config::OrchestratorConfig;
use pw_domain::error::Result;
use pw_domain::stream::LlmDelta;
use pw_domain::tool::{Message, ToolCall};
use pw_providers::filter::ToolTagFilter;
use pw_providers::traits::{ChatRequest, LlmProvider};
use pw_streaming::event::MessageChunk;
use pw_streaming::{StreamEvent, StreamingSession};

use super::executor::{self, ToolOutcome};
use super::tools::ToolRegistry;

const SYSTEM_PROMPT: &str = "\
You are a planning assistant that turns product ideas into concrete,
actionable technical plans. Work step by step: understand the requirement,
call the available tools when they can ground your answer (research,
tool recommendation, short-horizon planning), and fold their results into
your reply. Prefer precise, implementation-ready output over generalities.
When you have everything you need, answer the user directly.";

pub(crate) const STREAMING_REQUIRED_MESSAGE: &str =
    "Streaming execution is required: attach at least one stream handler to the session before running.";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything one orchestration run reads and accumulates. The explicit
/// record replaces a free-form shared dictionary: history in, new
/// messages / extracted tool results / errors out.
pub struct TurnState {
    pub session_id: String,
    /// Working history sent to the LLM, including the new user message.
    pub messages: Vec<Message>,
    pub session: Arc<StreamingSession>,
    /// Assistant and tool messages produced this run, in order.
    pub new_messages: Vec<Message>,
    /// Extraction slots keyed by canonical result name
    /// (`recommended_tools`, `research_findings`, `short_planning`).
    pub extracted: BTreeMap<String, Value>,
    /// Raw per-call outcomes, kept for the audit writer.
    pub tool_outcomes: Vec<ToolOutcome>,
    pub errors: Vec<TurnError>,
    pub cycle_count: usize,
}

#[derive(Debug, Clone)]
pub struct TurnError {
    pub source: String,
    pub error: String,
    pub timestamp: String,
}

impl TurnState {
    pub fn new(
        session_id: String,
        messages: Vec<Message>,
        session: Arc<StreamingSession>,
    ) -> Self {
        Self {
            session_id,
            messages,
            session,
            new_messages: Vec::new(),
            extracted: BTreeMap::new(),
            tool_outcomes: Vec::new(),
            errors: Vec::new(),
            cycle_count: 0,
        }
    }
}

/// What one full run produced.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub success: bool,
    /// The user-visible final message (last assistant content).
    pub user_message: String,
    pub execution_mode: String,
    pub error: Option<String>,
}

enum CycleResult {
    /// No tool calls: `content` is the final answer.
    Final(String),
    /// Tools dispatched; run another cycle.
    Continue,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Orchestrator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Orchestrator {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        tools: Arc<ToolRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            provider,
            tools,
            config,
        }
    }

    /// Drive the function-calling cycle to completion.
    pub async fn run(&self, state: &mut TurnState) -> TurnOutcome {
        if state.session.handler_count() == 0 {
            return TurnOutcome {
                success: false,
                user_message: STREAMING_REQUIRED_MESSAGE.to_string(),
                execution_mode: "streaming_required".into(),
                error: Some(STREAMING_REQUIRED_MESSAGE.to_string()),
            };
        }

        for depth in 0..self.config.max_recursion_depth {
            state.cycle_count = depth + 1;

            match self.run_cycle(state).await {
                Ok(CycleResult::Final(content)) => {
                    let execution_mode = if depth == 0 {
                        "direct_response".to_string()
                    } else {
                        format!("complete_depth_{}", depth + 1)
                    };
                    return TurnOutcome {
                        success: true,
                        user_message: content,
                        execution_mode,
                        error: None,
                    };
                }
                Ok(CycleResult::Continue) => continue,
                Err(e) => {
                    let message = e.to_string();
                    state.errors.push(TurnError {
                        source: format!("orchestrator.cycle_{}", depth + 1),
                        error: message.clone(),
                        timestamp: Utc::now().to_rfc3339(),
                    });
                    tracing::warn!(
                        session_id = %state.session_id,
                        cycle = depth + 1,
                        error = %message,
                        "orchestration cycle failed"
                    );
                    return TurnOutcome {
                        success: false,
                        user_message: String::new(),
                        execution_mode: "cycle_error".into(),
                        error: Some(message),
                    };
                }
            }
        }

        self.finish_at_recursion_cap(state).await
    }

    /// Reaching the cap is a soft stop, not an error: a synthesized
    /// assistant turn announces it and the run still counts as a success.
    async fn finish_at_recursion_cap(&self, state: &mut TurnState) -> TurnOutcome {
        let max = self.config.max_recursion_depth;
        let content = format!(
            "I reached the maximum recursion depth ({max}) for tool calls in a \
             single request, so I'm stopping here. The tool results gathered so \
             far are reflected above; ask me to continue for another round."
        );

        let session = state.session.clone();
        session
            .emit_event(StreamEvent::assistant_message_start(session.session_id()))
            .await;
        session
            .emit_event(StreamEvent::assistant_message_chunk(
                session.session_id(),
                MessageChunk {
                    content: content.clone(),
                    chunk_index: 0,
                    is_complete: false,
                    total_chunks: None,
                },
            ))
            .await;
        let mut end_metadata = Map::new();
        end_metadata.insert(
            "execution_mode".into(),
            Value::String("recursion_limit_reached".into()),
        );
        session
            .emit_event(StreamEvent::assistant_message_end(
                session.session_id(),
                content.clone(),
                end_metadata,
            ))
            .await;

        state.new_messages.push(
            Message::assistant(&content)
                .with_metadata(serde_json::json!({"execution_mode": "recursion_limit_reached"})),
        );

        TurnOutcome {
            success: true,
            user_message: content,
            execution_mode: "recursion_limit_reached".into(),
            error: None,
        }
    }

    /// One LLM call plus, when requested, one tool batch.
    async fn run_cycle(&self, state: &mut TurnState) -> Result<CycleResult> {
        let session = state.session.clone();

        session
            .emit_event(StreamEvent::assistant_message_start(session.session_id()))
            .await;

        let req = ChatRequest {
            messages: {
                let mut with_system = Vec::with_capacity(state.messages.len() + 1);
                with_system.push(Message::system(SYSTEM_PROMPT));
                with_system.extend(state.messages.iter().cloned());
                with_system
            },
            tools: self.tools.definitions(),
            parallel_tool_calls: true,
            temperature: Some(self.config.temperature),
            max_tokens: None,
            model: None,
        };

        let mut stream = self.provider.chat_stream(&req).await?;

        // Stream folding: display content passes through the tag filter
        // chunk by chunk; tool-call fragments accumulate under their
        // stream index as raw JSON text.
        #[derive(Default)]
        struct PendingCall {
            id: String,
            name: String,
            arguments: String,
        }

        let mut filter = ToolTagFilter::new();
        let mut content = String::new();
        let mut chunk_index: u64 = 0;
        let mut pending: BTreeMap<usize, PendingCall> = BTreeMap::new();

        while let Some(delta) = stream.next().await {
            match delta? {
                LlmDelta::Content { text } => {
                    let cleaned = filter.push(&text);
                    if !cleaned.is_empty() {
                        content.push_str(&cleaned);
                        session
                            .emit_event(StreamEvent::assistant_message_chunk(
                                session.session_id(),
                                MessageChunk {
                                    content: cleaned,
                                    chunk_index,
                                    is_complete: false,
                                    total_chunks: None,
                                },
                            ))
                            .await;
                        chunk_index += 1;
                    }
                }
                LlmDelta::ToolCallStart { index, id, name } => {
                    let entry = pending.entry(index).or_default();
                    if !id.is_empty() {
                        entry.id = id;
                    }
                    if !name.is_empty() {
                        entry.name = name;
                    }
                }
                LlmDelta::ToolCallArguments { index, fragment } => {
                    pending.entry(index).or_default().arguments.push_str(&fragment);
                }
                LlmDelta::Done { usage, .. } => {
                    if let Some(usage) = usage {
                        tracing::debug!(
                            session_id = %state.session_id,
                            prompt_tokens = usage.prompt_tokens,
                            completion_tokens = usage.completion_tokens,
                            "llm call finished"
                        );
                    }
                }
            }
        }

        // A trailing prefix the filter held back (it never became a tag).
        let trailing = filter.finish();
        if !trailing.is_empty() {
            content.push_str(&trailing);
            session
                .emit_event(StreamEvent::assistant_message_chunk(
                    session.session_id(),
                    MessageChunk {
                        content: trailing,
                        chunk_index,
                        is_complete: false,
                        total_chunks: None,
                    },
                ))
                .await;
        }

        // Assemble the tool calls, parsing argument text only now that
        // each call's JSON is complete.
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        for (_, call) in pending {
            if call.id.is_empty() {
                continue;
            }
            let arguments = if call.arguments.trim().is_empty() {
                Value::Object(Default::default())
            } else {
                match serde_json::from_str(&call.arguments) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(
                            call_id = %call.id,
                            tool = %call.name,
                            error = %e,
                            "tool call arguments are not valid JSON; defaulting to empty object"
                        );
                        Value::Object(Default::default())
                    }
                }
            };
            tool_calls.push(ToolCall {
                call_id: call.id,
                tool_name: call.name,
                arguments,
            });
        }

        let mut end_metadata = Map::new();
        if !tool_calls.is_empty() {
            end_metadata.insert("tool_calls".into(), serde_json::to_value(&tool_calls)?);
        }
        session
            .emit_event(StreamEvent::assistant_message_end(
                session.session_id(),
                content.clone(),
                end_metadata,
            ))
            .await;

        let assistant = Message::assistant_with_tools(&content, tool_calls.clone());
        state.new_messages.push(assistant.clone());
        state.messages.push(assistant);

        if tool_calls.is_empty() {
            return Ok(CycleResult::Final(content));
        }

        let outcomes = executor::execute(
            &self.tools,
            &tool_calls,
            &session,
            Duration::from_secs(self.config.tool_timeout_secs),
        )
        .await;

        // Tool messages keep the original call order even when the calls
        // themselves finished out of order.
        for outcome in &outcomes {
            let tool_message = Message::tool(outcome.message_content(), &outcome.call_id);
            state.new_messages.push(tool_message.clone());
            state.messages.push(tool_message);

            if outcome.success {
                extract_tool_result(&mut state.extracted, &outcome.tool_name, &outcome.result);
            }
        }
        state.tool_outcomes.extend(outcomes);

        Ok(CycleResult::Continue)
    }
}

/// Copy a completed tool's structured output into its canonical slot.
fn extract_tool_result(extracted: &mut BTreeMap<String, Value>, tool_name: &str, result: &Value) {
    match tool_name {
        "tool_recommend" => {
            // The interesting payload is the recommendation list itself
            // when the tool nests it.
            let payload = result
                .get("recommended_tools")
                .cloned()
                .unwrap_or_else(|| result.clone());
            if !payload.is_null() {
                extracted.insert("recommended_tools".into(), payload);
            }
        }
        "research" => {
            if !result.is_null() {
                extracted.insert("research_findings".into(), result.clone());
            }
        }
        "short_planning" => {
            if !result.is_null() {
                extracted.insert("short_planning".into(), result.clone());
            }
        }
        _ => {}
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;
    use pw_domain::error::Error;
    use pw_domain::stream::BoxStream;
    use pw_providers::traits::ChatResponse;
    use std::collections::VecDeque;

    /// Provider that plays back scripted delta sequences, one per
    /// `chat_stream` call. When the queue runs dry it repeats the last
    /// script (that is what an always-tool-calling model looks like).
    pub struct ScriptedProvider {
        scripts: Mutex<VecDeque<Vec<LlmDelta>>>,
        last: Mutex<Option<Vec<LlmDelta>>>,
    }

    impl ScriptedProvider {
        pub fn new(scripts: Vec<Vec<LlmDelta>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                last: Mutex::new(None),
            })
        }

        pub fn text_turn(parts: &[&str]) -> Vec<LlmDelta> {
            let mut deltas: Vec<LlmDelta> = parts
                .iter()
                .map(|p| LlmDelta::Content {
                    text: p.to_string(),
                })
                .collect();
            deltas.push(LlmDelta::Done {
                usage: None,
                finish_reason: Some("stop".into()),
            });
            deltas
        }

        pub fn tool_turn(calls: &[(&str, &str, &str)]) -> Vec<LlmDelta> {
            let mut deltas = Vec::new();
            for (index, (id, name, args)) in calls.iter().enumerate() {
                deltas.push(LlmDelta::ToolCallStart {
                    index,
                    id: id.to_string(),
                    name: name.to_string(),
                });
                // Split the argument text to exercise fragment assembly.
                let mid = args.len() / 2;
                deltas.push(LlmDelta::ToolCallArguments {
                    index,
                    fragment: args[..mid].to_string(),
                });
                deltas.push(LlmDelta::ToolCallArguments {
                    index,
                    fragment: args[mid..].to_string(),
                });
            }
            deltas.push(LlmDelta::Done {
                usage: None,
                finish_reason: Some("tool_calls".into()),
            });
            deltas
        }
    }

    #[async_trait::async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn chat(&self, _req: &ChatRequest) -> pw_domain::error::Result<ChatResponse> {
            Err(Error::Other("scripted provider is streaming-only".into()))
        }

        async fn chat_stream(
            &self,
            _req: &ChatRequest,
        ) -> pw_domain::error::Result<BoxStream<'static, pw_domain::error::Result<LlmDelta>>>
        {
            let script = {
                let mut scripts = self.scripts.lock();
                match scripts.pop_front() {
                    Some(script) => {
                        *self.last.lock() = Some(script.clone());
                        script
                    }
                    None => self
                        .last
                        .lock()
                        .clone()
                        .ok_or_else(|| Error::Other("no scripted turns".into()))?,
                }
            };
            Ok(Box::pin(futures_util::stream::iter(
                script.into_iter().map(Ok),
            )))
        }

        fn provider_id(&self) -> &str {
            "scripted"
        }
    }

    /// Event collector handler shared by the runtime tests.
    pub struct Collector {
        pub events: Mutex<Vec<StreamEvent>>,
    }

    impl Collector {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
            })
        }

        pub fn kinds(&self) -> Vec<&'static str> {
            self.events.lock().iter().map(|e| e.kind.as_str()).collect()
        }

        pub fn chunk_texts(&self) -> Vec<String> {
            self.events
                .lock()
                .iter()
                .filter_map(|e| match &e.data {
                    pw_streaming::event::EventData::AssistantMessageChunk(c) => {
                        Some(c.content.clone())
                    }
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl pw_streaming::StreamHandler for Collector {
        async fn handle_event(&self, event: &StreamEvent) -> pw_domain::error::Result<()> {
            self.events.lock().push(event.clone());
            Ok(())
        }
        async fn handle_error(&self, _error: &Error, _session_id: &str) {}
        async fn close(&self) {}
    }

    pub fn live_session() -> (Arc<StreamingSession>, Arc<Collector>) {
        let session = Arc::new(StreamingSession::new("s1"));
        session.start();
        let collector = Collector::new();
        session.add_handler(collector.clone());
        (session, collector)
    }
}
