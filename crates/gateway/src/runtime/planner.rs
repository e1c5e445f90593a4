//! Stateless planner entry.
//!
//! One call = one orchestration run. The planner owns the conversation
//! envelope on the stream (`conversation_start` … `conversation_end`),
//! validates the incoming context, hands a fresh [`TurnState`] to the
//! orchestrator, and shapes the outcome into the [`AgentResult`] delta the
//! caller persists. It holds no state of its own between calls.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};

use pw_domain::config::OrchestratorConfig;
use pw_domain::context::{AgentContext, AgentResult};
use pw_domain::tool::Message;
use pw_providers::filter::strip_tool_tags;
use pw_providers::traits::LlmProvider;
use pw_streaming::event::ConversationSummary;
use pw_streaming::{StreamEvent, StreamingSession};

use super::executor::ToolOutcome;
use super::orchestrator::{Orchestrator, TurnState};
use super::tools::ToolRegistry;

pub struct Planner {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    config: OrchestratorConfig,
}

/// The run's delta plus the raw tool outcomes for the audit writer.
pub struct PlannerRun {
    pub result: AgentResult,
    pub tool_outcomes: Vec<ToolOutcome>,
}

impl Planner {
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

    /// Process one user utterance against a session context.
    pub async fn process(
        &self,
        user_input: &str,
        context: &AgentContext,
        session: Arc<StreamingSession>,
    ) -> PlannerRun {
        let clock = Instant::now();

        // Working history: sanitized prior messages plus the new user
        // message. Validation runs on this augmented shape (an empty
        // session is fine — the user message is about to be part of it).
        let mut history = sanitize_history(&context.dialogue_history);
        history.push(Message::user(user_input));

        let augmented = AgentContext {
            session_id: context.session_id.clone(),
            dialogue_history: history,
            tool_execution_results: context.tool_execution_results.clone(),
            session_metadata: context.session_metadata.clone(),
            is_compressed: context.is_compressed,
        };
        if user_input.trim().is_empty() {
            return self
                .reject(
                    &session,
                    "user input must not be empty",
                    clock.elapsed().as_secs_f64(),
                )
                .await;
        }
        if let Err(e) = augmented.validate() {
            return self
                .reject(&session, &e.to_string(), clock.elapsed().as_secs_f64())
                .await;
        }

        session
            .emit_event(StreamEvent::conversation_start(
                session.session_id(),
                user_input,
            ))
            .await;
        session
            .emit_event(StreamEvent::processing_status(
                session.session_id(),
                "initializing planning run",
                Map::new(),
            ))
            .await;

        let mut state = TurnState::new(
            augmented.session_id.clone(),
            augmented.dialogue_history,
            session.clone(),
        );

        let orchestrator =
            Orchestrator::new(self.provider.clone(), self.tools.clone(), self.config.clone());
        let outcome = orchestrator.run(&mut state).await;

        let execution_time = clock.elapsed().as_secs_f64();
        let result = if outcome.success {
            AgentResult::success(
                state.new_messages.clone(),
                state.extracted.clone(),
                execution_time,
                serde_json::json!({"execution_mode": outcome.execution_mode}),
            )
        } else {
            let error = outcome
                .error
                .clone()
                .unwrap_or_else(|| "orchestration failed".to_string());
            AgentResult::failure(
                error,
                execution_time,
                serde_json::json!({"execution_mode": outcome.execution_mode}),
            )
        };

        if let Some(error) = &result.error {
            session
                .emit_event(StreamEvent::error(
                    session.session_id(),
                    error,
                    Map::new(),
                ))
                .await;
        }

        let updates = (!result.tool_execution_results_updates.is_empty()).then(|| {
            result
                .tool_execution_results_updates
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Map<String, Value>>()
        });
        session
            .emit_event(StreamEvent::conversation_end(
                session.session_id(),
                ConversationSummary {
                    success: result.success,
                    execution_time,
                    new_messages_count: result.new_messages.len() as u64,
                    error: result.error.clone(),
                    tool_execution_results_updates: updates,
                },
            ))
            .await;

        PlannerRun {
            result,
            tool_outcomes: state.tool_outcomes,
        }
    }

    /// Boundary validation failure: one `error` event, no orchestration.
    async fn reject(
        &self,
        session: &Arc<StreamingSession>,
        message: &str,
        execution_time: f64,
    ) -> PlannerRun {
        let mut details = Map::new();
        details.insert("error_type".into(), Value::String("ValidationError".into()));
        session
            .emit_event(StreamEvent::error(session.session_id(), message, details))
            .await;

        PlannerRun {
            result: AgentResult::failure(
                message,
                execution_time,
                serde_json::json!({"error_type": "ValidationError"}),
            ),
            tool_outcomes: Vec::new(),
        }
    }
}

/// Strip legacy textual tool-call spans from stored history before it goes
/// back to the LLM.
fn sanitize_history(history: &[Message]) -> Vec<Message> {
    history
        .iter()
        .map(|message| {
            if message.content.contains("<tool_call") {
                let mut cleaned = message.clone();
                cleaned.content = strip_tool_tags(&message.content);
                cleaned
            } else {
                message.clone()
            }
        })
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::orchestrator::test_support::{live_session, ScriptedProvider};
    use crate::runtime::tools::test_tools::ScriptedTool;
    use std::collections::BTreeMap;

    fn planner(provider: Arc<dyn LlmProvider>, tools: Arc<ToolRegistry>) -> Planner {
        Planner::new(provider, tools, OrchestratorConfig::default())
    }

    fn empty_context(session_id: &str) -> AgentContext {
        AgentContext {
            session_id: session_id.into(),
            dialogue_history: vec![],
            tool_execution_results: BTreeMap::new(),
            session_metadata: Value::Null,
            is_compressed: false,
        }
    }

    #[tokio::test]
    async fn full_event_envelope_for_single_turn() {
        let provider = ScriptedProvider::new(vec![ScriptedProvider::text_turn(&["hi ", "there"])]);
        let (session, collector) = live_session();
        let planner = planner(provider, Arc::new(ToolRegistry::new()));

        let run = planner
            .process("hello", &empty_context("s1"), session)
            .await;
        assert!(run.result.success);
        assert_eq!(run.result.final_message(), Some("hi there"));
        assert_eq!(run.result.new_messages.len(), 1);

        let kinds = collector.kinds();
        assert_eq!(kinds.first(), Some(&"conversation_start"));
        assert_eq!(kinds.get(1), Some(&"processing_status"));
        assert!(kinds.contains(&"assistant_message_start"));
        assert!(kinds.contains(&"assistant_message_end"));
        assert_eq!(kinds.last(), Some(&"conversation_end"));
    }

    #[tokio::test]
    async fn conversation_end_carries_tool_updates() {
        let provider = ScriptedProvider::new(vec![
            ScriptedProvider::tool_turn(&[("c1", "short_planning", r#"{"goal":"x"}"#)]),
            ScriptedProvider::text_turn(&["planned"]),
        ]);
        let registry = Arc::new(ToolRegistry::new());
        registry.register(ScriptedTool::ok(
            "short_planning",
            serde_json::json!({"steps": [1, 2]}),
        ));

        let (session, collector) = live_session();
        let planner = planner(provider, registry);
        let run = planner.process("plan it", &empty_context("s1"), session).await;

        assert_eq!(
            run.result.tool_execution_results_updates["short_planning"],
            serde_json::json!({"steps": [1, 2]})
        );
        assert_eq!(run.tool_outcomes.len(), 1);

        let events = collector.events.lock();
        let end = events
            .iter()
            .find(|e| e.kind == pw_streaming::StreamEventKind::ConversationEnd)
            .unwrap();
        match &end.data {
            pw_streaming::event::EventData::ConversationEnd(summary) => {
                assert!(summary.success);
                assert_eq!(summary.new_messages_count, 3);
                let updates = summary.tool_execution_results_updates.as_ref().unwrap();
                assert_eq!(updates["short_planning"], serde_json::json!({"steps": [1, 2]}));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn validation_failure_emits_error_only() {
        let provider = ScriptedProvider::new(vec![]);
        let (session, collector) = live_session();
        let planner = planner(provider, Arc::new(ToolRegistry::new()));

        let mut context = empty_context("s1");
        context.session_id = "".into();
        let run = planner.process("hello", &context, session).await;

        assert!(!run.result.success);
        assert_eq!(run.result.metadata["error_type"], "ValidationError");
        assert_eq!(collector.kinds(), vec!["error"]);
    }

    #[tokio::test]
    async fn empty_user_input_is_rejected() {
        let provider = ScriptedProvider::new(vec![]);
        let (session, collector) = live_session();
        let planner = planner(provider, Arc::new(ToolRegistry::new()));

        let run = planner.process("   ", &empty_context("s1"), session).await;
        assert!(!run.result.success);
        assert_eq!(collector.kinds(), vec!["error"]);
    }

    #[tokio::test]
    async fn llm_failure_emits_error_then_end() {
        let provider = ScriptedProvider::new(vec![]);
        let (session, collector) = live_session();
        let planner = planner(provider, Arc::new(ToolRegistry::new()));

        let run = planner.process("hello", &empty_context("s1"), session).await;
        assert!(!run.result.success);

        let kinds = collector.kinds();
        let error_pos = kinds.iter().position(|k| *k == "error").unwrap();
        let end_pos = kinds.iter().position(|k| *k == "conversation_end").unwrap();
        assert!(error_pos < end_pos);
    }

    #[tokio::test]
    async fn legacy_tool_tags_are_sanitized_from_history() {
        let history = vec![Message::assistant(
            "plan ready <tool_call>{\"name\":\"x\"}</tool_call> indeed",
        )];
        let sanitized = sanitize_history(&history);
        assert_eq!(sanitized[0].content, "plan ready  indeed");
    }
}
