//! Parallel tool dispatch.
//!
//! A batch of tool calls from one assistant turn runs concurrently:
//! `tool_call_start` events go out in parse order before dispatch, each
//! invocation runs in its own future with a timeout, and `tool_call_end`
//! events fire as calls finish (any order). The returned outcomes preserve
//! the input order regardless of completion order, and one call failing
//! never cancels its siblings.
//!
//! The executor never touches persistence; the caller turns outcomes into
//! audit rows after the run.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use pw_domain::tool::ToolCall;
use pw_streaming::{StreamEvent, StreamingSession, ToolCallStatus, ToolStatus};

use super::tools::ToolRegistry;

/// Result of one tool invocation, in `ToolExecution` shape.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
    /// The tool's JSON result; `Null` on failure.
    pub result: Value,
    pub success: bool,
    /// Seconds spent executing.
    pub execution_time: f64,
    pub started_at: String,
    pub completed_at: String,
    pub error: Option<String>,
}

impl ToolOutcome {
    /// The serialized envelope appended to history as the tool message.
    pub fn message_content(&self) -> String {
        if self.success {
            self.result.to_string()
        } else {
            serde_json::json!({
                "success": false,
                "error": self.error.as_deref().unwrap_or("unknown error"),
            })
            .to_string()
        }
    }
}

/// Run a batch of tool calls concurrently. Output order matches input
/// order.
pub async fn execute(
    registry: &ToolRegistry,
    calls: &[ToolCall],
    session: &Arc<StreamingSession>,
    default_timeout: Duration,
) -> Vec<ToolOutcome> {
    // Starts are emitted in parse order, before anything runs.
    for call in calls {
        session
            .emit_event(StreamEvent::tool_call_start(
                session.session_id(),
                ToolCallStatus::starting(&call.tool_name, &call.call_id)
                    .with_arguments(call.arguments.clone()),
            ))
            .await;
    }

    let futures: Vec<_> = calls
        .iter()
        .map(|call| run_one(registry, call, session, default_timeout))
        .collect();

    futures_util::future::join_all(futures).await
}

async fn run_one(
    registry: &ToolRegistry,
    call: &ToolCall,
    session: &Arc<StreamingSession>,
    default_timeout: Duration,
) -> ToolOutcome {
    let started_at = Utc::now().to_rfc3339();
    let clock = std::time::Instant::now();

    let invocation: Result<Value, String> = async {
        // Arguments are forwarded as-is; the only shape requirement is
        // that they form a JSON object.
        if !call.arguments.is_object() {
            return Err("tool arguments must be a JSON object".to_string());
        }

        let Some(tool) = registry.get(&call.tool_name) else {
            return Err(format!("unknown tool: {}", call.tool_name));
        };

        let timeout = tool.timeout().unwrap_or(default_timeout);
        match tokio::time::timeout(
            timeout,
            tool.invoke(call.arguments.clone(), session.clone()),
        )
        .await
        {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("timeout".to_string()),
        }
    }
    .await;

    let execution_time = clock.elapsed().as_secs_f64();
    let completed_at = Utc::now().to_rfc3339();

    let outcome = match invocation {
        Ok(result) => ToolOutcome {
            call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
            arguments: call.arguments.clone(),
            result,
            success: true,
            execution_time,
            started_at,
            completed_at,
            error: None,
        },
        Err(error) => {
            tracing::warn!(
                tool = %call.tool_name,
                call_id = %call.call_id,
                error = %error,
                "tool call failed"
            );
            ToolOutcome {
                call_id: call.call_id.clone(),
                tool_name: call.tool_name.clone(),
                arguments: call.arguments.clone(),
                result: Value::Null,
                success: false,
                execution_time,
                started_at,
                completed_at,
                error: Some(error),
            }
        }
    };

    // Ends fire per-call as each finishes; arrival order is whatever the
    // tools' latencies dictate.
    session
        .emit_event(StreamEvent::tool_call_end(
            session.session_id(),
            ToolCallStatus {
                tool_name: outcome.tool_name.clone(),
                status: if outcome.success {
                    ToolStatus::Completed
                } else {
                    ToolStatus::Failed
                },
                call_id: Some(outcome.call_id.clone()),
                progress_message: None,
                arguments: Some(outcome.arguments.clone()),
                result: outcome.success.then(|| outcome.result.clone()),
                execution_time: Some(outcome.execution_time),
                error_message: outcome.error.clone(),
            },
        ))
        .await;

    outcome
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::tools::test_tools::ScriptedTool;
    use crate::runtime::tools::AgentTool;
    use pw_domain::error::{Error, Result};
    use pw_streaming::StreamHandler;

    /// Collects events for assertions.
    struct Collector {
        events: parking_lot::Mutex<Vec<StreamEvent>>,
    }

    impl Collector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: parking_lot::Mutex::new(Vec::new()),
            })
        }

        fn kinds(&self) -> Vec<String> {
            self.events
                .lock()
                .iter()
                .map(|e| e.kind.as_str().to_string())
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl StreamHandler for Collector {
        async fn handle_event(&self, event: &StreamEvent) -> Result<()> {
            self.events.lock().push(event.clone());
            Ok(())
        }
        async fn handle_error(&self, _error: &Error, _session_id: &str) {}
        async fn close(&self) {}
    }

    fn session_with_collector() -> (Arc<StreamingSession>, Arc<Collector>) {
        let session = Arc::new(StreamingSession::new("s1"));
        session.start();
        let collector = Collector::new();
        session.add_handler(collector.clone());
        (session, collector)
    }

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall {
            call_id: id.into(),
            tool_name: name.into(),
            arguments: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn outcomes_preserve_input_order() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(ScriptedTool {
            tool_name: "slow".into(),
            result: serde_json::json!("slow result"),
            fail_with: None,
            delay: Some(Duration::from_millis(50)),
            call_timeout: None,
        }));
        registry.register(ScriptedTool::ok("fast", serde_json::json!("fast result")));

        let (session, _collector) = session_with_collector();
        let outcomes = execute(
            &registry,
            &[call("c1", "slow"), call("c2", "fast")],
            &session,
            Duration::from_secs(5),
        )
        .await;

        assert_eq!(outcomes[0].call_id, "c1");
        assert_eq!(outcomes[0].result, serde_json::json!("slow result"));
        assert_eq!(outcomes[1].call_id, "c2");
    }

    #[tokio::test]
    async fn starts_precede_all_ends() {
        let registry = ToolRegistry::new();
        registry.register(ScriptedTool::ok("a", serde_json::json!(1)));
        registry.register(ScriptedTool::ok("b", serde_json::json!(2)));

        let (session, collector) = session_with_collector();
        execute(
            &registry,
            &[call("c1", "a"), call("c2", "b")],
            &session,
            Duration::from_secs(5),
        )
        .await;

        let kinds = collector.kinds();
        assert_eq!(
            &kinds[..2],
            &["tool_call_start".to_string(), "tool_call_start".to_string()]
        );
        assert_eq!(
            kinds.iter().filter(|k| *k == "tool_call_end").count(),
            2
        );
    }

    #[tokio::test]
    async fn failure_does_not_cancel_siblings() {
        let registry = ToolRegistry::new();
        registry.register(ScriptedTool::failing("bad", "HTTP 500"));
        registry.register(ScriptedTool::ok("good", serde_json::json!("ok")));

        let (session, _collector) = session_with_collector();
        let outcomes = execute(
            &registry,
            &[call("c1", "bad"), call("c2", "good")],
            &session,
            Duration::from_secs(5),
        )
        .await;

        assert!(!outcomes[0].success);
        assert!(outcomes[0].error.as_deref().unwrap().contains("HTTP 500"));
        let envelope: Value = serde_json::from_str(&outcomes[0].message_content()).unwrap();
        assert_eq!(envelope["success"], false);
        assert!(envelope["error"].as_str().unwrap().contains("HTTP 500"));
        assert!(outcomes[1].success);
    }

    #[tokio::test]
    async fn timeout_reports_as_failed() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(ScriptedTool {
            tool_name: "hang".into(),
            result: Value::Null,
            fail_with: None,
            delay: Some(Duration::from_secs(60)),
            call_timeout: Some(Duration::from_millis(20)),
        }));

        let (session, _collector) = session_with_collector();
        let outcomes = execute(
            &registry,
            &[call("c1", "hang")],
            &session,
            Duration::from_secs(5),
        )
        .await;

        assert!(!outcomes[0].success);
        assert_eq!(outcomes[0].error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn unknown_tool_and_bad_arguments_fail_cleanly() {
        let registry = ToolRegistry::new();
        let (session, _collector) = session_with_collector();

        let mut bad_args = call("c2", "whatever");
        bad_args.arguments = serde_json::json!("not an object");

        let outcomes = execute(
            &registry,
            &[call("c1", "missing"), bad_args],
            &session,
            Duration::from_secs(5),
        )
        .await;

        assert!(outcomes[0].error.as_deref().unwrap().contains("unknown tool"));
        assert!(outcomes[1]
            .error
            .as_deref()
            .unwrap()
            .contains("JSON object"));
    }

    #[tokio::test]
    async fn tool_can_emit_progress() {
        struct ProgressTool;

        #[async_trait::async_trait]
        impl AgentTool for ProgressTool {
            fn name(&self) -> &str {
                "progress"
            }
            fn description(&self) -> &str {
                ""
            }
            fn parameters(&self) -> Value {
                serde_json::json!({"type": "object"})
            }
            async fn invoke(
                &self,
                _arguments: Value,
                session: Arc<StreamingSession>,
            ) -> Result<Value> {
                session
                    .emit_event(StreamEvent::tool_call_progress(
                        session.session_id(),
                        pw_streaming::ToolCallStatus {
                            tool_name: "progress".into(),
                            status: pw_streaming::ToolStatus::Running,
                            call_id: Some("c1".into()),
                            progress_message: Some("halfway".into()),
                            arguments: None,
                            result: None,
                            execution_time: None,
                            error_message: None,
                        },
                    ))
                    .await;
                Ok(serde_json::json!("done"))
            }
        }

        let registry = ToolRegistry::new();
        registry.register(Arc::new(ProgressTool));

        let (session, collector) = session_with_collector();
        execute(
            &registry,
            &[call("c1", "progress")],
            &session,
            Duration::from_secs(5),
        )
        .await;

        assert!(collector
            .kinds()
            .contains(&"tool_call_progress".to_string()));
    }
}
