//! Tool contract and registry.
//!
//! Tool bodies live outside the core; the orchestrator only ever sees this
//! registry: a name, a JSON-schema for arguments, and an async invoke
//! function. Long-running tools receive the streaming session so they can
//! emit `tool_call_progress` events themselves. The full catalog is
//! advertised to the LLM on every call, never filtered by state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;

use pw_domain::error::Result;
use pw_domain::tool::ToolDefinition;
use pw_streaming::StreamingSession;

#[async_trait::async_trait]
pub trait AgentTool: Send + Sync {
    /// Unique tool name advertised to the LLM.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the tool's arguments.
    fn parameters(&self) -> Value;

    /// Per-call timeout override. `None` uses the orchestrator default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn invoke(&self, arguments: Value, session: Arc<StreamingSession>) -> Result<Value>;
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn AgentTool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. A later registration under the same name wins.
    pub fn register(&self, tool: Arc<dyn AgentTool>) {
        let name = tool.name().to_string();
        if self.tools.write().insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "tool re-registered; replacing prior definition");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentTool>> {
        self.tools.read().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }

    /// The catalog advertised to the LLM, sorted for stable ordering.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let tools = self.tools.read();
        let mut defs: Vec<ToolDefinition> = tools
            .values()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}

#[cfg(test)]
pub(crate) mod test_tools {
    use super::*;
    use pw_domain::error::Error;

    /// Configurable test tool: fixed result, optional failure or delay.
    pub struct ScriptedTool {
        pub tool_name: String,
        pub result: Value,
        pub fail_with: Option<String>,
        pub delay: Option<Duration>,
        pub call_timeout: Option<Duration>,
    }

    impl ScriptedTool {
        pub fn ok(name: &str, result: Value) -> Arc<Self> {
            Arc::new(Self {
                tool_name: name.into(),
                result,
                fail_with: None,
                delay: None,
                call_timeout: None,
            })
        }

        pub fn failing(name: &str, error: &str) -> Arc<Self> {
            Arc::new(Self {
                tool_name: name.into(),
                result: Value::Null,
                fail_with: Some(error.into()),
                delay: None,
                call_timeout: None,
            })
        }
    }

    #[async_trait::async_trait]
    impl AgentTool for ScriptedTool {
        fn name(&self) -> &str {
            &self.tool_name
        }

        fn description(&self) -> &str {
            "test tool"
        }

        fn parameters(&self) -> Value {
            serde_json::json!({"type": "object", "properties": {}})
        }

        fn timeout(&self) -> Option<Duration> {
            self.call_timeout
        }

        async fn invoke(
            &self,
            _arguments: Value,
            _session: Arc<StreamingSession>,
        ) -> Result<Value> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match &self.fail_with {
                Some(message) => Err(Error::Tool {
                    tool: self.tool_name.clone(),
                    message: message.clone(),
                }),
                None => Ok(self.result.clone()),
            }
        }
    }
}
