//! Request-scoped context and result types.
//!
//! `AgentContext` is the materialization of a session's active compressed
//! context handed to the orchestrator (read-only). `AgentResult` is the
//! delta one orchestration run produces: new messages plus tool-result map
//! updates. All persistent state flows in via the context and out via the
//! result; the orchestrator itself owns nothing durable.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::tool::{Message, Role};

/// The conversational state the orchestrator reads. Built exclusively from
/// the session's active compressed context row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentContext {
    pub session_id: String,
    /// Possibly-compressed dialogue history, oldest first.
    pub dialogue_history: Vec<Message>,
    /// Latest structured output per tool name (e.g. `recommended_tools`).
    #[serde(default)]
    pub tool_execution_results: BTreeMap<String, Value>,
    #[serde(default)]
    pub session_metadata: Value,
    /// True when the active compressed context is version > 1.
    #[serde(default)]
    pub is_compressed: bool,
}

impl AgentContext {
    /// Boundary validation: a context must name a session, carry history,
    /// and contain at least one user message.
    pub fn validate(&self) -> Result<()> {
        if self.session_id.trim().is_empty() {
            return Err(Error::Validation("session_id must be non-empty".into()));
        }
        if self.dialogue_history.is_empty() {
            return Err(Error::Validation("dialogue_history must not be empty".into()));
        }
        if !self
            .dialogue_history
            .iter()
            .any(|m| m.role == Role::User)
        {
            return Err(Error::Validation(
                "dialogue_history must contain at least one user message".into(),
            ));
        }
        Ok(())
    }

    /// The most recent user utterance, if any.
    pub fn latest_user_input(&self) -> Option<&str> {
        self.dialogue_history
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}

/// The delta returned from one orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub success: bool,
    /// Assistant and tool messages produced this run, in order.
    pub new_messages: Vec<Message>,
    /// Per-key replacement updates for the session's tool-result map.
    #[serde(default)]
    pub tool_execution_results_updates: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock seconds spent in the run.
    pub execution_time: f64,
    #[serde(default)]
    pub metadata: Value,
}

impl AgentResult {
    pub fn success(
        new_messages: Vec<Message>,
        tool_execution_results_updates: BTreeMap<String, Value>,
        execution_time: f64,
        metadata: Value,
    ) -> Self {
        Self {
            success: true,
            new_messages,
            tool_execution_results_updates,
            error: None,
            execution_time,
            metadata,
        }
    }

    pub fn failure(error: impl Into<String>, execution_time: f64, metadata: Value) -> Self {
        Self {
            success: false,
            new_messages: Vec::new(),
            tool_execution_results_updates: BTreeMap::new(),
            error: Some(error.into()),
            execution_time,
            metadata,
        }
    }

    /// The final user-visible assistant message, if the run produced one.
    pub fn final_message(&self) -> Option<&str> {
        self.new_messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant && !m.content.is_empty())
            .map(|m| m.content.as_str())
    }
}
