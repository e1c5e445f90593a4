use chrono::Utc;
use serde::{Deserialize, Serialize};

/// A tool invocation requested by the model (OpenAI function-calling format).
/// `call_id` ties the eventual `tool` message back to this request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

/// Tool definition advertised to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's arguments.
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            other => Err(crate::error::Error::Validation(format!(
                "unknown message role: {other}"
            ))),
        }
    }
}

/// A conversational turn, strictly OpenAI-tagged.
///
/// Invariants:
/// - `tool_calls` is only present on `assistant` messages.
/// - `tool_call_id` is mandatory on `tool` messages and absent otherwise;
///   it must match a `ToolCall::call_id` from an earlier assistant message
///   of the same session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub role: Role,
    pub content: String,
    /// RFC 3339 creation time.
    pub timestamp: String,
    #[serde(default)]
    pub token_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

// ── Convenience constructors ───────────────────────────────────────

impl Message {
    fn base(role: Role, content: String) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            role,
            token_count: estimate_tokens(&content),
            content,
            timestamp: Utc::now().to_rfc3339(),
            metadata: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::base(Role::System, content.into())
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::base(Role::User, content.into())
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::base(Role::Assistant, content.into())
    }

    /// An assistant turn carrying tool calls (content may be empty).
    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::base(Role::Assistant, content.into());
        if !tool_calls.is_empty() {
            msg.tool_calls = Some(tool_calls);
        }
        msg
    }

    /// A tool-result turn answering the assistant call `tool_call_id`.
    pub fn tool(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        let mut msg = Self::base(Role::Tool, content.into());
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Rough token estimate for threshold checks and statistics.
///
/// CJK characters count as one token each; ASCII words count as one token;
/// the residue is discounted. This is an estimate, not a tokenizer.
pub fn estimate_tokens(content: &str) -> i64 {
    let cjk = content
        .chars()
        .filter(|c| ('\u{4e00}'..='\u{9fff}').contains(c))
        .count() as i64;
    let words = content
        .split_whitespace()
        .filter(|w| w.chars().any(|c| c.is_ascii_alphanumeric()))
        .count() as i64;
    let covered = cjk
        + content
            .split_whitespace()
            .map(|w| w.len() as i64)
            .sum::<i64>();
    let residue = (content.len() as i64 - covered).max(0) / 2;
    (cjk + words + residue).max(1)
}
