use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use pw_domain::tool::Message;

/// A `sessions` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
    pub project_stage: String,
    pub total_messages: i64,
    pub total_tokens: i64,
    pub metadata: Value,
    pub status: String,
}

/// A `compressed_context` row with its JSON columns parsed.
#[derive(Debug, Clone)]
pub struct CompressedContextRecord {
    pub context_id: String,
    pub session_id: String,
    pub compression_version: i64,
    pub created_at: String,
    pub original_message_count: i64,
    pub compressed_message_count: i64,
    pub original_token_count: i64,
    pub compressed_token_count: i64,
    pub compression_ratio: f64,
    pub compressed_messages: Vec<Message>,
    pub summary: String,
    pub key_decisions: Vec<String>,
    pub tool_execution_results: BTreeMap<String, Value>,
    pub is_active: bool,
}

/// A `tool_executions` audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecutionRecord {
    pub execution_id: String,
    pub session_id: String,
    pub message_id: Option<String>,
    pub tool_name: String,
    pub arguments: Value,
    pub result: Option<Value>,
    pub success: bool,
    /// Seconds spent executing.
    pub execution_time: f64,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub error_message: Option<String>,
}

/// One full-text search hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub session_id: String,
    pub title: String,
    pub message_id: String,
    pub snippet: String,
}

/// Per-session statistics assembled from the counters and audit tables.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatistics {
    pub session_id: String,
    pub total_messages: i64,
    pub total_tokens: i64,
    pub messages_by_role: BTreeMap<String, i64>,
    pub tool_execution_count: i64,
    pub compression_version: i64,
    pub compressed_message_count: i64,
}

/// Store-wide statistics.
#[derive(Debug, Clone, Serialize)]
pub struct GlobalStatistics {
    pub session_count: i64,
    pub message_count: i64,
    pub tool_execution_count: i64,
}
