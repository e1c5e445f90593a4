//! The conversation event model.
//!
//! Every consumer-visible occurrence during an orchestration run is one of
//! a closed set of event kinds, each with a typed payload. Events serialize
//! two ways: as a JSON object for in-process handlers, and as an SSE frame
//! (`event: <kind>\ndata: <json>\n\n`) for HTTP clients. Decoding the
//! `data:` line of an encoded event yields a structurally equal event.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use pw_domain::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event kinds
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventKind {
    ConversationStart,
    AssistantMessageStart,
    AssistantMessageChunk,
    AssistantMessageEnd,
    ToolCallStart,
    ToolCallProgress,
    ToolCallEnd,
    DesignDocumentGenerated,
    ProcessingStatus,
    Error,
    ConversationEnd,
}

impl StreamEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamEventKind::ConversationStart => "conversation_start",
            StreamEventKind::AssistantMessageStart => "assistant_message_start",
            StreamEventKind::AssistantMessageChunk => "assistant_message_chunk",
            StreamEventKind::AssistantMessageEnd => "assistant_message_end",
            StreamEventKind::ToolCallStart => "tool_call_start",
            StreamEventKind::ToolCallProgress => "tool_call_progress",
            StreamEventKind::ToolCallEnd => "tool_call_end",
            StreamEventKind::DesignDocumentGenerated => "design_document_generated",
            StreamEventKind::ProcessingStatus => "processing_status",
            StreamEventKind::Error => "error",
            StreamEventKind::ConversationEnd => "conversation_end",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A fragment of an in-progress assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageChunk {
    pub content: String,
    pub chunk_index: u64,
    /// True only on the final chunk of a coalesced batch.
    #[serde(default)]
    pub is_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Starting,
    Running,
    Completed,
    Failed,
}

/// Progress record for one tool invocation, shared by the three
/// `tool_call_*` event kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallStatus {
    pub tool_name: String,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Seconds spent executing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ToolCallStatus {
    pub fn starting(tool_name: impl Into<String>, call_id: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            status: ToolStatus::Starting,
            call_id: Some(call_id.into()),
            progress_message: None,
            arguments: None,
            result: None,
            execution_time: None,
            error_message: None,
        }
    }

    pub fn with_arguments(mut self, arguments: Value) -> Self {
        self.arguments = Some(arguments);
        self
    }
}

/// Final-result payload of `conversation_end`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub success: bool,
    pub execution_time: f64,
    pub new_messages_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_execution_results_updates: Option<Map<String, Value>>,
}

/// Typed payload per event kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventData {
    ConversationStart {
        user_input: String,
    },
    AssistantMessageStart {},
    AssistantMessageChunk(MessageChunk),
    AssistantMessageEnd {
        complete_message: String,
        message_metadata: Map<String, Value>,
    },
    ToolCall(ToolCallStatus),
    DesignDocumentGenerated {
        filename: String,
        content: String,
    },
    ProcessingStatus {
        status_message: String,
        progress_info: Map<String, Value>,
    },
    Error {
        error_message: String,
        error_details: Map<String, Value>,
    },
    ConversationEnd(ConversationSummary),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// StreamEvent
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One tagged event on a session's stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub kind: StreamEventKind,
    /// ISO-8601 / RFC 3339 creation time.
    pub timestamp: String,
    /// Stamped by the session on emit.
    pub session_id: String,
    pub data: EventData,
    pub metadata: Map<String, Value>,
}

impl StreamEvent {
    fn new(kind: StreamEventKind, session_id: impl Into<String>, data: EventData) -> Self {
        Self {
            kind,
            timestamp: chrono::Utc::now().to_rfc3339(),
            session_id: session_id.into(),
            data,
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    // ── Builders, one per kind ─────────────────────────────────────

    pub fn conversation_start(session_id: impl Into<String>, user_input: impl Into<String>) -> Self {
        Self::new(
            StreamEventKind::ConversationStart,
            session_id,
            EventData::ConversationStart {
                user_input: user_input.into(),
            },
        )
    }

    pub fn assistant_message_start(session_id: impl Into<String>) -> Self {
        Self::new(
            StreamEventKind::AssistantMessageStart,
            session_id,
            EventData::AssistantMessageStart {},
        )
    }

    pub fn assistant_message_chunk(session_id: impl Into<String>, chunk: MessageChunk) -> Self {
        Self::new(
            StreamEventKind::AssistantMessageChunk,
            session_id,
            EventData::AssistantMessageChunk(chunk),
        )
    }

    pub fn assistant_message_end(
        session_id: impl Into<String>,
        complete_message: impl Into<String>,
        message_metadata: Map<String, Value>,
    ) -> Self {
        Self::new(
            StreamEventKind::AssistantMessageEnd,
            session_id,
            EventData::AssistantMessageEnd {
                complete_message: complete_message.into(),
                message_metadata,
            },
        )
    }

    pub fn tool_call_start(session_id: impl Into<String>, status: ToolCallStatus) -> Self {
        Self::new(
            StreamEventKind::ToolCallStart,
            session_id,
            EventData::ToolCall(status),
        )
    }

    pub fn tool_call_progress(session_id: impl Into<String>, status: ToolCallStatus) -> Self {
        Self::new(
            StreamEventKind::ToolCallProgress,
            session_id,
            EventData::ToolCall(status),
        )
    }

    pub fn tool_call_end(session_id: impl Into<String>, status: ToolCallStatus) -> Self {
        Self::new(
            StreamEventKind::ToolCallEnd,
            session_id,
            EventData::ToolCall(status),
        )
    }

    pub fn design_document_generated(
        session_id: impl Into<String>,
        filename: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::new(
            StreamEventKind::DesignDocumentGenerated,
            session_id,
            EventData::DesignDocumentGenerated {
                filename: filename.into(),
                content: content.into(),
            },
        )
    }

    pub fn processing_status(
        session_id: impl Into<String>,
        status_message: impl Into<String>,
        progress_info: Map<String, Value>,
    ) -> Self {
        Self::new(
            StreamEventKind::ProcessingStatus,
            session_id,
            EventData::ProcessingStatus {
                status_message: status_message.into(),
                progress_info,
            },
        )
    }

    pub fn error(
        session_id: impl Into<String>,
        error_message: impl Into<String>,
        error_details: Map<String, Value>,
    ) -> Self {
        Self::new(
            StreamEventKind::Error,
            session_id,
            EventData::Error {
                error_message: error_message.into(),
                error_details,
            },
        )
    }

    pub fn conversation_end(session_id: impl Into<String>, summary: ConversationSummary) -> Self {
        Self::new(
            StreamEventKind::ConversationEnd,
            session_id,
            EventData::ConversationEnd(summary),
        )
    }

    // ── Serialization ──────────────────────────────────────────────

    /// The in-process JSON form, also used as the SSE `data:` payload.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "event_type": self.kind.as_str(),
            "timestamp": self.timestamp,
            "session_id": self.session_id,
            "data": serde_json::to_value(&self.data).unwrap_or(Value::Null),
            "metadata": self.metadata,
        })
    }

    /// SSE frame form: `event: <kind>\ndata: <json>\n\n`.
    pub fn to_sse(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.kind.as_str(), self.to_json())
    }

    /// Decode the JSON carried on an SSE `data:` line back into an event.
    pub fn from_sse_data(data: &str) -> Result<Self> {
        let v: Value = serde_json::from_str(data)?;
        Self::from_json(&v)
    }

    /// Decode the in-process JSON form. The payload is parsed according to
    /// `event_type`, which is why this isn't a plain serde derive.
    pub fn from_json(v: &Value) -> Result<Self> {
        let kind: StreamEventKind =
            serde_json::from_value(v.get("event_type").cloned().unwrap_or(Value::Null))
                .map_err(|_| Error::Validation("missing or unknown event_type".into()))?;
        let data_value = v.get("data").cloned().unwrap_or(Value::Null);

        let data = match kind {
            StreamEventKind::ConversationStart => EventData::ConversationStart {
                user_input: field_str(&data_value, "user_input"),
            },
            StreamEventKind::AssistantMessageStart => EventData::AssistantMessageStart {},
            StreamEventKind::AssistantMessageChunk => {
                EventData::AssistantMessageChunk(serde_json::from_value(data_value)?)
            }
            StreamEventKind::AssistantMessageEnd => EventData::AssistantMessageEnd {
                complete_message: field_str(&data_value, "complete_message"),
                message_metadata: field_map(&data_value, "message_metadata"),
            },
            StreamEventKind::ToolCallStart
            | StreamEventKind::ToolCallProgress
            | StreamEventKind::ToolCallEnd => {
                EventData::ToolCall(serde_json::from_value(data_value)?)
            }
            StreamEventKind::DesignDocumentGenerated => EventData::DesignDocumentGenerated {
                filename: field_str(&data_value, "filename"),
                content: field_str(&data_value, "content"),
            },
            StreamEventKind::ProcessingStatus => EventData::ProcessingStatus {
                status_message: field_str(&data_value, "status_message"),
                progress_info: field_map(&data_value, "progress_info"),
            },
            StreamEventKind::Error => EventData::Error {
                error_message: field_str(&data_value, "error_message"),
                error_details: field_map(&data_value, "error_details"),
            },
            StreamEventKind::ConversationEnd => {
                EventData::ConversationEnd(serde_json::from_value(data_value)?)
            }
        };

        Ok(Self {
            kind,
            timestamp: field_str(v, "timestamp"),
            session_id: field_str(v, "session_id"),
            data,
            metadata: field_map(v, "metadata"),
        })
    }
}

fn field_str(v: &Value, key: &str) -> String {
    v.get(key)
        .and_then(|x| x.as_str())
        .unwrap_or_default()
        .to_string()
}

fn field_map(v: &Value, key: &str) -> Map<String, Value> {
    v.get(key)
        .and_then(|x| x.as_object())
        .cloned()
        .unwrap_or_default()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_frame_shape() {
        let event = StreamEvent::assistant_message_start("s1");
        let frame = event.to_sse();
        assert!(frame.starts_with("event: assistant_message_start\ndata: {"));
        assert!(frame.ends_with("\n\n"));
    }

    #[test]
    fn json_uses_snake_case_keys() {
        let event = StreamEvent::conversation_start("s1", "hello");
        let json = event.to_json();
        assert_eq!(json["event_type"], "conversation_start");
        assert_eq!(json["data"]["user_input"], "hello");
        assert_eq!(json["session_id"], "s1");
    }

    fn round_trip(event: StreamEvent) {
        let frame = event.to_sse();
        let data_line = frame
            .lines()
            .find_map(|l| l.strip_prefix("data: "))
            .expect("frame has a data line");
        let decoded = StreamEvent::from_sse_data(data_line).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn round_trip_all_kinds() {
        round_trip(StreamEvent::conversation_start("s1", "plan an api"));
        round_trip(StreamEvent::assistant_message_start("s1"));
        round_trip(StreamEvent::assistant_message_chunk(
            "s1",
            MessageChunk {
                content: "hel".into(),
                chunk_index: 3,
                is_complete: false,
                total_chunks: None,
            },
        ));
        let mut meta = Map::new();
        meta.insert("tool_calls".into(), serde_json::json!([{"id": "c1"}]));
        round_trip(StreamEvent::assistant_message_end("s1", "hello", meta));
        round_trip(StreamEvent::tool_call_start(
            "s1",
            ToolCallStatus::starting("research", "c1")
                .with_arguments(serde_json::json!({"q": "flask"})),
        ));
        round_trip(StreamEvent::tool_call_progress(
            "s1",
            ToolCallStatus {
                tool_name: "research".into(),
                status: ToolStatus::Running,
                call_id: Some("c1".into()),
                progress_message: Some("fetching".into()),
                arguments: None,
                result: None,
                execution_time: None,
                error_message: None,
            },
        ));
        round_trip(StreamEvent::tool_call_end(
            "s1",
            ToolCallStatus {
                tool_name: "research".into(),
                status: ToolStatus::Failed,
                call_id: Some("c1".into()),
                progress_message: None,
                arguments: None,
                result: None,
                execution_time: Some(1.5),
                error_message: Some("HTTP 500".into()),
            },
        ));
        round_trip(StreamEvent::design_document_generated(
            "s1", "design.md", "# Design",
        ));
        round_trip(StreamEvent::processing_status(
            "s1",
            "initializing",
            Map::new(),
        ));
        round_trip(StreamEvent::error("s1", "boom", Map::new()));
        let mut updates = Map::new();
        updates.insert("short_planning".into(), serde_json::json!(["step 1"]));
        round_trip(StreamEvent::conversation_end(
            "s1",
            ConversationSummary {
                success: true,
                execution_time: 2.5,
                new_messages_count: 4,
                error: None,
                tool_execution_results_updates: Some(updates),
            },
        ));
    }

    #[test]
    fn from_json_rejects_unknown_kind() {
        let v = serde_json::json!({"event_type": "bogus", "data": {}});
        assert!(StreamEvent::from_json(&v).is_err());
    }

    #[test]
    fn tool_status_serializes_lowercase() {
        let json = serde_json::to_value(ToolStatus::Failed).unwrap();
        assert_eq!(json, "failed");
    }
}
