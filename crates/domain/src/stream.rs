use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// A boxed async stream, used for LLM streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Deltas produced while reading a streaming chat completion.
///
/// Tool-call deltas are keyed by the provider's stream `index`: the first
/// delta for an index carries the call id and tool name, subsequent deltas
/// append raw JSON argument text. Arguments are parsed only once the stream
/// is complete.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LlmDelta {
    /// A fragment of assistant content.
    Content { text: String },

    /// First sight of a tool call at `index`.
    ToolCallStart {
        index: usize,
        id: String,
        name: String,
    },

    /// Raw argument text to append to the call at `index`.
    ToolCallArguments { index: usize, fragment: String },

    /// The stream finished.
    Done {
        usage: Option<Usage>,
        finish_reason: Option<String>,
    },
}

/// Token usage for a completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn accumulate(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}
