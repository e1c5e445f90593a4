//! Terminal renderer for conversation events.
//!
//! Streams assistant chunks onto a single line that ends at
//! `assistant_message_end`, keeps tool-call lines from interleaving with an
//! in-progress message (a newline is flushed first), and prints a summary
//! of still-active tools when closed mid-run.

use std::collections::HashMap;
use std::io::Write;

use chrono::DateTime;
use parking_lot::Mutex;

use pw_domain::error::{Error, Result};

use crate::event::{EventData, StreamEvent, StreamEventKind, ToolStatus};
use crate::handler::StreamHandler;

pub struct TerminalHandler {
    show_timestamps: bool,
    show_metadata: bool,
    // Sink and render state live behind one lock so output never interleaves.
    inner: Mutex<Inner>,
}

struct Inner {
    sink: Box<dyn Write + Send>,
    message_active: bool,
    current_message: String,
    /// call_id → tool name for tools that started but haven't ended.
    active_tools: HashMap<String, String>,
    closed: bool,
}

impl TerminalHandler {
    pub fn stdout(show_timestamps: bool, show_metadata: bool) -> Self {
        Self::new(Box::new(std::io::stdout()), show_timestamps, show_metadata)
    }

    pub fn new(sink: Box<dyn Write + Send>, show_timestamps: bool, show_metadata: bool) -> Self {
        Self {
            show_timestamps,
            show_metadata,
            inner: Mutex::new(Inner {
                sink,
                message_active: false,
                current_message: String::new(),
                active_tools: HashMap::new(),
                closed: false,
            }),
        }
    }

    fn prefix(&self, event: &StreamEvent) -> String {
        if !self.show_timestamps {
            return String::new();
        }
        let time = DateTime::parse_from_rfc3339(&event.timestamp)
            .map(|dt| dt.format("%H:%M:%S").to_string())
            .unwrap_or_else(|_| event.timestamp.chars().take(8).collect());
        format!("[{time}] ")
    }
}

impl Inner {
    fn write(&mut self, text: &str) -> Result<()> {
        self.sink.write_all(text.as_bytes()).map_err(Error::Io)?;
        self.sink.flush().map_err(Error::Io)
    }

    /// End an in-progress assistant line before printing anything else.
    fn break_message_line(&mut self) -> Result<()> {
        if self.message_active {
            self.write("\n")?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StreamHandler for TerminalHandler {
    async fn handle_event(&self, event: &StreamEvent) -> Result<()> {
        let prefix = self.prefix(event);
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }

        match (&event.kind, &event.data) {
            (StreamEventKind::ConversationStart, EventData::ConversationStart { user_input }) => {
                inner.write(&format!("{prefix}=== processing: {user_input} ===\n"))?;
            }
            (StreamEventKind::AssistantMessageStart, _) => {
                if !inner.message_active {
                    inner.write(&format!("{prefix}assistant> "))?;
                    inner.message_active = true;
                    inner.current_message.clear();
                }
            }
            (StreamEventKind::AssistantMessageChunk, EventData::AssistantMessageChunk(chunk)) => {
                if !chunk.content.is_empty() {
                    inner.write(&chunk.content)?;
                    let text = chunk.content.clone();
                    inner.current_message.push_str(&text);
                }
            }
            (
                StreamEventKind::AssistantMessageEnd,
                EventData::AssistantMessageEnd {
                    complete_message, ..
                },
            ) => {
                if inner.message_active {
                    inner.write("\n")?;
                    inner.message_active = false;
                    // A mismatch means chunks were dropped somewhere upstream.
                    if !complete_message.is_empty() && *complete_message != inner.current_message {
                        let text = complete_message.clone();
                        inner.write(&format!("{prefix}full reply: {text}\n"))?;
                    }
                    inner.current_message.clear();
                }
            }
            (StreamEventKind::ToolCallStart, EventData::ToolCall(status)) => {
                inner.break_message_line()?;
                inner.write(&format!("{prefix}[tool {}] started\n", status.tool_name))?;
                let call_id = status.call_id.clone().unwrap_or_default();
                inner.active_tools.insert(call_id, status.tool_name.clone());
            }
            (StreamEventKind::ToolCallProgress, EventData::ToolCall(status)) => {
                if let Some(progress) = &status.progress_message {
                    let line = format!("{prefix}[tool {}] {progress}\n", status.tool_name);
                    inner.write(&line)?;
                }
            }
            (StreamEventKind::ToolCallEnd, EventData::ToolCall(status)) => {
                let line = match status.status {
                    ToolStatus::Failed => format!(
                        "{prefix}[tool {}] failed: {}\n",
                        status.tool_name,
                        status.error_message.as_deref().unwrap_or("unknown error")
                    ),
                    _ => format!(
                        "{prefix}[tool {}] completed in {:.2}s\n",
                        status.tool_name,
                        status.execution_time.unwrap_or(0.0)
                    ),
                };
                inner.write(&line)?;
                if let Some(call_id) = &status.call_id {
                    inner.active_tools.remove(call_id);
                }
            }
            (
                StreamEventKind::ProcessingStatus,
                EventData::ProcessingStatus { status_message, .. },
            ) => {
                inner.break_message_line()?;
                inner.write(&format!("{prefix}* {status_message}\n"))?;
            }
            (
                StreamEventKind::DesignDocumentGenerated,
                EventData::DesignDocumentGenerated { filename, .. },
            ) => {
                inner.break_message_line()?;
                inner.write(&format!("{prefix}[document] {filename} generated\n"))?;
            }
            (
                StreamEventKind::Error,
                EventData::Error {
                    error_message,
                    error_details,
                },
            ) => {
                inner.break_message_line()?;
                inner.message_active = false;
                inner.write(&format!("{prefix}error: {error_message}\n"))?;
                if self.show_metadata && !error_details.is_empty() {
                    let details = serde_json::Value::Object(error_details.clone()).to_string();
                    inner.write(&format!("{prefix}  details: {details}\n"))?;
                }
            }
            (StreamEventKind::ConversationEnd, EventData::ConversationEnd(summary)) => {
                inner.break_message_line()?;
                inner.message_active = false;
                let verdict = if summary.success { "done" } else { "failed" };
                inner.write(&format!(
                    "{prefix}=== {verdict} in {:.2}s ===\n",
                    summary.execution_time
                ))?;
                if self.show_metadata {
                    let count = summary.new_messages_count;
                    inner.write(&format!("{prefix}  {count} new message(s)\n"))?;
                }
            }
            // Kind/data mismatch: nothing sensible to render.
            _ => {}
        }

        Ok(())
    }

    async fn handle_error(&self, error: &Error, _session_id: &str) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        let _ = inner.break_message_line();
        let _ = inner.write(&format!("handler error: {error}\n"));
    }

    async fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;

        if !inner.active_tools.is_empty() {
            let count = inner.active_tools.len();
            let _ = inner.write(&format!("interrupted {count} active tool call(s)\n"));
        }
        if inner.message_active {
            let _ = inner.write("\n");
            inner.message_active = false;
        }
        inner.active_tools.clear();
        inner.current_message.clear();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
