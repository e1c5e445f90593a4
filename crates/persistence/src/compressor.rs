//! Background context compression.
//!
//! Appends grow the active compressed context without bound; once it
//! crosses the message or token threshold, the compressor rewrites it: a
//! summarizer LLM collapses the older messages into a handful of
//! structured turns, the most recent messages are kept verbatim, and the
//! DAO installs the result as a new active version in one transaction.
//! Failures are logged and swallowed — the prior active row stays
//! authoritative, and the conversation never notices.
//!
//! Scheduling is queue-based: `compress_if_needed` is cheap and returns
//! immediately; a single worker drains tasks serially so at most one
//! compression runs per process.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use pw_domain::config::CompressionConfig;
use pw_domain::error::{Error, Result};
use pw_domain::tool::{Message, Role};
use pw_providers::traits::{ChatRequest, LlmProvider};

use crate::dao::Dao;

const QUEUE_CAPACITY: usize = 32;

/// Content longer than this is elided in the summarization prompt.
const PROMPT_CONTENT_CAP: usize = 2000;

const COMPRESSION_SYSTEM_PROMPT: &str = "\
You compress long conversation histories into structured, shorter ones.

Requirements:
1. Merge similar turns into fewer, denser messages.
2. Keep every decision, conclusion, and concrete requirement.
3. Preserve the logical flow of the conversation.

Reply with JSON only, in this shape:
{
    \"compressed_messages\": [
        {\"role\": \"user\", \"content\": \"merged user intent\"},
        {\"role\": \"assistant\", \"content\": \"merged analysis and replies\"}
    ],
    \"summary\": \"one-paragraph summary of the whole conversation\",
    \"key_decisions\": [\"decision 1\", \"decision 2\"]
}";

pub struct Compressor {
    dao: Arc<Dao>,
    provider: Arc<dyn LlmProvider>,
    config: CompressionConfig,
    queue: Mutex<Option<mpsc::Sender<String>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Compressor {
    /// Create the compressor and start its worker task.
    pub fn start(
        dao: Arc<Dao>,
        provider: Arc<dyn LlmProvider>,
        config: CompressionConfig,
    ) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<String>(QUEUE_CAPACITY);

        let worker_dao = dao.clone();
        let worker_provider = provider.clone();
        let worker_config = config.clone();
        let worker = tokio::spawn(async move {
            while let Some(session_id) = rx.recv().await {
                match run_compression(&worker_dao, worker_provider.as_ref(), &worker_config, &session_id)
                    .await
                {
                    Ok(Some(version)) => {
                        tracing::info!(session_id = %session_id, version, "context compressed");
                    }
                    Ok(None) => {
                        tracing::debug!(session_id = %session_id, "compression skipped");
                    }
                    Err(e) => {
                        // Prior active row remains in force.
                        tracing::warn!(session_id = %session_id, error = %e, "compression failed");
                    }
                }
            }
        });

        Arc::new(Self {
            dao,
            provider,
            config,
            queue: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Fast threshold check against the active context's counters.
    pub fn should_compress(&self, session_id: &str) -> bool {
        if !self.config.enabled {
            return false;
        }
        match self.dao.get_active_compressed_context(session_id) {
            Ok(Some(context)) => {
                context.compressed_message_count > self.config.max_messages
                    || context.compressed_token_count > self.config.max_tokens
            }
            Ok(None) => {
                tracing::warn!(session_id, "no active compressed context; cannot check thresholds");
                false
            }
            Err(e) => {
                tracing::warn!(session_id, error = %e, "threshold check failed");
                false
            }
        }
    }

    /// Enqueue a compression task when thresholds are exceeded. Never
    /// blocks the caller; a full queue drops the task (it will re-trigger
    /// on the next append).
    pub fn compress_if_needed(&self, session_id: &str) {
        if !self.should_compress(session_id) {
            return;
        }
        let sender = self.queue.lock().clone();
        if let Some(sender) = sender {
            match sender.try_send(session_id.to_string()) {
                Ok(()) => tracing::debug!(session_id, "compression scheduled"),
                Err(e) => tracing::warn!(session_id, error = %e, "compression queue full"),
            }
        }
    }

    /// Stop accepting tasks and wait for the worker to drain.
    pub async fn stop(&self) {
        self.queue.lock().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }

    /// Direct single-session compression (bypasses the queue). Used by
    /// tests and maintenance tooling.
    pub async fn compress_now(&self, session_id: &str) -> Result<Option<i64>> {
        run_compression(&self.dao, self.provider.as_ref(), &self.config, session_id).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Worker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One compression pass. Returns the new version, or `None` when there was
/// nothing to do.
async fn run_compression(
    dao: &Dao,
    provider: &dyn LlmProvider,
    config: &CompressionConfig,
    session_id: &str,
) -> Result<Option<i64>> {
    let context = dao
        .get_active_compressed_context(session_id)?
        .ok_or_else(|| {
            Error::DataCorruption(format!(
                "session {session_id} has no active compressed context"
            ))
        })?;

    let messages = context.compressed_messages;
    if messages.len() <= config.preserve_recent_count {
        return Ok(None);
    }

    let split = messages.len() - config.preserve_recent_count;
    let (head, tail) = messages.split_at(split);

    let compressed = summarize_head(provider, head).await?;

    let mut new_messages = compressed.messages;
    new_messages.extend_from_slice(tail);

    let version = dao.swap_compressed_context(
        session_id,
        &new_messages,
        &compressed.summary,
        &compressed.key_decisions,
    )?;
    Ok(Some(version))
}

struct CompressedHead {
    messages: Vec<Message>,
    summary: String,
    key_decisions: Vec<String>,
}

/// Ask the summarizer for a structured rewrite of the older messages.
/// Ids and timestamps of the returned messages are regenerated locally;
/// nothing from the model is trusted beyond role, content and metadata.
async fn summarize_head(provider: &dyn LlmProvider, head: &[Message]) -> Result<CompressedHead> {
    let mut conversation = String::new();
    for (i, msg) in head.iter().enumerate() {
        conversation.push_str(&format!(
            "[{}] {}: {}\n",
            i + 1,
            msg.role.as_str(),
            elide(&msg.content)
        ));
    }

    let req = ChatRequest {
        messages: vec![
            Message::system(COMPRESSION_SYSTEM_PROMPT),
            Message::user(format!("Compress this conversation history:\n\n{conversation}")),
        ],
        tools: vec![],
        parallel_tool_calls: false,
        temperature: Some(0.1),
        max_tokens: Some(2000),
        model: None,
    };

    let response = provider.chat(&req).await?;
    let parsed: Value = serde_json::from_str(extract_json(&response.content))?;

    let mut messages = Vec::new();
    for entry in parsed
        .get("compressed_messages")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default()
    {
        let role = entry
            .get("role")
            .and_then(|v| v.as_str())
            .unwrap_or("assistant");
        let content = entry
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if content.is_empty() {
            continue;
        }
        // Rollup messages are user/assistant only.
        let mut message = match role.parse() {
            Ok(Role::User) => Message::user(content),
            _ => Message::assistant(content),
        };
        if let Some(meta) = entry.get("metadata").filter(|m| m.is_object()) {
            message.metadata = Some(meta.clone());
        }
        messages.push(message);
    }

    Ok(CompressedHead {
        messages,
        summary: parsed
            .get("summary")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        key_decisions: parsed
            .get("key_decisions")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default(),
    })
}

/// Keep the summarization prompt bounded for very long tool results.
fn elide(content: &str) -> String {
    if content.len() <= PROMPT_CONTENT_CAP {
        return content.to_string();
    }
    let head_end = floor_char_boundary(content, PROMPT_CONTENT_CAP / 2);
    let tail_start = floor_char_boundary(content, content.len() - PROMPT_CONTENT_CAP / 4);
    format!("{} [...] {}", &content[..head_end], &content[tail_start..])
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Tolerate models that wrap the JSON reply in markdown fences.
fn extract_json(content: &str) -> &str {
    let trimmed = content.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open.strip_suffix("```").unwrap_or(without_open).trim()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
