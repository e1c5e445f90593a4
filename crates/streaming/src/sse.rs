//! SSE output handler.
//!
//! Serializes events into `event:`/`data:` frames and ships them to a
//! caller-supplied async write function. All writes for a connection go
//! through one dedicated writer task fed by a channel, so frames never
//! interleave. The writer task also owns the heartbeat: when no frame
//! arrives within the interval, a comment line `:\n\n` keeps the
//! connection alive.
//!
//! With `buffer_events` set, assistant chunk events are coalesced (up to
//! [`CHUNK_BUFFER_MAX`] chunks) before writing; any non-chunk event forces
//! a flush first so cross-kind ordering is preserved. A write failure
//! marks the handler closed — the conversation itself continues, the
//! disconnected client just stops receiving.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use pw_domain::error::{Error, Result};

use crate::event::{MessageChunk, StreamEvent, StreamEventKind};
use crate::handler::StreamHandler;

/// Chunks coalesced per SSE write when buffering is enabled.
pub const CHUNK_BUFFER_MAX: u64 = 8;

pub type SseWriteFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
/// Async write function for one SSE connection.
pub type SseWriter = Arc<dyn Fn(String) -> SseWriteFuture + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SseHandlerConfig {
    pub heartbeat: Duration,
    pub include_metadata: bool,
    pub buffer_events: bool,
}

impl Default for SseHandlerConfig {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(30),
            include_metadata: false,
            buffer_events: false,
        }
    }
}

pub struct SseHandler {
    tx: Mutex<Option<mpsc::Sender<String>>>,
    closed: Arc<AtomicBool>,
    config: SseHandlerConfig,
    buffer: Mutex<ChunkBuffer>,
}

#[derive(Default)]
struct ChunkBuffer {
    session_id: String,
    content: String,
    first_index: u64,
    count: u64,
}

impl SseHandler {
    pub fn new(writer: SseWriter, config: SseHandlerConfig) -> Self {
        let (tx, mut rx) = mpsc::channel::<String>(64);
        let closed = Arc::new(AtomicBool::new(false));

        let heartbeat = config.heartbeat;
        let task_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                match tokio::time::timeout(heartbeat, rx.recv()).await {
                    Ok(Some(frame)) => {
                        if let Err(e) = writer(frame).await {
                            tracing::warn!(error = %e, "SSE write failed; closing handler");
                            task_closed.store(true, Ordering::SeqCst);
                            rx.close();
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {
                        // Idle for a full interval: heartbeat comment.
                        if let Err(e) = writer(":\n\n".to_string()).await {
                            tracing::debug!(error = %e, "SSE heartbeat failed; closing handler");
                            task_closed.store(true, Ordering::SeqCst);
                            rx.close();
                            break;
                        }
                    }
                }
            }
        });

        Self {
            tx: Mutex::new(Some(tx)),
            closed,
            config,
            buffer: Mutex::new(ChunkBuffer::default()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn serialize(&self, event: &StreamEvent) -> String {
        if self.config.include_metadata || event.metadata.is_empty() {
            event.to_sse()
        } else {
            let mut stripped = event.clone();
            stripped.metadata = Default::default();
            stripped.to_sse()
        }
    }

    /// Take the pending coalesced chunk, if any, as a frame.
    fn take_buffered(&self, is_complete: bool) -> Option<String> {
        let mut buffer = self.buffer.lock();
        if buffer.count == 0 {
            return None;
        }
        let session_id = std::mem::take(&mut buffer.session_id);
        let content = std::mem::take(&mut buffer.content);
        let chunk = MessageChunk {
            content,
            chunk_index: buffer.first_index,
            is_complete,
            total_chunks: None,
        };
        buffer.count = 0;
        buffer.first_index = 0;
        Some(self.serialize(&StreamEvent::assistant_message_chunk(session_id, chunk)))
    }

    async fn send_frame(&self, frame: String) -> Result<()> {
        let tx = self.tx.lock().clone();
        let Some(tx) = tx else {
            return Ok(());
        };
        if tx.send(frame).await.is_err() {
            self.closed.store(true, Ordering::SeqCst);
            return Err(Error::Http("SSE connection closed".into()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StreamHandler for SseHandler {
    async fn handle_event(&self, event: &StreamEvent) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }

        if self.config.buffer_events && event.kind == StreamEventKind::AssistantMessageChunk {
            let ready = {
                let mut buffer = self.buffer.lock();
                if let crate::event::EventData::AssistantMessageChunk(chunk) = &event.data {
                    if buffer.count == 0 {
                        buffer.first_index = chunk.chunk_index;
                        buffer.session_id = event.session_id.clone();
                    }
                    buffer.content.push_str(&chunk.content);
                    buffer.count += 1;
                }
                buffer.count >= CHUNK_BUFFER_MAX
            };
            if ready {
                if let Some(frame) = self.take_buffered(false) {
                    self.send_frame(frame).await?;
                }
            }
            return Ok(());
        }

        // Non-chunk event (or buffering off): flush pending chunks first so
        // ordering across kinds holds. The flush forced by message_end
        // closes the batch with is_complete = true.
        if let Some(frame) =
            self.take_buffered(event.kind == StreamEventKind::AssistantMessageEnd)
        {
            self.send_frame(frame).await?;
        }

        self.send_frame(self.serialize(event)).await
    }

    async fn handle_error(&self, error: &Error, session_id: &str) {
        tracing::warn!(session_id, error = %error, "SSE handler error");
    }

    async fn close(&self) {
        if let Some(frame) = self.take_buffered(true) {
            let _ = self.send_frame(frame).await;
        }
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the sender lets the writer task drain and exit.
        self.tx.lock().take();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn capture_writer() -> (SseWriter, Arc<Mutex<Vec<String>>>) {
        let frames: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = frames.clone();
        let writer: SseWriter = Arc::new(move |frame: String| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().push(frame);
                Ok(())
            }) as SseWriteFuture
        });
        (writer, frames)
    }

    fn failing_writer() -> SseWriter {
        Arc::new(|_frame: String| {
            Box::pin(async { Err(Error::Http("broken pipe".into())) }) as SseWriteFuture
        })
    }

    fn chunk_event(content: &str, index: u64) -> StreamEvent {
        StreamEvent::assistant_message_chunk(
            "s1",
            MessageChunk {
                content: content.into(),
                chunk_index: index,
                is_complete: false,
                total_chunks: None,
            },
        )
    }

    async fn drain() {
        // Let the writer task consume queued frames.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn events_become_frames_in_order() {
        let (writer, frames) = capture_writer();
        let handler = SseHandler::new(writer, SseHandlerConfig::default());

        handler
            .handle_event(&StreamEvent::assistant_message_start("s1"))
            .await
            .unwrap();
        handler.handle_event(&chunk_event("hi", 0)).await.unwrap();
        drain().await;

        let frames = frames.lock();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].starts_with("event: assistant_message_start\n"));
        assert!(frames[1].starts_with("event: assistant_message_chunk\n"));
    }

    #[tokio::test]
    async fn buffering_coalesces_until_message_end() {
        let (writer, frames) = capture_writer();
        let handler = SseHandler::new(
            writer,
            SseHandlerConfig {
                buffer_events: true,
                ..Default::default()
            },
        );

        for (i, part) in ["a", "b", "c"].iter().enumerate() {
            handler
                .handle_event(&chunk_event(part, i as u64))
                .await
                .unwrap();
        }
        handler
            .handle_event(&StreamEvent::assistant_message_end(
                "s1",
                "abc",
                Default::default(),
            ))
            .await
            .unwrap();
        drain().await;

        let frames = frames.lock();
        assert_eq!(frames.len(), 2);

        let data: Value = serde_json::from_str(
            frames[0]
                .lines()
                .find_map(|l| l.strip_prefix("data: "))
                .unwrap(),
        )
        .unwrap();
        assert_eq!(data["data"]["content"], "abc");
        assert_eq!(data["data"]["chunk_index"], 0);
        assert_eq!(data["data"]["is_complete"], true);
        assert!(frames[1].starts_with("event: assistant_message_end\n"));
    }

    #[tokio::test]
    async fn buffering_flushes_at_threshold() {
        let (writer, frames) = capture_writer();
        let handler = SseHandler::new(
            writer,
            SseHandlerConfig {
                buffer_events: true,
                ..Default::default()
            },
        );

        for i in 0..CHUNK_BUFFER_MAX {
            handler.handle_event(&chunk_event("x", i)).await.unwrap();
        }
        drain().await;

        let frames = frames.lock();
        assert_eq!(frames.len(), 1);
        let data: Value = serde_json::from_str(
            frames[0]
                .lines()
                .find_map(|l| l.strip_prefix("data: "))
                .unwrap(),
        )
        .unwrap();
        assert_eq!(data["data"]["content"], "x".repeat(CHUNK_BUFFER_MAX as usize));
        assert_eq!(data["data"]["is_complete"], false);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_on_idle() {
        let (writer, frames) = capture_writer();
        let _handler = SseHandler::new(
            writer,
            SseHandlerConfig {
                heartbeat: Duration::from_secs(30),
                ..Default::default()
            },
        );

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(frames.lock().iter().any(|f| f == ":\n\n"));
    }

    #[tokio::test]
    async fn write_failure_closes_handler() {
        let handler = SseHandler::new(failing_writer(), SseHandlerConfig::default());

        handler
            .handle_event(&StreamEvent::assistant_message_start("s1"))
            .await
            .unwrap();
        drain().await;
        assert!(handler.is_closed());

        // Later events are silently dropped.
        let result = handler
            .handle_event(&StreamEvent::assistant_message_start("s1"))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn metadata_stripped_unless_requested() {
        let (writer, frames) = capture_writer();
        let handler = SseHandler::new(writer, SseHandlerConfig::default());

        let mut metadata = serde_json::Map::new();
        metadata.insert("internal".into(), serde_json::json!(true));
        handler
            .handle_event(&StreamEvent::assistant_message_start("s1").with_metadata(metadata))
            .await
            .unwrap();
        drain().await;

        let frames = frames.lock();
        let data: Value = serde_json::from_str(
            frames[0]
                .lines()
                .find_map(|l| l.strip_prefix("data: "))
                .unwrap(),
        )
        .unwrap();
        assert!(data["metadata"].as_object().unwrap().is_empty());
    }
}
