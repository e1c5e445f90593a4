//! SSE plumbing for the streaming chat-completion endpoint.
//!
//! The wire format is the usual `data: <json>` blocks separated by blank
//! lines. Bytes are buffered as they arrive, complete blocks are drained in
//! place, and each `data:` payload is handed to a parser closure producing
//! zero or more [`LlmDelta`]s. When the body closes with a trailing partial
//! block the buffer is flushed once more, and a fallback `Done` is emitted
//! if the parser never produced one.

use pw_domain::error::{Error, Result};
use pw_domain::stream::{BoxStream, LlmDelta};

/// Drain complete `data:` payloads from an SSE buffer.
///
/// Consumed bytes are removed from `buffer`; a trailing partial event stays
/// behind for the next call. Lines other than `data:` (`event:`, `id:`,
/// comments) are ignored at this layer.
pub(crate) fn drain_data_payloads(buffer: &mut String) -> Vec<String> {
    let mut payloads = Vec::new();

    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2);

        for line in block.lines() {
            if let Some(data) = line.trim().strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    payloads.push(data.to_string());
                }
            }
        }
    }

    payloads
}

/// Build a delta stream from a streaming `reqwest::Response` and a parser
/// closure for individual `data:` payloads.
///
/// The closure is `FnMut` so parsers may keep assembly state across chunks.
pub(crate) fn delta_stream<F>(
    response: reqwest::Response,
    mut parse_payload: F,
) -> BoxStream<'static, Result<LlmDelta>>
where
    F: FnMut(&str) -> Vec<Result<LlmDelta>> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut response = response;
        let mut buffer = String::new();
        let mut done_emitted = false;

        loop {
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    for payload in drain_data_payloads(&mut buffer) {
                        for delta in parse_payload(&payload) {
                            if matches!(&delta, Ok(LlmDelta::Done { .. })) {
                                done_emitted = true;
                            }
                            yield delta;
                        }
                    }
                }
                Ok(None) => {
                    // Body closed; flush whatever partial block remains.
                    if !buffer.trim().is_empty() {
                        buffer.push_str("\n\n");
                        for payload in drain_data_payloads(&mut buffer) {
                            for delta in parse_payload(&payload) {
                                if matches!(&delta, Ok(LlmDelta::Done { .. })) {
                                    done_emitted = true;
                                }
                                yield delta;
                            }
                        }
                    }
                    break;
                }
                Err(e) => {
                    yield Err(Error::Http(e.to_string()));
                    break;
                }
            }
        }

        if !done_emitted {
            yield Ok(LlmDelta::Done {
                usage: None,
                finish_reason: Some("stop".into()),
            });
        }
    };

    Box::pin(stream)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
