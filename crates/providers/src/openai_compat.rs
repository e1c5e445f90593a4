//! OpenAI-compatible chat completions adapter.
//!
//! Works with OpenAI, Ollama, vLLM, Together, and any other endpoint that
//! follows the chat completions wire contract. Both the blocking and the
//! streaming paths are implemented; the streaming path yields [`LlmDelta`]s
//! with tool-call fragments keyed by the provider's stream index.

use serde_json::Value;

use pw_domain::config::ProviderConfig;
use pw_domain::error::{Error, Result};
use pw_domain::stream::{BoxStream, LlmDelta, Usage};
use pw_domain::tool::{Message, Role, ToolCall, ToolDefinition};

use crate::sse::delta_stream;
use crate::traits::{ChatRequest, ChatResponse, LlmProvider};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An LLM adapter for any OpenAI-compatible API endpoint.
pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a provider from the deserialized provider config. The API key
    /// is resolved here: `api_key_env` takes precedence over an inline key.
    pub fn from_config(cfg: &ProviderConfig) -> Result<Self> {
        let api_key = match &cfg.api_key_env {
            Some(var) => std::env::var(var).ok().or_else(|| cfg.api_key.clone()),
            None => cfg.api_key.clone(),
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;

        Ok(Self {
            id: cfg.id.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            default_model: cfg
                .default_model
                .clone()
                .unwrap_or_else(|| "gpt-4o".into()),
            client,
        })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(url)
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }
        builder
    }

    fn build_chat_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(msg_to_wire).collect();

        let mut body = serde_json::json!({
            "model": req.model.clone().unwrap_or_else(|| self.default_model.clone()),
            "messages": messages,
            "stream": stream,
        });

        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_wire).collect();
            body["tools"] = Value::Array(tools);
            if req.parallel_tool_calls {
                body["parallel_tool_calls"] = Value::Bool(true);
            }
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        if stream {
            body["stream_options"] = serde_json::json!({"include_usage": true});
        }
        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn msg_to_wire(msg: &Message) -> Value {
    match msg.role {
        Role::Tool => serde_json::json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id.clone().unwrap_or_default(),
            "content": msg.content,
        }),
        Role::Assistant => {
            let mut obj = serde_json::json!({"role": "assistant"});
            obj["content"] = if msg.content.is_empty() && msg.tool_calls.is_some() {
                Value::Null
            } else {
                Value::String(msg.content.clone())
            };
            if let Some(calls) = &msg.tool_calls {
                let wire_calls: Vec<Value> = calls
                    .iter()
                    .map(|tc| {
                        serde_json::json!({
                            "id": tc.call_id,
                            "type": "function",
                            "function": {
                                "name": tc.tool_name,
                                "arguments": tc.arguments.to_string(),
                            }
                        })
                    })
                    .collect();
                obj["tool_calls"] = Value::Array(wire_calls);
            }
            obj
        }
        _ => serde_json::json!({
            "role": msg.role.as_str(),
            "content": msg.content,
        }),
    }
}

fn tool_to_wire(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_chat_response(provider: &str, body: &Value) -> Result<ChatResponse> {
    let choice = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| Error::Provider {
            provider: provider.into(),
            message: "no choices in response".into(),
        })?;

    let message = choice.get("message").ok_or_else(|| Error::Provider {
        provider: provider.into(),
        message: "no message in choice".into(),
    })?;

    Ok(ChatResponse {
        content: message
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        tool_calls: parse_wire_tool_calls(message),
        usage: body.get("usage").and_then(parse_wire_usage),
        model: body
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string(),
        finish_reason: choice
            .get("finish_reason")
            .and_then(|v| v.as_str())
            .map(String::from),
    })
}

fn parse_wire_tool_calls(message: &Value) -> Vec<ToolCall> {
    let arr = match message.get("tool_calls").and_then(|v| v.as_array()) {
        Some(a) => a,
        None => return Vec::new(),
    };
    arr.iter()
        .filter_map(|tc| {
            let call_id = tc.get("id")?.as_str()?.to_string();
            let func = tc.get("function")?;
            let tool_name = func.get("name")?.as_str()?.to_string();
            let args_str = func.get("arguments")?.as_str().unwrap_or("{}");
            let arguments: Value =
                serde_json::from_str(args_str).unwrap_or(Value::Object(Default::default()));
            Some(ToolCall {
                call_id,
                tool_name,
                arguments,
            })
        })
        .collect()
}

fn parse_wire_usage(v: &Value) -> Option<Usage> {
    Some(Usage {
        prompt_tokens: v.get("prompt_tokens")?.as_u64()? as u32,
        completion_tokens: v.get("completion_tokens")?.as_u64()? as u32,
        total_tokens: v.get("total_tokens")?.as_u64()? as u32,
    })
}

/// Parse one streaming `data:` payload into deltas.
///
/// Tool-call fragments are reported under their stream `index`. The first
/// fragment for an index carries `id` and the function name; later
/// fragments only append argument text.
fn parse_stream_payload(data: &str) -> Vec<Result<LlmDelta>> {
    if data.trim() == "[DONE]" {
        return vec![Ok(LlmDelta::Done {
            usage: None,
            finish_reason: Some("stop".into()),
        })];
    }

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return vec![Err(Error::Json(e))],
    };

    let choice = v
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first());

    // Usage-only tail chunk (stream_options.include_usage).
    let Some(choice) = choice else {
        if let Some(usage) = v.get("usage").and_then(parse_wire_usage) {
            return vec![Ok(LlmDelta::Done {
                usage: Some(usage),
                finish_reason: None,
            })];
        }
        return Vec::new();
    };

    if let Some(fr) = choice.get("finish_reason").and_then(|f| f.as_str()) {
        return vec![Ok(LlmDelta::Done {
            usage: v.get("usage").and_then(parse_wire_usage),
            finish_reason: Some(fr.to_string()),
        })];
    }

    let delta = choice.get("delta").unwrap_or(&Value::Null);
    let mut out = Vec::new();

    if let Some(tc_arr) = delta.get("tool_calls").and_then(|v| v.as_array()) {
        for tc in tc_arr {
            let index = tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
            let func = tc.get("function");

            if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
                let name = func
                    .and_then(|f| f.get("name"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                out.push(Ok(LlmDelta::ToolCallStart {
                    index,
                    id: id.to_string(),
                    name: name.to_string(),
                }));
            }

            if let Some(args) = func
                .and_then(|f| f.get("arguments"))
                .and_then(|v| v.as_str())
            {
                if !args.is_empty() {
                    out.push(Ok(LlmDelta::ToolCallArguments {
                        index,
                        fragment: args.to_string(),
                    }));
                }
            }
        }
    }

    if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            out.push(Ok(LlmDelta::Content {
                text: text.to_string(),
            }));
        }
    }

    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let url = self.chat_url();
        let body = self.build_chat_body(req, false);

        tracing::debug!(provider = %self.id, url = %url, "chat request");

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(Error::Provider {
                provider: self.id.clone(),
                message: format!("HTTP {} - {}", status.as_u16(), text),
            });
        }

        let json: Value = serde_json::from_str(&text)?;
        parse_chat_response(&self.id, &json)
    }

    async fn chat_stream(&self, req: &ChatRequest) -> Result<BoxStream<'static, Result<LlmDelta>>> {
        let url = self.chat_url();
        let body = self.build_chat_body(req, true);

        tracing::debug!(provider = %self.id, url = %url, "chat stream request");

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;
            return Err(Error::Provider {
                provider: self.id.clone(),
                message: format!("HTTP {} - {}", status.as_u16(), text),
            });
        }

        Ok(delta_stream(resp, parse_stream_payload))
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> OpenAiCompatProvider {
        OpenAiCompatProvider::from_config(&ProviderConfig {
            id: "test".into(),
            base_url: "http://localhost:9999/v1/".into(),
            api_key_env: None,
            api_key: Some("sk-test".into()),
            default_model: Some("test-model".into()),
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[test]
    fn base_url_is_trimmed() {
        assert_eq!(
            provider().chat_url(),
            "http://localhost:9999/v1/chat/completions"
        );
    }

    #[test]
    fn body_includes_parallel_tool_calls_only_with_tools() {
        let p = provider();
        let mut req = ChatRequest {
            messages: vec![Message::user("hi")],
            parallel_tool_calls: true,
            ..Default::default()
        };
        let body = p.build_chat_body(&req, true);
        assert!(body.get("parallel_tool_calls").is_none());
        assert_eq!(body["stream_options"]["include_usage"], true);

        req.tools.push(ToolDefinition {
            name: "research".into(),
            description: "".into(),
            parameters: serde_json::json!({"type": "object"}),
        });
        let body = p.build_chat_body(&req, false);
        assert_eq!(body["parallel_tool_calls"], true);
        assert_eq!(body["tools"][0]["function"]["name"], "research");
    }

    #[test]
    fn assistant_with_tool_calls_serializes_null_content() {
        let msg = Message::assistant_with_tools(
            "",
            vec![ToolCall {
                call_id: "c1".into(),
                tool_name: "research".into(),
                arguments: serde_json::json!({"q": "flask"}),
            }],
        );
        let wire = msg_to_wire(&msg);
        assert!(wire["content"].is_null());
        assert_eq!(wire["tool_calls"][0]["id"], "c1");
        // Arguments travel as a JSON string on the wire.
        assert!(wire["tool_calls"][0]["function"]["arguments"].is_string());
    }

    #[test]
    fn tool_message_carries_call_id() {
        let wire = msg_to_wire(&Message::tool("{}", "c9"));
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "c9");
    }

    #[test]
    fn parse_stream_content_delta() {
        let deltas =
            parse_stream_payload(r#"{"choices":[{"delta":{"content":"hel"},"index":0}]}"#);
        assert_eq!(deltas.len(), 1);
        assert!(
            matches!(deltas[0].as_ref().unwrap(), LlmDelta::Content { text } if text == "hel")
        );
    }

    #[test]
    fn parse_stream_tool_call_start_and_args() {
        let deltas = parse_stream_payload(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"research","arguments":"{\"q"}}]},"index":0}]}"#,
        );
        assert_eq!(deltas.len(), 2);
        assert!(matches!(
            deltas[0].as_ref().unwrap(),
            LlmDelta::ToolCallStart { index: 0, id, name } if id == "c1" && name == "research"
        ));
        assert!(matches!(
            deltas[1].as_ref().unwrap(),
            LlmDelta::ToolCallArguments { index: 0, fragment } if fragment == "{\"q"
        ));
    }

    #[test]
    fn parse_stream_done_sentinel() {
        let deltas = parse_stream_payload("[DONE]");
        assert!(matches!(
            deltas[0].as_ref().unwrap(),
            LlmDelta::Done { finish_reason: Some(r), .. } if r == "stop"
        ));
    }

    #[test]
    fn parse_stream_usage_only_chunk() {
        let deltas = parse_stream_payload(
            r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#,
        );
        assert!(matches!(
            deltas[0].as_ref().unwrap(),
            LlmDelta::Done { usage: Some(u), .. } if u.total_tokens == 15
        ));
    }

    #[test]
    fn parse_full_response_with_tool_calls() {
        let body: Value = serde_json::from_str(
            r#"{
                "model": "test-model",
                "choices": [{
                    "message": {
                        "content": null,
                        "tool_calls": [{
                            "id": "c1",
                            "function": {"name": "short_planning", "arguments": "{\"goal\":\"api\"}"}
                        }]
                    },
                    "finish_reason": "tool_calls"
                }],
                "usage": {"prompt_tokens": 1, "completion_tokens": 2, "total_tokens": 3}
            }"#,
        )
        .unwrap();
        let resp = parse_chat_response("test", &body).unwrap();
        assert_eq!(resp.content, "");
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].arguments["goal"], "api");
        assert_eq!(resp.finish_reason.as_deref(), Some("tool_calls"));
    }
}
