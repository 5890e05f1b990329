//! OpenAI-compatible chat endpoint client.
//!
//! The orchestrator talks to the model only through the [`ChatClient`] trait so
//! tests can substitute a scripted client. [`OpenAiChatClient`] is the real
//! implementation over a blocking `reqwest` client.

use std::env;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::blocking::Client;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::retry::RetryPolicy;
use crate::core::types::{Message, Role, TokenUsage, ToolCall};
use crate::io::config::ModelConfig;

/// Error bodies are cut to this many bytes before being stored in an error.
const ERROR_BODY_LIMIT: usize = 500;

/// Failure talking to the chat endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelApiError {
    #[error("cannot reach chat endpoint: {0}")]
    Network(String),

    #[error("chat request timed out: {0}")]
    Timeout(String),

    #[error("rate limited by chat endpoint (status 429)")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("chat endpoint server error (status {status}): {body}")]
    Server { status: u16, body: String },

    #[error("chat request rejected (status {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid chat response: {0}")]
    InvalidResponse(String),
}

impl ModelApiError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: &str) -> Self {
        let body = truncate_body(body);
        match status {
            429 => ModelApiError::RateLimited {
                retry_after_secs: extract_retry_after(&body),
            },
            408 => ModelApiError::Timeout(format!("status 408: {body}")),
            500..=599 => ModelApiError::Server { status, body },
            _ => ModelApiError::Rejected { status, body },
        }
    }

    fn transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            ModelApiError::Timeout(err.to_string())
        } else {
            ModelApiError::Network(err.to_string())
        }
    }

    /// Whether the same request may succeed if sent again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ModelApiError::Network(_)
                | ModelApiError::Timeout(_)
                | ModelApiError::RateLimited { .. }
                | ModelApiError::Server { .. }
        )
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            ModelApiError::RateLimited {
                retry_after_secs: Some(secs),
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

fn truncate_body(body: &str) -> String {
    let mut end = body.len().min(ERROR_BODY_LIMIT);
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].trim().to_string()
}

/// `retry_after` from `{"error": {"retry_after": n}}` or `{"retry_after": n}`.
fn extract_retry_after(body: &str) -> Option<u64> {
    let v: Value = serde_json::from_str(body).ok()?;
    v["error"]["retry_after"]
        .as_u64()
        .or_else(|| v["retry_after"].as_u64())
        .or_else(|| v["error"]["retry_after"].as_f64().map(|f| f.ceil() as u64))
}

/// One request to the chat endpoint.
#[derive(Debug, Clone, Copy)]
pub struct ChatRequest<'a> {
    pub messages: &'a [Message],
    pub tools: &'a [Value],
    pub thinking: bool,
}

/// The assistant message returned by the endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatReply {
    pub content: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<TokenUsage>,
}

impl ChatReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::default()
        }
    }
}

/// Chat endpoint abstraction (for testing).
pub trait ChatClient {
    /// Send one request and return the assistant reply.
    fn complete(&self, request: &ChatRequest<'_>) -> Result<ChatReply, ModelApiError>;
}

impl<C: ChatClient + ?Sized> ChatClient for &C {
    fn complete(&self, request: &ChatRequest<'_>) -> Result<ChatReply, ModelApiError> {
        (**self).complete(request)
    }
}

/// Send `request`, retrying transient failures according to `policy`.
///
/// Returns the reply together with the number of attempts made.
#[instrument(skip_all, fields(max_attempts = policy.max_attempts))]
pub fn complete_with_retry<C: ChatClient + ?Sized>(
    client: &C,
    request: &ChatRequest<'_>,
    policy: &RetryPolicy,
) -> Result<(ChatReply, u32), ModelApiError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match client.complete(request) {
            Ok(reply) => return Ok((reply, attempt)),
            Err(err) if err.is_transient() && policy.should_retry(attempt) => {
                let backoff = policy.delay_for(attempt);
                let delay = err
                    .retry_after()
                    .map_or(backoff, |hint| hint.max(backoff))
                    .min(Duration::from_millis(policy.max_delay_ms));
                warn!(attempt, delay_ms = delay.as_millis() as u64, err = %err, "transient chat error, retrying");
                thread::sleep(delay);
            }
            Err(err) => {
                warn!(attempt, transient = err.is_transient(), err = %err, "chat request failed");
                return Err(err);
            }
        }
    }
}

/// Blocking client for `POST {api_base}/chat/completions`.
#[derive(Debug)]
pub struct OpenAiChatClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f64,
    top_p: f64,
    max_tokens: u32,
}

impl OpenAiChatClient {
    pub fn from_config(cfg: &ModelConfig) -> Result<Self> {
        let api_key = match &cfg.api_key_env {
            Some(var) => Some(
                env::var(var).with_context(|| format!("read api key from ${var}"))?,
            ),
            None => None,
        };
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .map_err(|e| anyhow!("build http client: {e}"))?;
        Ok(Self {
            http,
            base_url: cfg.api_base.trim_end_matches('/').to_string(),
            api_key,
            model: cfg.name.clone(),
            temperature: cfg.temperature,
            top_p: cfg.top_p,
            max_tokens: cfg.max_tokens,
        })
    }

    /// JSON body for a request (without transport concerns).
    pub fn request_body(&self, request: &ChatRequest<'_>) -> Value {
        let messages: Vec<Value> = request.messages.iter().map(wire_message).collect();
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "tools": request.tools,
            "tool_choice": "auto",
            "temperature": self.temperature,
            "top_p": self.top_p,
            "max_tokens": self.max_tokens,
        });
        if request.thinking {
            body["chat_template_kwargs"] = json!({ "enable_thinking": true });
        }
        body
    }
}

impl ChatClient for OpenAiChatClient {
    #[instrument(skip_all, fields(model = %self.model, messages = request.messages.len()))]
    fn complete(&self, request: &ChatRequest<'_>) -> Result<ChatReply, ModelApiError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.request_body(request);
        debug!(url = %url, "calling chat endpoint");

        let mut builder = self.http.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let resp = builder.send().map_err(|e| ModelApiError::transport(&e))?;

        let status = resp.status();
        let text = resp.text().map_err(|e| ModelApiError::transport(&e))?;
        if !status.is_success() {
            warn!(status = status.as_u16(), "chat endpoint returned an error");
            return Err(ModelApiError::from_status(status.as_u16(), &text));
        }

        let data: Value = serde_json::from_str(&text)
            .map_err(|e| ModelApiError::InvalidResponse(format!("response is not JSON: {e}")))?;
        let reply = parse_reply(&data)?;
        info!(
            tool_calls = reply.tool_calls.len(),
            usage = ?reply.usage,
            "chat reply received"
        );
        Ok(reply)
    }
}

/// Convert a transcript message to its wire form.
///
/// Reasoning and the tool `success` flag stay in the transcript only.
pub fn wire_message(message: &Message) -> Value {
    match message.role {
        Role::System | Role::User => json!({
            "role": message.role.as_str(),
            "content": message.content,
        }),
        Role::Assistant => {
            let mut value = json!({
                "role": "assistant",
                "content": message.content,
            });
            if !message.tool_calls.is_empty() {
                let calls: Vec<Value> = message
                    .tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": { "name": call.name, "arguments": call.arguments },
                        })
                    })
                    .collect();
                value["tool_calls"] = Value::Array(calls);
            }
            value
        }
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": message.tool_call_id.as_deref().unwrap_or_default(),
            "content": message.content,
        }),
    }
}

/// Parse the first choice of a `/chat/completions` response.
pub fn parse_reply(data: &Value) -> Result<ChatReply, ModelApiError> {
    let message = data["choices"]
        .get(0)
        .map(|choice| &choice["message"])
        .filter(|m| m.is_object())
        .ok_or_else(|| ModelApiError::InvalidResponse("no choices in response".to_string()))?;

    let content = message["content"].as_str().unwrap_or_default().to_string();
    let reasoning = message["reasoning_content"]
        .as_str()
        .or_else(|| message["reasoning"].as_str())
        .map(str::to_string);

    let mut tool_calls = Vec::new();
    if let Some(calls) = message["tool_calls"].as_array() {
        for call in calls {
            let function = &call["function"];
            // A nameless call is kept; dispatch reports it as an unknown tool.
            let name = function["name"].as_str().unwrap_or_default();
            let arguments = match &function["arguments"] {
                Value::String(raw) => raw.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            tool_calls.push(ToolCall {
                id: call["id"].as_str().unwrap_or_default().to_string(),
                name: name.to_string(),
                arguments,
            });
        }
    }

    let usage = data.get("usage").and_then(|u| {
        Some(TokenUsage {
            prompt_tokens: u.get("prompt_tokens")?.as_u64()?,
            completion_tokens: u.get("completion_tokens")?.as_u64()?,
        })
    });

    Ok(ChatReply {
        content,
        reasoning,
        tool_calls,
        usage,
    })
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use super::*;
    use crate::core::types::ToolResult;

    struct Flaky {
        replies: RefCell<VecDeque<Result<ChatReply, ModelApiError>>>,
    }

    impl ChatClient for Flaky {
        fn complete(&self, _request: &ChatRequest<'_>) -> Result<ChatReply, ModelApiError> {
            self.replies
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Err(ModelApiError::InvalidResponse("script exhausted".into())))
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            backoff_factor: 1.0,
        }
    }

    fn request() -> ChatRequest<'static> {
        ChatRequest {
            messages: &[],
            tools: &[],
            thinking: false,
        }
    }

    #[test]
    fn statuses_are_classified() {
        assert!(ModelApiError::from_status(429, "{}").is_transient());
        assert!(ModelApiError::from_status(408, "").is_transient());
        assert!(ModelApiError::from_status(503, "down").is_transient());
        for status in [400, 401, 402, 403, 404] {
            assert!(!ModelApiError::from_status(status, "no").is_transient(), "{status}");
        }
        assert!(!ModelApiError::InvalidResponse("x".into()).is_transient());
    }

    #[test]
    fn rate_limit_reads_retry_after() {
        let err = ModelApiError::from_status(429, r#"{"error":{"retry_after":7}}"#);
        assert_eq!(
            err,
            ModelApiError::RateLimited {
                retry_after_secs: Some(7)
            }
        );
    }

    #[test]
    fn transient_errors_are_retried_until_success() {
        let client = Flaky {
            replies: RefCell::new(VecDeque::from([
                Err(ModelApiError::Network("reset".into())),
                Err(ModelApiError::from_status(502, "bad gateway")),
                Ok(ChatReply::text("done")),
            ])),
        };
        let (reply, attempts) =
            complete_with_retry(&client, &request(), &fast_policy(5)).expect("reply");
        assert_eq!(reply.content, "done");
        assert_eq!(attempts, 3);
    }

    /// Retries stop at `max_attempts` and surface the last error.
    #[test]
    fn exhausted_retries_return_last_error() {
        let client = Flaky {
            replies: RefCell::new(VecDeque::from([
                Err(ModelApiError::Network("a".into())),
                Err(ModelApiError::Network("b".into())),
                Ok(ChatReply::text("too late")),
            ])),
        };
        let err = complete_with_retry(&client, &request(), &fast_policy(2)).expect_err("fails");
        assert_eq!(err, ModelApiError::Network("b".into()));
    }

    #[test]
    fn fatal_errors_are_not_retried() {
        let client = Flaky {
            replies: RefCell::new(VecDeque::from([
                Err(ModelApiError::from_status(401, "bad key")),
                Ok(ChatReply::text("unreachable")),
            ])),
        };
        let err = complete_with_retry(&client, &request(), &fast_policy(5)).expect_err("fails");
        assert!(matches!(err, ModelApiError::Rejected { status: 401, .. }));
        assert_eq!(client.replies.borrow().len(), 1);
    }

    #[test]
    fn parses_tool_calls_reasoning_and_usage() {
        let data = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "reasoning_content": "look first",
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": { "name": "shell", "arguments": "{\"cmd\":\"ls\"}" }
                    }]
                }
            }],
            "usage": { "prompt_tokens": 120, "completion_tokens": 30 }
        });
        let reply = parse_reply(&data).expect("parse");
        assert_eq!(reply.content, "");
        assert_eq!(reply.reasoning.as_deref(), Some("look first"));
        assert_eq!(reply.tool_calls, vec![ToolCall::new("call_1", "shell", r#"{"cmd":"ls"}"#)]);
        assert_eq!(
            reply.usage,
            Some(TokenUsage {
                prompt_tokens: 120,
                completion_tokens: 30
            })
        );
    }

    #[test]
    fn nameless_tool_call_is_kept_for_dispatch() {
        let data = json!({
            "choices": [{
                "message": {
                    "content": "",
                    "tool_calls": [
                        { "id": "a", "function": { "name": "shell", "arguments": "{\"cmd\":\"ls\"}" } },
                        { "id": "b", "function": { "arguments": "{}" } }
                    ]
                }
            }]
        });
        let reply = parse_reply(&data).expect("parse");
        assert_eq!(reply.tool_calls.len(), 2);
        assert_eq!(reply.tool_calls[1], ToolCall::new("b", "", "{}"));
    }

    #[test]
    fn missing_choices_is_invalid() {
        let err = parse_reply(&json!({ "choices": [] })).expect_err("invalid");
        assert!(!err.is_transient());
    }

    #[test]
    fn wire_messages_drop_transcript_only_fields() {
        let assistant = Message::assistant(
            "",
            Some("thinking".to_string()),
            vec![ToolCall::new("c1", "shell", r#"{"cmd":"pwd"}"#)],
        );
        let wire = wire_message(&assistant);
        assert!(wire.get("reasoning").is_none());
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "shell");

        let tool = wire_message(&Message::tool(ToolResult::failed("c1", "boom")));
        assert_eq!(tool, json!({ "role": "tool", "tool_call_id": "c1", "content": "boom" }));
    }

    #[test]
    fn thinking_adds_template_kwargs() {
        let client = OpenAiChatClient::from_config(&ModelConfig::default()).expect("client");
        let messages = [Message::user("hi")];
        let body = client.request_body(&ChatRequest {
            messages: &messages,
            tools: &[],
            thinking: true,
        });
        assert_eq!(body["chat_template_kwargs"]["enable_thinking"], true);
        assert_eq!(body["tool_choice"], "auto");

        let plain = client.request_body(&ChatRequest {
            messages: &messages,
            tools: &[],
            thinking: false,
        });
        assert!(plain.get("chat_template_kwargs").is_none());
    }
}
