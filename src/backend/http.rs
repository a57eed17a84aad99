//! OpenAI-compatible HTTP adapter.
//!
//! Speaks the `/chat/completions` wire format over reqwest, with SSE
//! (`data:` line) decoding on the streaming path. Construction is cheap —
//! no connection is opened until the first call.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::VecDeque;
use std::env;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ClientConfig;
use crate::pipeline::{ChatHandler, DeltaStream};
use crate::types::{
    ChatDelta, ChatRequest, ChatResponse, MessageRole, TokenUsage, ToolCall,
};
use crate::{Error, Result};

pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl HttpBackend {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let api_key = config.resolve_api_key()?;

        // Production-friendly defaults, env-overridable.
        let timeout_secs = env::var("MODELGATE_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(config.timeout_secs);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .pool_max_idle_per_host(
                env::var("MODELGATE_HTTP_POOL_MAX_IDLE_PER_HOST")
                    .ok()
                    .and_then(|s| s.parse::<usize>().ok())
                    .unwrap_or(32),
            )
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .build()
            .map_err(Error::Transport)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
        })
    }

    fn request_body(&self, request: &ChatRequest, stream: bool) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| {
                let mut msg = serde_json::json!({
                    "role": m.role.as_str(),
                    "content": m.content,
                });
                if !m.tool_calls.is_empty() {
                    msg["tool_calls"] = serde_json::Value::Array(
                        m.tool_calls
                            .iter()
                            .map(|tc| {
                                serde_json::json!({
                                    "id": tc.id,
                                    "type": "function",
                                    "function": {
                                        "name": tc.name,
                                        "arguments": tc.arguments.to_string(),
                                    },
                                })
                            })
                            .collect(),
                    );
                }
                if let Some(id) = &m.tool_call_id {
                    msg["tool_call_id"] = serde_json::Value::String(id.clone());
                }
                msg
            })
            .collect();

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
        });
        let options = &request.options;
        if let Some(t) = options.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(p) = options.top_p {
            body["top_p"] = serde_json::json!(p);
        }
        if let Some(m) = options.max_tokens {
            body["max_tokens"] = serde_json::json!(m);
        }
        if !options.stop.is_empty() {
            body["stop"] = serde_json::json!(options.stop);
        }
        if !options.tools.is_empty() {
            body["tools"] = serde_json::json!(options.tools);
        }
        if let Some(user) = &options.user {
            body["user"] = serde_json::Value::String(user.clone());
        }
        if stream {
            body["stream"] = serde_json::Value::Bool(true);
        }
        body
    }

    async fn send(&self, request: &ChatRequest, stream: bool) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let request_id = request
            .options
            .request_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut req = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("x-modelgate-request-id", &request_id)
            .json(&self.request_body(request, stream));
        if stream {
            req = req.header("accept", "text/event-stream");
        }

        let response = req.send().await.map_err(Error::Transport)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let status_code = status.as_u16();
        let body = response.text().await.unwrap_or_default();
        info!(
            http_status = status_code,
            model = self.model.as_str(),
            request_id = request_id.as_str(),
            "backend request failed"
        );
        Err(classify_status(status_code, body))
    }

    fn parse_response(value: serde_json::Value) -> Result<ChatResponse> {
        let choice = value
            .get("choices")
            .and_then(|c| c.get(0))
            .ok_or_else(|| Error::runtime("backend response missing choices"))?;
        let message = choice
            .get("message")
            .ok_or_else(|| Error::runtime("backend response missing message"))?;

        let tool_calls = message
            .get("tool_calls")
            .and_then(|v| v.as_array())
            .map(|calls| calls.iter().filter_map(parse_tool_call).collect())
            .unwrap_or_default();

        Ok(ChatResponse {
            content: message
                .get("content")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            role: parse_role(message.get("role")),
            finish_reason: choice
                .get("finish_reason")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            tool_calls,
            usage: parse_usage(value.get("usage")),
        })
    }
}

fn parse_role(value: Option<&serde_json::Value>) -> MessageRole {
    match value.and_then(|v| v.as_str()) {
        Some("system") => MessageRole::System,
        Some("user") => MessageRole::User,
        Some("tool") => MessageRole::Tool,
        _ => MessageRole::Assistant,
    }
}

fn parse_usage(value: Option<&serde_json::Value>) -> Option<TokenUsage> {
    let usage = value?;
    let prompt = usage.get("prompt_tokens")?.as_u64()? as u32;
    let completion = usage.get("completion_tokens")?.as_u64()? as u32;
    Some(TokenUsage::new(prompt, completion))
}

fn parse_tool_call(value: &serde_json::Value) -> Option<ToolCall> {
    let function = value.get("function")?;
    let raw_args = function.get("arguments").and_then(|v| v.as_str());
    let arguments = raw_args
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_else(|| {
            serde_json::Value::String(raw_args.unwrap_or_default().to_string())
        });
    Some(ToolCall {
        id: value.get("id")?.as_str()?.to_string(),
        name: function.get("name")?.as_str()?.to_string(),
        arguments,
    })
}

/// Map an HTTP status to the error taxonomy. Quota and permission failures
/// get their own non-retryable variants; everything else becomes `Remote`
/// with a class string and a retryability flag.
fn classify_status(status: u16, body: String) -> Error {
    match status {
        402 => Error::QuotaExceeded(body),
        403 => Error::PermissionDenied(body),
        _ => {
            let class = match status {
                400 => "invalid_request",
                401 => "authentication",
                404 => "not_found",
                408 => "timeout",
                413 => "request_too_large",
                429 => "rate_limited",
                529 => "overloaded",
                s if s >= 500 => "server_error",
                _ => "http_error",
            };
            let retryable = matches!(class, "rate_limited" | "overloaded" | "server_error" | "timeout");
            Error::Remote {
                status,
                class: class.to_string(),
                message: body,
                retryable,
                retry_after_ms: None,
            }
        }
    }
}

/// Parse one SSE `data:` payload into a delta, unless it is the `[DONE]`
/// sentinel.
fn parse_sse_payload(payload: &str) -> Option<ChatDelta> {
    if payload == "[DONE]" {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    let choice = value.get("choices").and_then(|c| c.get(0));
    let delta = choice.and_then(|c| c.get("delta"));
    Some(ChatDelta {
        role: delta
            .and_then(|d| d.get("role"))
            .map(|v| parse_role(Some(v))),
        content: delta
            .and_then(|d| d.get("content"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        finish_reason: choice
            .and_then(|c| c.get("finish_reason"))
            .and_then(|v| v.as_str())
            .map(str::to_string),
        usage: parse_usage(value.get("usage")),
    })
}

#[async_trait]
impl ChatHandler for HttpBackend {
    async fn chat(&self, request: ChatRequest, cancel: CancellationToken) -> Result<ChatResponse> {
        let call = async {
            let response = self.send(&request, false).await?;
            let value: serde_json::Value = response.json().await.map_err(Error::Transport)?;
            Self::parse_response(value)
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = call => result,
        }
    }

    async fn chat_stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<DeltaStream> {
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            r = self.send(&request, true) => r?,
        };

        struct SseState {
            bytes: futures::stream::BoxStream<'static, reqwest::Result<bytes::Bytes>>,
            buf: String,
            queue: VecDeque<ChatDelta>,
            cancel: CancellationToken,
            done: bool,
        }

        impl SseState {
            fn drain_lines(&mut self) {
                while let Some(pos) = self.buf.find('\n') {
                    let line: String = self.buf.drain(..=pos).collect();
                    let line = line.trim();
                    if let Some(payload) = line.strip_prefix("data:") {
                        match parse_sse_payload(payload.trim()) {
                            Some(delta) => self.queue.push_back(delta),
                            None => self.done = true, // [DONE]
                        }
                    }
                }
            }
        }

        let state = SseState {
            bytes: response.bytes_stream().boxed(),
            buf: String::new(),
            queue: VecDeque::new(),
            cancel,
            done: false,
        };

        Ok(Box::pin(futures::stream::unfold(state, |mut st| async move {
            loop {
                if let Some(delta) = st.queue.pop_front() {
                    return Some((Ok(delta), st));
                }
                if st.done {
                    return None;
                }
                let next = tokio::select! {
                    _ = st.cancel.cancelled() => {
                        st.done = true;
                        return Some((Err(Error::Cancelled), st));
                    }
                    chunk = st.bytes.next() => chunk,
                };
                match next {
                    Some(Ok(chunk)) => {
                        st.buf.push_str(&String::from_utf8_lossy(&chunk));
                        st.drain_lines();
                    }
                    Some(Err(e)) => {
                        st.done = true;
                        return Some((Err(Error::Transport(e)), st));
                    }
                    None => {
                        st.done = true;
                        // Trailing payload without a final newline.
                        st.buf.push('\n');
                        st.drain_lines();
                        if st.queue.is_empty() {
                            return None;
                        }
                    }
                }
            }
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ping;
    use crate::types::Message;

    fn config(base_url: &str) -> ClientConfig {
        ClientConfig::new("x", base_url, "test-model").with_api_key("sk-test")
    }

    #[tokio::test]
    async fn unary_call_parses_content_and_usage() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "choices": [{
                        "message": {"role": "assistant", "content": "pong"},
                        "finish_reason": "stop"
                    }],
                    "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let backend = HttpBackend::new(&config(&server.url())).unwrap();
        let response = backend
            .chat(ping(), CancellationToken::new())
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.content, "pong");
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
        assert_eq!(response.usage.unwrap().total_tokens, 4);
    }

    #[tokio::test]
    async fn tool_call_arguments_are_parsed_from_json_strings() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "choices": [{
                        "message": {
                            "role": "assistant",
                            "content": null,
                            "tool_calls": [{
                                "id": "call_1",
                                "type": "function",
                                "function": {"name": "lookup", "arguments": "{\"q\": \"rust\"}"}
                            }]
                        },
                        "finish_reason": "tool_calls"
                    }]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let backend = HttpBackend::new(&config(&server.url())).unwrap();
        let response = backend
            .chat(ping(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "lookup");
        assert_eq!(response.tool_calls[0].arguments["q"], "rust");
    }

    #[tokio::test]
    async fn rate_limited_status_is_retryable_remote_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(429)
            .with_body("slow down")
            .create_async()
            .await;

        let backend = HttpBackend::new(&config(&server.url())).unwrap();
        let err = backend
            .chat(ping(), CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            Error::Remote {
                status,
                class,
                retryable,
                ..
            } => {
                assert_eq!(status, 429);
                assert_eq!(class, "rate_limited");
                assert!(retryable);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn forbidden_status_maps_to_permission_denied() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(403)
            .with_body("no access")
            .create_async()
            .await;

        let backend = HttpBackend::new(&config(&server.url())).unwrap();
        let err = backend
            .chat(ping(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn streaming_parses_sse_deltas() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"he\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"llo\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":2,\"completion_tokens\":1,\"total_tokens\":3}}\n\n",
            "data: [DONE]\n\n",
        );
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let backend = HttpBackend::new(&config(&server.url())).unwrap();
        let stream = backend
            .chat_stream(ping(), CancellationToken::new())
            .await
            .unwrap();
        let deltas: Vec<ChatDelta> = stream.map(|d| d.unwrap()).collect().await;

        let text: String = deltas.iter().map(|d| d.content.as_str()).collect();
        assert_eq!(text, "hello");
        assert_eq!(deltas[0].role, Some(MessageRole::Assistant));
        let last = deltas.last().unwrap();
        assert_eq!(last.finish_reason.as_deref(), Some("stop"));
        assert_eq!(last.usage.unwrap().total_tokens, 3);
    }

    #[test]
    fn request_body_carries_options_and_tool_turns() {
        let config = ClientConfig::new("x", "https://api.example.com", "m").with_api_key("sk");
        let backend = HttpBackend::new(&config).unwrap();

        let request = ChatRequest::new(vec![
            Message::user("q"),
            Message::assistant_tool_calls(
                "",
                vec![ToolCall {
                    id: "c1".into(),
                    name: "lookup".into(),
                    arguments: serde_json::json!({"q": 1}),
                }],
            ),
            Message::tool_result("c1", "42"),
        ])
        .with_options(crate::types::ChatOptions {
            temperature: Some(0.5),
            max_tokens: Some(100),
            ..Default::default()
        });

        let body = backend.request_body(&request, true);
        assert_eq!(body["model"], "m");
        assert_eq!(body["temperature"], 0.5);
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][1]["tool_calls"][0]["function"]["name"], "lookup");
        assert_eq!(body["messages"][2]["tool_call_id"], "c1");
    }
}
