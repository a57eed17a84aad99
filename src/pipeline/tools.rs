//! Tool-call loop layer.
//!
//! Innermost layer, adjacent to the backend: when a response carries tool
//! invocations, this layer executes them through the injected
//! [`ToolInvoker`], appends the assistant turn and the tool results to the
//! conversation and resubmits, until the backend returns a final answer or
//! the configured iteration cap is reached. Exceeding the cap is a terminal
//! error, not a silent truncation.
//!
//! Multiple calls requested in one turn run sequentially or concurrently
//! per configuration. A failing tool does not abort the loop; its error is
//! fed back as an error-tagged result so the model can recover.
//!
//! Streaming calls pass through untouched: the loop's round-trips only
//! apply to unary calls, and streamed tool invocations are delivered to
//! the caller as-is.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ChatHandler, DeltaStream};
use crate::config::PipelineConfig;
use crate::types::{ChatRequest, ChatResponse, Message, ToolCall, ToolInvoker, ToolResult};
use crate::{Error, Result};

pub struct ToolLoopLayer {
    inner: Arc<dyn ChatHandler>,
    invoker: Arc<dyn ToolInvoker>,
    max_iterations: u32,
    parallel: bool,
}

impl ToolLoopLayer {
    pub fn new(
        inner: Arc<dyn ChatHandler>,
        invoker: Arc<dyn ToolInvoker>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            inner,
            invoker,
            max_iterations: config.max_tool_iterations.max(1),
            parallel: config.parallel_tools,
        }
    }

    async fn run_tools(&self, calls: &[ToolCall]) -> Vec<ToolResult> {
        if self.parallel {
            join_all(calls.iter().map(|call| self.run_one(call))).await
        } else {
            let mut results = Vec::with_capacity(calls.len());
            for call in calls {
                results.push(self.run_one(call).await);
            }
            results
        }
    }

    async fn run_one(&self, call: &ToolCall) -> ToolResult {
        match self.invoker.invoke(call).await {
            Ok(result) => result,
            Err(e) => ToolResult::error(&call.id, e.to_string()),
        }
    }
}

#[async_trait]
impl ChatHandler for ToolLoopLayer {
    async fn chat(&self, request: ChatRequest, cancel: CancellationToken) -> Result<ChatResponse> {
        let mut messages = request.messages.clone();
        let options = request.options.clone();

        for iteration in 0..self.max_iterations {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let round = ChatRequest {
                messages: messages.clone(),
                options: options.clone(),
            };
            let response = self.inner.chat(round, cancel.clone()).await?;
            if !response.has_tool_calls() {
                return Ok(response);
            }

            debug!(
                iteration,
                calls = response.tool_calls.len(),
                "executing requested tool calls"
            );
            let results = self.run_tools(&response.tool_calls).await;

            messages.push(Message::assistant_tool_calls(
                response.content.clone(),
                response.tool_calls.clone(),
            ));
            for result in results {
                let content = match &result.content {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                messages.push(Message::tool_result(&result.tool_call_id, content));
            }
        }

        Err(Error::ToolLoopExceeded {
            iterations: self.max_iterations,
        })
    }

    async fn chat_stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<DeltaStream> {
        self.inner.chat_stream(request, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ping, CountingInvoker, ScriptedBackend};
    use crate::types::MessageRole;

    fn tool_response(calls: Vec<ToolCall>) -> ChatResponse {
        ChatResponse {
            content: String::new(),
            role: MessageRole::Assistant,
            finish_reason: Some("tool_calls".into()),
            tool_calls: calls,
            usage: None,
        }
    }

    fn call(id: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: "lookup".into(),
            arguments: serde_json::json!({"q": id}),
        }
    }

    fn config(max_iterations: u32, parallel: bool) -> PipelineConfig {
        PipelineConfig {
            max_tool_iterations: max_iterations,
            parallel_tools: parallel,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn executes_tools_and_returns_final_answer() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            Ok(tool_response(vec![call("c1")])),
            Ok(ChatResponse::assistant("final")),
        ]));
        let invoker = Arc::new(CountingInvoker::new());
        let layer = ToolLoopLayer::new(backend.clone(), invoker.clone(), &config(5, false));

        let response = layer.chat(ping(), CancellationToken::new()).await.unwrap();
        assert_eq!(response.content, "final");
        assert_eq!(invoker.invocations(), 1);
        assert_eq!(backend.calls(), 2);

        // The resubmitted conversation carries the tool exchange.
        let resubmitted = backend.last_request().unwrap();
        assert!(resubmitted
            .messages
            .iter()
            .any(|m| m.role == MessageRole::Assistant && !m.tool_calls.is_empty()));
        assert!(resubmitted
            .messages
            .iter()
            .any(|m| m.role == MessageRole::Tool && m.tool_call_id.as_deref() == Some("c1")));
    }

    #[tokio::test]
    async fn multiple_calls_in_one_turn_all_execute() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            Ok(tool_response(vec![call("c1"), call("c2"), call("c3")])),
            Ok(ChatResponse::assistant("done")),
        ]));
        let invoker = Arc::new(CountingInvoker::new());
        let layer = ToolLoopLayer::new(backend, invoker.clone(), &config(5, true));

        layer.chat(ping(), CancellationToken::new()).await.unwrap();
        assert_eq!(invoker.invocations(), 3);
    }

    #[tokio::test]
    async fn iteration_cap_is_a_terminal_error() {
        // Backend keeps requesting tools forever.
        let backend = Arc::new(ScriptedBackend::new(
            (0..10)
                .map(|i| Ok(tool_response(vec![call(&format!("c{}", i))])))
                .collect(),
        ));
        let invoker = Arc::new(CountingInvoker::new());
        let layer = ToolLoopLayer::new(backend, invoker, &config(3, false));

        let err = layer
            .chat(ping(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ToolLoopExceeded { iterations: 3 }));
    }

    #[tokio::test]
    async fn tool_failure_is_fed_back_as_error_result() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            Ok(tool_response(vec![call("c1")])),
            Ok(ChatResponse::assistant("recovered")),
        ]));
        let invoker = Arc::new(CountingInvoker::new().failing());
        let layer = ToolLoopLayer::new(backend.clone(), invoker, &config(5, false));

        let response = layer.chat(ping(), CancellationToken::new()).await.unwrap();
        assert_eq!(response.content, "recovered");
        let resubmitted = backend.last_request().unwrap();
        let tool_turn = resubmitted
            .messages
            .iter()
            .find(|m| m.role == MessageRole::Tool)
            .unwrap();
        assert!(tool_turn.content.contains("tool unavailable"));
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let backend = Arc::new(ScriptedBackend::new(vec![Ok(tool_response(vec![call(
            "c1",
        )]))]));
        let invoker = Arc::new(CountingInvoker::new());
        let layer = ToolLoopLayer::new(backend, invoker, &config(5, false));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = layer.chat(ping(), cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
