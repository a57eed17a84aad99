//! Deterministic fakes shared by unit tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::pipeline::{ChatHandler, DeltaStream};
use crate::types::{
    ChatDelta, ChatOptions, ChatRequest, ChatResponse, Message, ToolCall, ToolInvoker, ToolResult,
};
use crate::{Error, Result};

/// A `ChatHandler` that plays back scripted responses and streams while
/// counting invocations.
pub(crate) struct ScriptedBackend {
    script: Mutex<VecDeque<Result<ChatResponse>>>,
    stream_script: Mutex<VecDeque<Vec<ChatDelta>>>,
    stream_errors: Mutex<VecDeque<Error>>,
    default_response: Option<ChatResponse>,
    calls: AtomicU32,
    stream_calls: AtomicU32,
    last_request: Mutex<Option<ChatRequest>>,
}

impl ScriptedBackend {
    pub fn new(script: Vec<Result<ChatResponse>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            stream_script: Mutex::new(VecDeque::new()),
            stream_errors: Mutex::new(VecDeque::new()),
            default_response: None,
            calls: AtomicU32::new(0),
            stream_calls: AtomicU32::new(0),
            last_request: Mutex::new(None),
        }
    }

    /// Answers every unary call with the same response.
    pub fn always_ok(text: &str) -> Self {
        let mut backend = Self::new(Vec::new());
        backend.default_response = Some(ChatResponse::assistant(text));
        backend
    }

    pub fn with_stream_deltas(mut self, streams: Vec<Vec<ChatDelta>>) -> Self {
        self.stream_script = Mutex::new(streams.into());
        self
    }

    pub fn with_stream_errors(mut self, errors: Vec<Error>) -> Self {
        self.stream_errors = Mutex::new(errors.into());
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> u32 {
        self.stream_calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<ChatRequest> {
        self.last_request.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatHandler for ScriptedBackend {
    async fn chat(&self, request: ChatRequest, _cancel: CancellationToken) -> Result<ChatResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request);
        if let Some(next) = self.script.lock().unwrap().pop_front() {
            return next;
        }
        match &self.default_response {
            Some(response) => Ok(response.clone()),
            None => Err(Error::runtime("scripted backend exhausted")),
        }
    }

    async fn chat_stream(
        &self,
        request: ChatRequest,
        _cancel: CancellationToken,
    ) -> Result<DeltaStream> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request);
        if let Some(err) = self.stream_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        if let Some(deltas) = self.stream_script.lock().unwrap().pop_front() {
            let items: Vec<Result<ChatDelta>> = deltas.into_iter().map(Ok).collect();
            return Ok(Box::pin(tokio_stream::iter(items)));
        }
        Err(Error::runtime("no scripted stream available"))
    }
}

/// A `ToolInvoker` that counts invocations; optionally always failing.
pub(crate) struct CountingInvoker {
    invocations: AtomicU32,
    fail: bool,
}

impl CountingInvoker {
    pub fn new() -> Self {
        Self {
            invocations: AtomicU32::new(0),
            fail: false,
        }
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn invocations(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolInvoker for CountingInvoker {
    async fn invoke(&self, call: &ToolCall) -> Result<ToolResult> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Error::runtime("tool unavailable"));
        }
        Ok(ToolResult::ok(
            &call.id,
            serde_json::json!({ "tool": call.name, "status": "ok" }),
        ))
    }
}

/// The canonical "ping" request used across tests.
pub(crate) fn ping() -> ChatRequest {
    ChatRequest::new(vec![Message::user("ping")])
}

pub(crate) fn request_with_id(id: &str) -> ChatRequest {
    ping().with_options(ChatOptions {
        request_id: Some(id.to_string()),
        ..Default::default()
    })
}
