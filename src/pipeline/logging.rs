//! Logging layer.
//!
//! Structured request/response logs. For streams the open is logged
//! immediately and completion once the stream drains, including the
//! fragment count.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{observe_stream, ChatHandler, DeltaStream};
use crate::config::ClientConfig;
use crate::types::{ChatRequest, ChatResponse};
use crate::Result;

pub struct LoggingLayer {
    inner: Arc<dyn ChatHandler>,
    client_name: String,
    model: String,
}

impl LoggingLayer {
    pub fn new(inner: Arc<dyn ChatHandler>, config: &ClientConfig) -> Self {
        Self {
            inner,
            client_name: config.name.clone(),
            model: config.model.clone(),
        }
    }
}

#[async_trait]
impl ChatHandler for LoggingLayer {
    async fn chat(&self, request: ChatRequest, cancel: CancellationToken) -> Result<ChatResponse> {
        let start = Instant::now();
        let message_count = request.messages.len();
        info!(
            client = self.client_name.as_str(),
            model = self.model.as_str(),
            messages = message_count,
            "chat request started"
        );

        match self.inner.chat(request, cancel).await {
            Ok(response) => {
                info!(
                    client = self.client_name.as_str(),
                    model = self.model.as_str(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    finish_reason = response.finish_reason.as_deref().unwrap_or(""),
                    response_chars = response.content.chars().count(),
                    "chat request completed"
                );
                Ok(response)
            }
            Err(e) => {
                warn!(
                    client = self.client_name.as_str(),
                    model = self.model.as_str(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    error = %e,
                    "chat request failed"
                );
                Err(e)
            }
        }
    }

    async fn chat_stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<DeltaStream> {
        let start = Instant::now();
        info!(
            client = self.client_name.as_str(),
            model = self.model.as_str(),
            messages = request.messages.len(),
            "chat stream started"
        );

        let stream = match self.inner.chat_stream(request, cancel).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    client = self.client_name.as_str(),
                    model = self.model.as_str(),
                    error = %e,
                    "chat stream failed to open"
                );
                return Err(e);
            }
        };

        let client = self.client_name.clone();
        let model = self.model.clone();
        Ok(observe_stream(stream, move |summary| async move {
            match summary.error {
                None => info!(
                    client = client.as_str(),
                    model = model.as_str(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    deltas = summary.delta_count,
                    response_chars = summary.content.chars().count(),
                    "chat stream completed"
                ),
                Some(err) => warn!(
                    client = client.as_str(),
                    model = model.as_str(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    deltas = summary.delta_count,
                    error = err.as_str(),
                    "chat stream failed mid-flight"
                ),
            }
        }))
    }
}
