//! Audit layer.
//!
//! Persists one [`AuditRecord`] per call to the external audit store.
//! Store failures are logged and swallowed: auditing is a side effect and
//! never fails the caller's request.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{observe_stream, ChatHandler, DeltaStream};
use crate::config::ClientConfig;
use crate::store::{AuditRecord, AuditStore};
use crate::types::usage::{truncate_chars, PREVIEW_LIMIT};
use crate::types::{ChatRequest, ChatResponse};
use crate::Result;

pub struct AuditLayer {
    inner: Arc<dyn ChatHandler>,
    store: Arc<dyn AuditStore>,
    client_name: String,
    model: String,
}

impl AuditLayer {
    pub fn new(inner: Arc<dyn ChatHandler>, store: Arc<dyn AuditStore>, config: &ClientConfig) -> Self {
        Self {
            inner,
            store,
            client_name: config.name.clone(),
            model: config.model.clone(),
        }
    }

    fn record(
        &self,
        request: &ChatRequest,
        trace_id: String,
        output: &str,
        error: Option<String>,
    ) -> AuditRecord {
        AuditRecord {
            trace_id,
            client: self.client_name.clone(),
            model: self.model.clone(),
            user: request
                .options
                .user
                .clone()
                .unwrap_or_else(|| "anonymous".to_string()),
            input_preview: truncate_chars(&request.joined_text(), PREVIEW_LIMIT),
            output_preview: truncate_chars(output, PREVIEW_LIMIT),
            success: error.is_none(),
            error,
            created_at: SystemTime::now(),
        }
    }

    async fn save(store: &Arc<dyn AuditStore>, record: AuditRecord) {
        if let Err(e) = store.save(&record).await {
            warn!(trace_id = record.trace_id.as_str(), error = %e, "audit write failed");
        }
    }

    fn trace_id(request: &ChatRequest) -> String {
        request
            .options
            .request_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }
}

#[async_trait]
impl ChatHandler for AuditLayer {
    async fn chat(&self, request: ChatRequest, cancel: CancellationToken) -> Result<ChatResponse> {
        let trace_id = Self::trace_id(&request);
        match self.inner.chat(request.clone(), cancel).await {
            Ok(response) => {
                let record = self.record(&request, trace_id, &response.content, None);
                Self::save(&self.store, record).await;
                Ok(response)
            }
            Err(e) => {
                let record = self.record(&request, trace_id, "", Some(e.to_string()));
                Self::save(&self.store, record).await;
                Err(e)
            }
        }
    }

    async fn chat_stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<DeltaStream> {
        let trace_id = Self::trace_id(&request);
        let stream = match self.inner.chat_stream(request.clone(), cancel).await {
            Ok(stream) => stream,
            Err(e) => {
                let record = self.record(&request, trace_id, "", Some(e.to_string()));
                Self::save(&self.store, record).await;
                return Err(e);
            }
        };

        let store = self.store.clone();
        let layer_view = self.record(&request, trace_id, "", None);
        Ok(observe_stream(stream, move |summary| async move {
            let mut record = layer_view;
            record.output_preview = truncate_chars(&summary.content, PREVIEW_LIMIT);
            record.success = summary.error.is_none();
            record.error = summary.error;
            Self::save(&store, record).await;
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryAuditStore;
    use crate::testing::{ping, request_with_id, ScriptedBackend};
    use crate::types::ChatDelta;
    use crate::Error;
    use futures::StreamExt;

    fn layer(backend: Arc<ScriptedBackend>, store: Arc<MemoryAuditStore>) -> AuditLayer {
        let config = ClientConfig::new("x", "https://api.example.com", "m");
        AuditLayer::new(backend, store, &config)
    }

    #[tokio::test]
    async fn successful_call_is_audited_with_trace_id() {
        let store = Arc::new(MemoryAuditStore::new());
        let layer = layer(Arc::new(ScriptedBackend::always_ok("pong")), store.clone());

        layer
            .chat(request_with_id("trace-7"), CancellationToken::new())
            .await
            .unwrap();

        let records = store.query_by_trace("trace-7").await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].success);
        assert_eq!(records[0].output_preview, "pong");
    }

    #[tokio::test]
    async fn failed_call_is_audited_with_error() {
        let store = Arc::new(MemoryAuditStore::new());
        let backend = Arc::new(ScriptedBackend::new(vec![Err(Error::runtime("boom"))]));
        let layer = layer(backend, store.clone());

        let _ = layer
            .chat(request_with_id("trace-8"), CancellationToken::new())
            .await;

        let records = store.query_by_trace("trace-8").await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
        assert!(records[0].error.as_deref().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn stream_is_audited_once_after_completion() {
        let store = Arc::new(MemoryAuditStore::new());
        let backend = Arc::new(ScriptedBackend::always_ok("x").with_stream_deltas(vec![vec![
            ChatDelta::content("hel"),
            ChatDelta::content("lo"),
            ChatDelta::finish("stop"),
        ]]));
        let layer = layer(backend, store.clone());

        let stream = layer
            .chat_stream(request_with_id("trace-9"), CancellationToken::new())
            .await
            .unwrap();
        let _: Vec<_> = stream.collect().await;

        let records = store.query_by_trace("trace-9").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].output_preview, "hello");
    }

    #[tokio::test]
    async fn missing_request_ids_are_generated() {
        let store = Arc::new(MemoryAuditStore::new());
        let layer = layer(Arc::new(ScriptedBackend::always_ok("pong")), store.clone());

        layer.chat(ping(), CancellationToken::new()).await.unwrap();
        assert_eq!(store.len(), 1);
    }
}
