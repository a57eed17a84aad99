//! Usage accounting layer.
//!
//! Opens a `Running` record before forwarding and finalizes it exactly once
//! after the call settles. Backend-reported token counts are used verbatim
//! when present and non-zero; otherwise the heuristic estimator runs over
//! the request and response text. Cost comes from the client's price table.
//! Store failures are logged and swallowed — accounting never fails the
//! caller's request.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{observe_stream, ChatHandler, DeltaStream};
use crate::config::ClientConfig;
use crate::store::UsageStore;
use crate::tokens::{estimate_tokens, PriceTable};
use crate::types::{ChatRequest, ChatResponse, TokenUsage, UsageRecord};
use crate::Result;

pub struct UsageLayer {
    inner: Arc<dyn ChatHandler>,
    store: Arc<dyn UsageStore>,
    client_name: String,
    model: String,
    prices: PriceTable,
}

impl UsageLayer {
    pub fn new(inner: Arc<dyn ChatHandler>, store: Arc<dyn UsageStore>, config: &ClientConfig) -> Self {
        Self {
            inner,
            store,
            client_name: config.name.clone(),
            model: config.model.clone(),
            prices: config.price_table(),
        }
    }

    fn open_record(&self, request: &ChatRequest) -> UsageRecord {
        UsageRecord::start(
            &self.client_name,
            &self.model,
            request.options.user.as_deref().unwrap_or("anonymous"),
            &request.joined_text(),
        )
    }

    /// Token counts: backend usage verbatim when present and non-zero,
    /// heuristic estimate otherwise.
    fn resolve_tokens(request_text: &str, output: &str, reported: Option<TokenUsage>) -> (u32, u32) {
        match reported {
            Some(usage) if !usage.is_empty() => (usage.prompt_tokens, usage.completion_tokens),
            _ => (estimate_tokens(request_text), estimate_tokens(output)),
        }
    }

    async fn persist_start(&self, record: &UsageRecord) {
        if let Err(e) = self.store.record_start(record).await {
            warn!(record_id = record.id.as_str(), error = %e, "usage start write failed");
        }
    }

    async fn persist_completion(store: &Arc<dyn UsageStore>, record: &UsageRecord) {
        if let Err(e) = store.record_completion(record).await {
            warn!(record_id = record.id.as_str(), error = %e, "usage completion write failed");
        }
    }
}

#[async_trait]
impl ChatHandler for UsageLayer {
    async fn chat(&self, request: ChatRequest, cancel: CancellationToken) -> Result<ChatResponse> {
        let mut record = self.open_record(&request);
        self.persist_start(&record).await;

        let request_text = request.joined_text();
        match self.inner.chat(request, cancel).await {
            Ok(response) => {
                let (prompt, completion) =
                    Self::resolve_tokens(&request_text, &response.content, response.usage);
                let cost = self.prices.cost(prompt, completion, 0).total_cost;
                record.complete(prompt, completion, cost, &response.content);
                Self::persist_completion(&self.store, &record).await;
                Ok(response)
            }
            Err(e) => {
                record.fail(e.to_string());
                Self::persist_completion(&self.store, &record).await;
                Err(e)
            }
        }
    }

    async fn chat_stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<DeltaStream> {
        let mut record = self.open_record(&request);
        self.persist_start(&record).await;

        let request_text = request.joined_text();
        let stream = match self.inner.chat_stream(request, cancel).await {
            Ok(stream) => stream,
            Err(e) => {
                record.fail(e.to_string());
                Self::persist_completion(&self.store, &record).await;
                return Err(e);
            }
        };

        // Accumulate every textual delta plus any mid-stream usage fragment
        // and finalize exactly once after the stream ends.
        let store = self.store.clone();
        let prices = self.prices.clone();
        Ok(observe_stream(stream, move |summary| async move {
            match summary.error {
                None => {
                    let (prompt, completion) =
                        Self::resolve_tokens(&request_text, &summary.content, summary.usage);
                    let cost = prices.cost(prompt, completion, 0).total_cost;
                    record.complete(prompt, completion, cost, &summary.content);
                }
                Some(error) => record.fail(error),
            }
            Self::persist_completion(&store, &record).await;
        }))
    }
}
