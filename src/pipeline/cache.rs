//! Cache layer.
//!
//! Two independent lookup paths, tried in order, either of which can
//! short-circuit the call entirely:
//!
//! 1. the exact cache, keyed by a hash of the normalized request;
//! 2. the optional semantic cache, matched by similarity of the last user
//!    turn against previously cached queries.
//!
//! A hit returns the stored response verbatim (original role and finish
//! reason) and performs no blocking I/O beyond the store read, so it is
//! not a cancellation point. On a miss the call proceeds downstream and
//! both entries are written after success; write failures are swallowed.
//! Responses carrying tool calls are never cached — replaying a tool
//! invocation request makes no sense.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{observe_stream, synthetic_stream, ChatHandler, DeltaStream};
use crate::cache::{AtomicCacheStats, CacheKeyBuilder, CacheStats, QueryComparator, SemanticCache};
use crate::config::ClientConfig;
use crate::store::KvStore;
use crate::types::{ChatRequest, ChatResponse, MessageRole};
use crate::Result;

const SEMANTIC_INDEX_CAPACITY: usize = 512;

pub struct CacheLayer {
    inner: Arc<dyn ChatHandler>,
    kv: Arc<dyn KvStore>,
    key_builder: CacheKeyBuilder,
    ttl: Duration,
    semantic: Option<Arc<SemanticCache>>,
    stats: Arc<AtomicCacheStats>,
    model: String,
}

impl CacheLayer {
    pub fn new(
        inner: Arc<dyn ChatHandler>,
        kv: Arc<dyn KvStore>,
        config: &ClientConfig,
        comparator: Option<Arc<dyn QueryComparator>>,
    ) -> Self {
        let pipeline = &config.pipeline;
        let ttl = Duration::from_secs(pipeline.cache_ttl_secs.max(1));
        let semantic = pipeline.semantic_cache_enabled.then(|| {
            Arc::new(match comparator {
                Some(cmp) => SemanticCache::with_comparator(
                    SEMANTIC_INDEX_CAPACITY,
                    pipeline.semantic_threshold,
                    ttl,
                    cmp,
                ),
                None => SemanticCache::new(SEMANTIC_INDEX_CAPACITY, pipeline.semantic_threshold, ttl),
            })
        });
        Self {
            inner,
            kv,
            key_builder: CacheKeyBuilder::new().with_prefix(format!("chat:{}", config.name)),
            ttl,
            semantic,
            stats: Arc::new(AtomicCacheStats::new()),
            model: config.model.clone(),
        }
    }

    /// Counters for this layer instance.
    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    /// The exact-cache key this layer would use for `request`; exposed so
    /// callers can invalidate individual entries through the store.
    pub fn exact_key(&self, request: &ChatRequest) -> String {
        self.key_builder.build(&self.model, request)
    }

    async fn lookup(&self, request: &ChatRequest) -> Option<ChatResponse> {
        let key = self.exact_key(request);
        match self.kv.get(&key).await {
            Ok(Some(bytes)) => {
                if let Ok(response) = serde_json::from_slice::<ChatResponse>(&bytes) {
                    self.stats.record_hit();
                    debug!(key = key.as_str(), "exact cache hit");
                    return Some(response);
                }
                self.stats.record_error();
            }
            Ok(None) => {}
            Err(e) => {
                self.stats.record_error();
                warn!(key = key.as_str(), error = %e, "cache read failed");
            }
        }

        if let (Some(semantic), Some(query)) = (&self.semantic, request.last_user_text()) {
            if let Some(response) = semantic.lookup(query) {
                self.stats.record_hit();
                debug!("semantic cache hit");
                return Some(response);
            }
        }

        self.stats.record_miss();
        None
    }

    fn cacheable(response: &ChatResponse) -> bool {
        !response.has_tool_calls() && !response.content.is_empty()
    }

    async fn store(&self, request: &ChatRequest, response: &ChatResponse) {
        if !Self::cacheable(response) {
            return;
        }
        let key = self.exact_key(request);
        match serde_json::to_vec(response) {
            Ok(bytes) => {
                if let Err(e) = self.kv.set(&key, &bytes, self.ttl).await {
                    self.stats.record_error();
                    warn!(key = key.as_str(), error = %e, "cache write failed");
                } else {
                    self.stats.record_set();
                }
            }
            Err(e) => {
                self.stats.record_error();
                warn!(error = %e, "cache serialization failed");
            }
        }
        if let (Some(semantic), Some(query)) = (&self.semantic, request.last_user_text()) {
            semantic.insert(query, response.clone());
        }
    }
}

#[async_trait]
impl ChatHandler for CacheLayer {
    async fn chat(&self, request: ChatRequest, cancel: CancellationToken) -> Result<ChatResponse> {
        if let Some(hit) = self.lookup(&request).await {
            return Ok(hit);
        }
        let response = self.inner.chat(request.clone(), cancel).await?;
        self.store(&request, &response).await;
        Ok(response)
    }

    async fn chat_stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<DeltaStream> {
        if let Some(hit) = self.lookup(&request).await {
            // Replay the cached text as a synthetic delta sequence.
            return Ok(synthetic_stream(hit));
        }

        let stream = self.inner.chat_stream(request.clone(), cancel).await?;

        // Tee the deltas through unchanged and write one consolidated
        // entry after the stream completes, without delaying delivery.
        let kv = self.kv.clone();
        let key = self.exact_key(&request);
        let ttl = self.ttl;
        let stats = self.stats.clone();
        let semantic = self.semantic.clone();
        let query = request.last_user_text().map(str::to_string);
        Ok(observe_stream(stream, move |summary| async move {
            if summary.error.is_some() || summary.content.is_empty() {
                return;
            }
            let response = ChatResponse {
                content: summary.content,
                role: MessageRole::Assistant,
                finish_reason: summary.finish_reason,
                tool_calls: Vec::new(),
                usage: summary.usage,
            };
            match serde_json::to_vec(&response) {
                Ok(bytes) => {
                    if let Err(e) = kv.set(&key, &bytes, ttl).await {
                        stats.record_error();
                        warn!(key = key.as_str(), error = %e, "cache write failed");
                    } else {
                        stats.record_set();
                    }
                }
                Err(e) => {
                    stats.record_error();
                    warn!(error = %e, "cache serialization failed");
                }
            }
            if let (Some(semantic), Some(query)) = (semantic, query) {
                semantic.insert(query, response);
            }
        }))
    }
}
