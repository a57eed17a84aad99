//! 请求流水线模块：以固定顺序组合各个横切层，统一处理一元与流式调用。
//!
//! # Request Pipeline
//!
//! Every client is a decorator chain: each layer implements the same
//! [`ChatHandler`] contract as the backend adapter, forwarding to an inner
//! layer or short-circuiting. Enabled layers are composed in one canonical
//! outer→inner order:
//!
//! ```text
//! Retry → RateLimit → Logging → Audit → Cache → Usage → Safety → ToolLoop → Backend
//! ```
//!
//! Retry must see every downstream transient failure, including upstream
//! rate-limit rejections. The local RateLimit layer rejects before any
//! logging or audit cost is paid. Cache sits outside Usage so a hit never
//! bills. ToolLoop is innermost because it drives multiple backend
//! round-trips per logical call. Toggling a layer off removes it from the
//! chain without shifting the relative order of the others.
//!
//! ## Layers
//!
//! | Layer | Module | Concern |
//! |-------|--------|---------|
//! | Retry | [`retry`] | bounded re-attempts on transient failures |
//! | RateLimit | [`rate_limit`] | fixed-window per-identity admission |
//! | Logging | [`logging`] | structured request/response logs |
//! | Audit | [`audit`] | persisted call records |
//! | Cache | [`cache`] | exact + semantic response caching |
//! | Usage | [`usage`] | token/cost accounting |
//! | Safety | [`safety`] | content filtering, streaming-safe |
//! | ToolLoop | [`tools`] | bounded tool-call round-trips |

pub mod audit;
pub mod cache;
pub mod logging;
pub mod rate_limit;
pub mod retry;
pub mod safety;
pub mod tools;
pub mod usage;


use async_trait::async_trait;
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::types::{ChatDelta, ChatRequest, ChatResponse, TokenUsage, ToolInvoker};
use crate::{BoxStream, Result};

/// Lazy, ordered, non-restartable sequence of response fragments.
pub type DeltaStream = BoxStream<ChatDelta>;

/// The request contract shared by every layer and the backend adapter.
#[async_trait]
pub trait ChatHandler: Send + Sync {
    /// Unary call: one request, one complete response.
    async fn chat(&self, request: ChatRequest, cancel: CancellationToken) -> Result<ChatResponse>;

    /// Streaming call. The returned sequence is infinite only for the
    /// duration of generation and cannot be restarted.
    async fn chat_stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<DeltaStream>;
}

/// One decorator in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Retry,
    RateLimit,
    Logging,
    Audit,
    Cache,
    Usage,
    Safety,
    ToolLoop,
}

/// Canonical outer→inner order. Enabling a layer inserts it at its
/// position here; it never reorders the others.
pub const CANONICAL_ORDER: [LayerKind; 8] = [
    LayerKind::Retry,
    LayerKind::RateLimit,
    LayerKind::Logging,
    LayerKind::Audit,
    LayerKind::Cache,
    LayerKind::Usage,
    LayerKind::Safety,
    LayerKind::ToolLoop,
];

/// The canonical order filtered to the layers a config enables.
pub fn enabled_layers(config: &crate::config::PipelineConfig) -> Vec<LayerKind> {
    CANONICAL_ORDER
        .iter()
        .copied()
        .filter(|kind| match kind {
            LayerKind::Retry => config.retry_enabled,
            LayerKind::RateLimit => config.rate_limit_enabled,
            LayerKind::Logging => config.logging_enabled,
            LayerKind::Audit => config.audit_enabled,
            LayerKind::Cache => config.cache_enabled,
            LayerKind::Usage => config.usage_enabled,
            LayerKind::Safety => config.safety_enabled,
            LayerKind::ToolLoop => config.tools_enabled,
        })
        .collect()
}

/// Shared collaborators injected into layers at build time. Layers are
/// stateless across requests except through these.
#[derive(Clone)]
pub struct PipelineDeps {
    pub kv: Arc<dyn crate::store::KvStore>,
    pub usage: Arc<dyn crate::store::UsageStore>,
    pub audit: Arc<dyn crate::store::AuditStore>,
    /// Tool catalog seam; the ToolLoop layer is skipped when absent.
    pub tools: Option<Arc<dyn ToolInvoker>>,
    /// Shared breaker consulted by the retry layer.
    pub breaker: Option<Arc<crate::resilience::CircuitBreaker>>,
    /// Override for the semantic-cache comparator.
    pub comparator: Option<Arc<dyn crate::cache::QueryComparator>>,
}

impl PipelineDeps {
    /// In-memory collaborators; suitable for tests and single-process use.
    pub fn in_memory() -> Self {
        Self {
            kv: Arc::new(crate::store::MemoryKvStore::default()),
            usage: Arc::new(crate::store::MemoryUsageStore::new()),
            audit: Arc::new(crate::store::MemoryAuditStore::new()),
            tools: None,
            breaker: None,
            comparator: None,
        }
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolInvoker>) -> Self {
        self.tools = Some(tools);
        self
    }
}

/// A realized chain for one named client.
pub struct Pipeline {
    handler: Arc<dyn ChatHandler>,
    layers: Vec<LayerKind>,
    name: String,
    model: String,
}

impl Pipeline {
    /// Effective outer→inner layer order of this chain.
    pub fn layers(&self) -> &[LayerKind] {
        &self.layers
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl ChatHandler for Pipeline {
    async fn chat(&self, request: ChatRequest, cancel: CancellationToken) -> Result<ChatResponse> {
        self.handler.chat(request, cancel).await
    }

    async fn chat_stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<DeltaStream> {
        self.handler.chat_stream(request, cancel).await
    }
}

/// Composes enabled layers around a backend adapter.
pub struct PipelineBuilder {
    config: ClientConfig,
    deps: PipelineDeps,
}

impl PipelineBuilder {
    pub fn new(config: ClientConfig, deps: PipelineDeps) -> Self {
        Self { config, deps }
    }

    pub fn build(self, backend: Arc<dyn ChatHandler>) -> Pipeline {
        let layers: Vec<LayerKind> = enabled_layers(&self.config.pipeline)
            .into_iter()
            .filter(|kind| *kind != LayerKind::ToolLoop || self.deps.tools.is_some())
            .collect();

        let mut handler = backend;
        for kind in layers.iter().rev() {
            handler = match kind {
                LayerKind::ToolLoop => Arc::new(tools::ToolLoopLayer::new(
                    handler,
                    self.deps
                        .tools
                        .clone()
                        .expect("ToolLoop layer requires a ToolInvoker"),
                    &self.config.pipeline,
                )),
                LayerKind::Safety => {
                    Arc::new(safety::SafetyLayer::new(handler, &self.config.pipeline))
                }
                LayerKind::Usage => Arc::new(usage::UsageLayer::new(
                    handler,
                    self.deps.usage.clone(),
                    &self.config,
                )),
                LayerKind::Cache => Arc::new(cache::CacheLayer::new(
                    handler,
                    self.deps.kv.clone(),
                    &self.config,
                    self.deps.comparator.clone(),
                )),
                LayerKind::Audit => Arc::new(audit::AuditLayer::new(
                    handler,
                    self.deps.audit.clone(),
                    &self.config,
                )),
                LayerKind::Logging => {
                    Arc::new(logging::LoggingLayer::new(handler, &self.config))
                }
                LayerKind::RateLimit => Arc::new(rate_limit::RateLimitLayer::new(
                    handler,
                    self.deps.kv.clone(),
                    &self.config,
                )),
                LayerKind::Retry => Arc::new(retry::RetryLayer::new(
                    handler,
                    &self.config.pipeline,
                    self.deps.breaker.clone(),
                )),
            };
        }

        Pipeline {
            handler,
            layers,
            name: self.config.name.clone(),
            model: self.config.model.clone(),
        }
    }
}

/// What a completed (or failed) stream looked like once fully drained.
#[derive(Debug, Default)]
pub(crate) struct StreamSummary {
    pub content: String,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
    pub error: Option<String>,
    pub delta_count: u64,
}

impl StreamSummary {
    fn absorb(&mut self, delta: &ChatDelta) {
        self.content.push_str(&delta.content);
        if delta.finish_reason.is_some() {
            self.finish_reason = delta.finish_reason.clone();
        }
        if let Some(usage) = delta.usage {
            self.usage = Some(usage);
        }
        self.delta_count += 1;
    }
}

/// Pass a stream through unchanged while accumulating a [`StreamSummary`],
/// and run `on_complete` exactly once after the last fragment (or the first
/// error). Deltas are never delayed; the callback runs after delivery.
pub(crate) fn observe_stream<F, Fut>(inner: DeltaStream, on_complete: F) -> DeltaStream
where
    F: FnOnce(StreamSummary) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    struct State<F> {
        inner: DeltaStream,
        summary: StreamSummary,
        on_complete: Option<F>,
        done: bool,
    }

    let state = State {
        inner,
        summary: StreamSummary::default(),
        on_complete: Some(on_complete),
        done: false,
    };

    Box::pin(futures::stream::unfold(state, |mut st| async move {
        if st.done {
            return None;
        }
        match st.inner.next().await {
            Some(Ok(delta)) => {
                st.summary.absorb(&delta);
                Some((Ok(delta), st))
            }
            Some(Err(e)) => {
                st.done = true;
                st.summary.error = Some(e.to_string());
                if let Some(cb) = st.on_complete.take() {
                    cb(std::mem::take(&mut st.summary)).await;
                }
                Some((Err(e), st))
            }
            None => {
                if let Some(cb) = st.on_complete.take() {
                    cb(std::mem::take(&mut st.summary)).await;
                }
                None
            }
        }
    }))
}

/// A single-response synthetic stream, used to replay cached responses and
/// surface block messages on the streaming path.
pub(crate) fn synthetic_stream(response: ChatResponse) -> DeltaStream {
    let delta = ChatDelta {
        role: Some(response.role),
        content: response.content,
        finish_reason: response.finish_reason,
        usage: response.usage,
    };
    Box::pin(futures::stream::iter(vec![Ok(delta)]))
}
