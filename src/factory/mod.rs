//! 客户端工厂：按名称惰性构建、缓存与刷新请求流水线，并提供健康回退。
//!
//! # Client Registry / Factory
//!
//! Holds one immutable configuration snapshot and a concurrent
//! name→handle cache. A client is built lazily on first request for its
//! name: concurrent first callers collapse to exactly one build (the
//! losers await it), and a failed build leaves nothing cached so the next
//! access retries. Refreshing a name (or all) evicts the handle; a new
//! configuration snapshot evicts every handle and every cached health
//! status.
//!
//! Fallback selection consults the TTL-cached health map (see [`health`])
//! and skips known-unhealthy candidates without attempting a build.

mod health;

pub use health::{HealthStatus, HEALTH_TTL, PROBE_TIMEOUT};

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::backend::HttpBackend;
use crate::config::{ClientConfig, GatewayConfig};
use crate::pipeline::{ChatHandler, Pipeline, PipelineBuilder, PipelineDeps};
use crate::{Error, ErrorContext, Result};

/// A realized, reusable pipeline for one configured name.
pub type ModelClient = Arc<Pipeline>;

type BackendFactory = dyn Fn(&ClientConfig) -> Result<Arc<dyn ChatHandler>> + Send + Sync;

pub struct ClientFactory {
    snapshot: ArcSwap<GatewayConfig>,
    deps: PipelineDeps,
    backend_factory: Box<BackendFactory>,
    handles: RwLock<HashMap<String, Arc<OnceCell<ModelClient>>>>,
    health: RwLock<HashMap<String, HealthStatus>>,
    update_task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientFactory {
    pub fn new(config: GatewayConfig, deps: PipelineDeps) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(config),
            deps,
            backend_factory: Box::new(|config| {
                Ok(Arc::new(HttpBackend::new(config)?) as Arc<dyn ChatHandler>)
            }),
            handles: RwLock::new(HashMap::new()),
            health: RwLock::new(HashMap::new()),
            update_task: Mutex::new(None),
        }
    }

    /// Replace the backend-adapter constructor. Primarily for tests and
    /// for embedding non-HTTP backends.
    pub fn with_backend_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&ClientConfig) -> Result<Arc<dyn ChatHandler>> + Send + Sync + 'static,
    {
        self.backend_factory = Box::new(factory);
        self
    }

    /// Names available in the current snapshot, sorted.
    pub fn available_clients(&self) -> Vec<String> {
        self.snapshot.load().names()
    }

    pub fn default_provider(&self) -> Option<String> {
        self.snapshot.load().default_provider.clone()
    }

    /// The cached client for `name`, building it exactly once on first
    /// access. Concurrent callers await the same build; a build failure is
    /// not cached.
    pub async fn client(&self, name: &str) -> Result<ModelClient> {
        let cell = self.handle_cell(name);
        cell.get_or_try_init(|| async { self.build(name) })
            .await
            .cloned()
    }

    /// The client for the configured default provider.
    pub async fn default_client(&self) -> Result<ModelClient> {
        let name = self.default_provider().ok_or_else(|| {
            Error::configuration_with_context(
                "no default provider configured",
                ErrorContext::new().with_field_path("default_provider"),
            )
        })?;
        self.client(&name).await
    }

    /// Iterate `name` then `fallbacks` in order, skipping candidates whose
    /// cached health status says unhealthy without attempting a build, and
    /// return the first that is healthy and builds. When `fallbacks` is
    /// empty the candidate list extends with the name's configured
    /// fallbacks and the global fallback providers. Exhaustion raises one
    /// error aggregating every attempt.
    pub async fn client_with_fallback(
        &self,
        name: &str,
        fallbacks: &[String],
        cancel: CancellationToken,
    ) -> Result<ModelClient> {
        let mut candidates: Vec<String> = vec![name.to_string()];
        if fallbacks.is_empty() {
            let snapshot = self.snapshot.load();
            if let Some(config) = snapshot.get(name) {
                candidates.extend(config.fallbacks.iter().cloned());
            }
            candidates.extend(snapshot.fallback_providers.iter().cloned());
        } else {
            candidates.extend(fallbacks.iter().cloned());
        }
        candidates.dedup();

        let mut attempts: Vec<(String, String)> = Vec::new();
        for candidate in candidates {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if let Some(status) = self.cached_health(&candidate) {
                if !status.healthy {
                    attempts.push((
                        candidate.clone(),
                        format!(
                            "skipped: cached unhealthy ({})",
                            status.error.unwrap_or_else(|| "no error".to_string())
                        ),
                    ));
                    continue;
                }
            }
            match self.client(&candidate).await {
                Ok(client) => return Ok(client),
                Err(e) => attempts.push((candidate.clone(), e.to_string())),
            }
        }
        Err(Error::FallbackExhausted { attempts })
    }

    /// Evict one handle (and its health status). The next access rebuilds
    /// from the current snapshot.
    pub fn refresh(&self, name: &str) {
        self.handles.write().unwrap().remove(name);
        self.health.write().unwrap().remove(name);
        info!(client = name, "client handle evicted");
    }

    /// Evict every handle and every cached health status.
    pub fn refresh_all(&self) {
        self.handles.write().unwrap().clear();
        self.health.write().unwrap().clear();
        info!("all client handles evicted");
    }

    /// Swap the configuration snapshot and evict everything; the next
    /// access per name rebuilds against the new settings.
    pub fn reload(&self, config: GatewayConfig) {
        self.reload_arc(Arc::new(config));
    }

    fn reload_arc(&self, config: Arc<GatewayConfig>) {
        self.snapshot.store(config);
        self.refresh_all();
        info!("configuration snapshot replaced");
    }

    /// Apply snapshots published on `receiver` (e.g. from a
    /// [`ConfigWatcher`](crate::config::ConfigWatcher)) until the factory
    /// is dropped or shut down.
    pub fn subscribe_updates(
        self: &Arc<Self>,
        mut receiver: watch::Receiver<Arc<GatewayConfig>>,
    ) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while receiver.changed().await.is_ok() {
                let config = receiver.borrow_and_update().clone();
                match weak.upgrade() {
                    Some(factory) => factory.reload_arc(config),
                    None => break,
                }
            }
        });
        if let Some(previous) = self.update_task.lock().unwrap().replace(task) {
            previous.abort();
        }
    }

    /// Dispose the snapshot-change subscription and every realized handle,
    /// then clear both caches.
    pub async fn shutdown(&self) {
        if let Some(task) = self.update_task.lock().unwrap().take() {
            task.abort();
        }
        self.handles.write().unwrap().clear();
        self.health.write().unwrap().clear();
    }

    fn handle_cell(&self, name: &str) -> Arc<OnceCell<ModelClient>> {
        if let Some(cell) = self.handles.read().unwrap().get(name) {
            return cell.clone();
        }
        self.handles
            .write()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Construct the pipeline for `name` from the current snapshot.
    /// Unknown names and incomplete configs fail here, never lazily at
    /// call time.
    fn build(&self, name: &str) -> Result<ModelClient> {
        let snapshot = self.snapshot.load();
        let config = snapshot
            .get(name)
            .ok_or_else(|| {
                Error::configuration_with_context(
                    format!("unknown client '{}'", name),
                    ErrorContext::new()
                        .with_field_path(format!("clients.{}", name))
                        .with_source("factory"),
                )
            })?
            .clone();
        config.validate()?;

        let backend = (self.backend_factory)(&config)?;
        let pipeline = PipelineBuilder::new(config, self.deps.clone()).build(backend);
        info!(
            client = name,
            layers = pipeline.layers().len(),
            "client pipeline built"
        );
        Ok(Arc::new(pipeline))
    }

    pub(crate) fn cached_health(&self, name: &str) -> Option<HealthStatus> {
        let map = self.health.read().unwrap();
        map.get(name).filter(|s| s.is_fresh()).cloned()
    }

    pub(crate) fn store_health(&self, status: HealthStatus) {
        self.health
            .write()
            .unwrap()
            .insert(status.name.clone(), status);
    }
}
