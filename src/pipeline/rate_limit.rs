//! Rate-limit layer.
//!
//! Fixed-window admission per identity, backed by the shared [`KvStore`].
//! The identity is the per-request `user` option, falling back to one
//! anonymous bucket. Rejection happens before any logging, audit, cache or
//! accounting cost is paid.
//!
//! The window state is read and written as two separate store operations,
//! not a single atomic primitive: under concurrent load this admits
//! slightly more requests than the nominal limit. Strict enforcement would
//! require an atomic check-and-decrement on the store seam; the overrun is
//! accepted here as a known limitation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{ChatHandler, DeltaStream};
use crate::config::{ClientConfig, RateLimitSettings};
use crate::store::KvStore;
use crate::types::{ChatRequest, ChatResponse};
use crate::{Error, Result};

const ANONYMOUS_IDENTITY: &str = "anonymous";

/// Window state persisted per `{client}:{identity}` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WindowState {
    count: u32,
    window_start_epoch_secs: u64,
}

/// Remaining-allowance view for observability.
#[derive(Debug, Clone)]
pub struct RateLimitSnapshot {
    pub identity: String,
    pub used: u32,
    pub limit: u32,
    pub window_resets_in_secs: u64,
}

pub struct RateLimitLayer {
    inner: Arc<dyn ChatHandler>,
    kv: Arc<dyn KvStore>,
    client_name: String,
    settings: RateLimitSettings,
}

impl RateLimitLayer {
    pub fn new(inner: Arc<dyn ChatHandler>, kv: Arc<dyn KvStore>, config: &ClientConfig) -> Self {
        Self {
            inner,
            kv,
            client_name: config.name.clone(),
            settings: config.rate_limit.clone(),
        }
    }

    fn key(&self, identity: &str) -> String {
        format!("ratelimit:{}:{}", self.client_name, identity)
    }

    fn resolve_identity(request: &ChatRequest) -> String {
        request
            .options
            .user
            .clone()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| ANONYMOUS_IDENTITY.to_string())
    }

    fn now_epoch_secs() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    async fn load_window(&self, key: &str) -> WindowState {
        let now = Self::now_epoch_secs();
        let fresh = WindowState {
            count: 0,
            window_start_epoch_secs: now,
        };
        let raw = match self.kv.get(key).await {
            Ok(v) => v,
            Err(e) => {
                // Fail open: an unreachable limiter store must not take the
                // whole gateway down with it.
                warn!(key, error = %e, "rate-limit store read failed, admitting request");
                return fresh;
            }
        };
        match raw.and_then(|bytes| serde_json::from_slice::<WindowState>(&bytes).ok()) {
            Some(state) if now < state.window_start_epoch_secs + self.settings.window_secs => state,
            _ => fresh,
        }
    }

    /// Check the current window and record this request.
    ///
    /// Read and write are deliberately two store round-trips; see the
    /// module docs for the concurrency caveat.
    async fn check_and_count(&self, identity: &str) -> Result<()> {
        let key = self.key(identity);
        let state = self.load_window(&key).await;

        if state.count >= self.settings.max_requests {
            let elapsed = Self::now_epoch_secs().saturating_sub(state.window_start_epoch_secs);
            return Err(Error::RateLimited {
                client: self.client_name.clone(),
                identity: identity.to_string(),
                retry_after_secs: self.settings.window_secs.saturating_sub(elapsed),
            });
        }

        let next = WindowState {
            count: state.count + 1,
            window_start_epoch_secs: state.window_start_epoch_secs,
        };
        let ttl = Duration::from_secs(self.settings.window_secs.saturating_mul(2).max(1));
        if let Err(e) = self
            .kv
            .set(&key, &serde_json::to_vec(&next)?, ttl)
            .await
        {
            warn!(key, error = %e, "rate-limit store write failed");
        }
        Ok(())
    }

    /// Remaining-allowance view for one identity.
    pub async fn snapshot(&self, identity: &str) -> RateLimitSnapshot {
        let state = self.load_window(&self.key(identity)).await;
        let elapsed = Self::now_epoch_secs().saturating_sub(state.window_start_epoch_secs);
        RateLimitSnapshot {
            identity: identity.to_string(),
            used: state.count,
            limit: self.settings.max_requests,
            window_resets_in_secs: self.settings.window_secs.saturating_sub(elapsed),
        }
    }
}

#[async_trait]
impl ChatHandler for RateLimitLayer {
    async fn chat(&self, request: ChatRequest, cancel: CancellationToken) -> Result<ChatResponse> {
        let identity = Self::resolve_identity(&request);
        self.check_and_count(&identity).await?;
        self.inner.chat(request, cancel).await
    }

    async fn chat_stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<DeltaStream> {
        let identity = Self::resolve_identity(&request);
        self.check_and_count(&identity).await?;
        self.inner.chat_stream(request, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::store::MemoryKvStore;
    use crate::testing::{ping, ScriptedBackend};
    use crate::types::ChatOptions;

    fn layer(max_requests: u32, window_secs: u64, backend: Arc<ScriptedBackend>) -> RateLimitLayer {
        let mut config = ClientConfig::new("x", "https://api.example.com", "m");
        config.rate_limit = RateLimitSettings {
            max_requests,
            window_secs,
        };
        config.pipeline = PipelineConfig::default();
        RateLimitLayer::new(backend, Arc::new(MemoryKvStore::default()), &config)
    }

    fn request_as(user: &str) -> ChatRequest {
        ping().with_options(ChatOptions {
            user: Some(user.to_string()),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn admits_up_to_limit_then_rejects() {
        let backend = Arc::new(ScriptedBackend::always_ok("pong"));
        let layer = layer(2, 60, backend.clone());

        layer.chat(ping(), CancellationToken::new()).await.unwrap();
        layer.chat(ping(), CancellationToken::new()).await.unwrap();
        let err = layer
            .chat(ping(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RateLimited { .. }));
        // The rejected request never reached the inner layer.
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn identities_have_separate_buckets() {
        let backend = Arc::new(ScriptedBackend::always_ok("pong"));
        let layer = layer(1, 60, backend.clone());

        layer
            .chat(request_as("alice"), CancellationToken::new())
            .await
            .unwrap();
        layer
            .chat(request_as("bob"), CancellationToken::new())
            .await
            .unwrap();
        let err = layer
            .chat(request_as("alice"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RateLimited { identity, .. } if identity == "alice"));
    }

    #[tokio::test]
    async fn missing_user_falls_back_to_anonymous_bucket() {
        let backend = Arc::new(ScriptedBackend::always_ok("pong"));
        let layer = layer(1, 60, backend);

        layer.chat(ping(), CancellationToken::new()).await.unwrap();
        let err = layer
            .chat(ping(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RateLimited { identity, .. } if identity == "anonymous"));
    }

    #[tokio::test]
    async fn window_resets_after_ttl() {
        let backend = Arc::new(ScriptedBackend::always_ok("pong"));
        let layer = layer(1, 1, backend);

        layer.chat(ping(), CancellationToken::new()).await.unwrap();
        assert!(layer.chat(ping(), CancellationToken::new()).await.is_err());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        layer.chat(ping(), CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn snapshot_reports_remaining_allowance() {
        let backend = Arc::new(ScriptedBackend::always_ok("pong"));
        let layer = layer(5, 60, backend);

        layer
            .chat(request_as("alice"), CancellationToken::new())
            .await
            .unwrap();
        let snap = layer.snapshot("alice").await;
        assert_eq!(snap.used, 1);
        assert_eq!(snap.limit, 5);
        assert!(snap.window_resets_in_secs <= 60);
    }

    #[tokio::test]
    async fn streaming_calls_share_the_same_window() {
        let backend =
            Arc::new(ScriptedBackend::always_ok("pong").with_stream_deltas(vec![vec![
                crate::types::ChatDelta::content("pong"),
            ]]));
        let layer = layer(1, 60, backend);

        let _stream = layer
            .chat_stream(ping(), CancellationToken::new())
            .await
            .unwrap();
        let err = layer
            .chat(ping(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RateLimited { .. }));
    }
}
