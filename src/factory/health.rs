//! Health checks with TTL-cached results.
//!
//! A probe is one minimal round-trip ("ping", one output token) against
//! the realized client, bounded by a short timeout. Results are cached for
//! [`HEALTH_TTL`] regardless of outcome, and probe failures never
//! propagate to the caller — they come back as a non-healthy status with
//! the captured error text.

use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::ClientFactory;
use crate::pipeline::ChatHandler;
use crate::types::{ChatOptions, ChatRequest, Message};

/// How long a cached status answers `check_health` without a new probe.
pub const HEALTH_TTL: Duration = Duration::from_secs(60);

/// Upper bound on one probe round-trip.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Last-known reachability of one configured name.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub name: String,
    pub healthy: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
    pub checked_at: Instant,
}

impl HealthStatus {
    pub fn healthy(name: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            name: name.into(),
            healthy: true,
            latency_ms: Some(latency_ms),
            error: None,
            checked_at: Instant::now(),
        }
    }

    pub fn unhealthy(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            healthy: false,
            latency_ms: None,
            error: Some(error.into()),
            checked_at: Instant::now(),
        }
    }

    pub(crate) fn is_fresh(&self) -> bool {
        self.checked_at.elapsed() < HEALTH_TTL
    }
}

fn probe_request() -> ChatRequest {
    ChatRequest::new(vec![Message::user("ping")]).with_options(ChatOptions {
        max_tokens: Some(1),
        ..Default::default()
    })
}

impl ClientFactory {
    /// Health of one name. A cached status younger than [`HEALTH_TTL`] is
    /// returned unchanged; otherwise one probe runs and the result is
    /// cached regardless of outcome.
    pub async fn check_health(&self, name: &str, cancel: CancellationToken) -> HealthStatus {
        if let Some(status) = self.cached_health(name) {
            debug!(client = name, healthy = status.healthy, "health served from cache");
            return status;
        }
        let status = self.probe(name, cancel).await;
        self.store_health(status.clone());
        status
    }

    /// Probe every configured name concurrently.
    pub async fn check_all_health(&self, cancel: CancellationToken) -> Vec<HealthStatus> {
        let names = self.available_clients();
        futures::future::join_all(
            names
                .iter()
                .map(|name| self.check_health(name, cancel.clone())),
        )
        .await
    }

    async fn probe(&self, name: &str, cancel: CancellationToken) -> HealthStatus {
        let client = match self.client(name).await {
            Ok(client) => client,
            Err(e) => return HealthStatus::unhealthy(name, e.to_string()),
        };

        let started = Instant::now();
        match tokio::time::timeout(PROBE_TIMEOUT, client.chat(probe_request(), cancel)).await {
            Ok(Ok(_)) => HealthStatus::healthy(name, started.elapsed().as_millis() as u64),
            Ok(Err(e)) => HealthStatus::unhealthy(name, e.to_string()),
            Err(_) => HealthStatus::unhealthy(
                name,
                format!("health check timed out after {}s", PROBE_TIMEOUT.as_secs()),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, GatewayConfig};
    use crate::pipeline::PipelineDeps;
    use crate::testing::ScriptedBackend;
    use crate::Error;
    use std::sync::Arc;

    fn gateway(names: &[&str]) -> GatewayConfig {
        let mut config = GatewayConfig::new();
        for name in names {
            config = config.with_client(
                ClientConfig::new(*name, "https://api.example.com/v1", "test-model")
                    .with_api_key("sk-test"),
            );
        }
        config
    }

    fn factory_with(backend: Arc<ScriptedBackend>, names: &[&str]) -> ClientFactory {
        ClientFactory::new(gateway(names), PipelineDeps::in_memory()).with_backend_factory(
            move |_| Ok(backend.clone() as Arc<dyn crate::pipeline::ChatHandler>),
        )
    }

    #[tokio::test]
    async fn probe_success_records_latency() {
        let backend = Arc::new(ScriptedBackend::always_ok("pong"));
        let factory = factory_with(backend, &["x"]);

        let status = factory.check_health("x", CancellationToken::new()).await;
        assert!(status.healthy);
        assert!(status.latency_ms.is_some());
        assert!(status.error.is_none());
    }

    #[tokio::test]
    async fn probe_failure_is_reported_not_thrown() {
        let backend = Arc::new(ScriptedBackend::new(vec![Err(Error::runtime(
            "connection refused",
        ))]));
        let factory = factory_with(backend, &["x"]);

        let status = factory.check_health("x", CancellationToken::new()).await;
        assert!(!status.healthy);
        assert!(status.error.as_deref().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn cached_status_suppresses_probes_within_ttl() {
        let backend = Arc::new(ScriptedBackend::always_ok("pong"));
        let factory = factory_with(backend.clone(), &["x"]);

        factory.check_health("x", CancellationToken::new()).await;
        factory.check_health("x", CancellationToken::new()).await;
        factory.check_health("x", CancellationToken::new()).await;
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn unbuildable_client_reports_unhealthy_with_build_error() {
        let mut config = gateway(&["x"]);
        config.clients.get_mut("x").unwrap().api_key = None;
        let factory = ClientFactory::new(config, PipelineDeps::in_memory());

        let status = factory.check_health("x", CancellationToken::new()).await;
        assert!(!status.healthy);
        assert!(status.error.as_deref().unwrap().contains("api key"));
    }

    #[tokio::test]
    async fn check_all_health_covers_every_name() {
        let backend = Arc::new(ScriptedBackend::always_ok("pong"));
        let factory = factory_with(backend, &["a", "b", "c"]);

        let statuses = factory.check_all_health(CancellationToken::new()).await;
        assert_eq!(statuses.len(), 3);
        let mut names: Vec<&str> = statuses.iter().map(|s| s.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(statuses.iter().all(|s| s.healthy));
    }

    #[tokio::test]
    async fn refresh_drops_the_cached_status() {
        let backend = Arc::new(ScriptedBackend::always_ok("pong"));
        let factory = factory_with(backend.clone(), &["x"]);

        factory.check_health("x", CancellationToken::new()).await;
        factory.refresh("x");
        factory.check_health("x", CancellationToken::new()).await;
        assert_eq!(backend.calls(), 2);
    }
}
