//! Retry layer.
//!
//! Wraps the unary call in a bounded retry loop with exponential backoff.
//! Only transient conditions are re-attempted (see
//! [`Error::is_transient`](crate::Error::is_transient)); everything else
//! propagates immediately.
//!
//! Streaming calls are never retried: once any fragment has been yielded a
//! partially delivered sequence cannot be safely replayed, so the stream is
//! opened in a single attempt and failures propagate as-is. This is a
//! deliberate scope limitation, not an oversight.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ChatHandler, DeltaStream};
use crate::config::PipelineConfig;
use crate::resilience::CircuitBreaker;
use crate::types::{ChatRequest, ChatResponse};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryConfig {
    fn from_pipeline(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.max_retry_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_secs(10),
        }
    }

    /// Exponential backoff: base * 2^attempt, capped.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let cap = self.max_delay.as_millis() as u64;
        let shift = attempt.min(16);
        Duration::from_millis(base.saturating_mul(1u64 << shift).min(cap))
    }
}

pub struct RetryLayer {
    inner: Arc<dyn ChatHandler>,
    config: RetryConfig,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl RetryLayer {
    pub fn new(
        inner: Arc<dyn ChatHandler>,
        config: &PipelineConfig,
        breaker: Option<Arc<CircuitBreaker>>,
    ) -> Self {
        Self {
            inner,
            config: RetryConfig::from_pipeline(config),
            breaker,
        }
    }

    fn record(&self, success: bool) {
        if let Some(breaker) = &self.breaker {
            breaker.record(success);
        }
    }
}

#[async_trait]
impl ChatHandler for RetryLayer {
    async fn chat(&self, request: ChatRequest, cancel: CancellationToken) -> Result<ChatResponse> {
        let mut attempt: u32 = 0;
        loop {
            if let Some(breaker) = &self.breaker {
                breaker.allow()?;
            }

            match self.inner.chat(request.clone(), cancel.clone()).await {
                Ok(response) => {
                    self.record(true);
                    return Ok(response);
                }
                Err(e) => {
                    self.record(false);
                    if !e.is_transient() || attempt + 1 >= self.config.max_attempts {
                        return Err(e);
                    }
                    let delay = self.config.backoff(attempt);
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, backing off before retry"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn chat_stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<DeltaStream> {
        if let Some(breaker) = &self.breaker {
            breaker.allow()?;
        }
        // Single attempt only. The breaker is still fed with the open
        // outcome so stream-open failures count toward its threshold.
        match self.inner.chat_stream(request, cancel).await {
            Ok(stream) => {
                self.record(true);
                Ok(stream)
            }
            Err(e) => {
                self.record(false);
                Err(e)
            }
        }
    }
}
