//! Minimal circuit breaker.
//!
//! Counts consecutive failures and opens for a cooldown after the threshold.
//! The retry layer consults [`CircuitBreaker::allow`] before each attempt and
//! feeds outcomes back via [`record`](CircuitBreaker::record).

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct State {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerSnapshot {
    pub failure_threshold: u32,
    pub consecutive_failures: u32,
    /// Remaining open time in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
}

pub struct CircuitBreaker {
    cfg: CircuitBreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(cfg: CircuitBreakerConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(State {
                consecutive_failures: 0,
                open_until: None,
            }),
        }
    }

    /// Reject fast while the breaker is open; reset once the cooldown lapses.
    pub fn allow(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if let Some(until) = st.open_until {
            if Instant::now() < until {
                return Err(Error::runtime_with_context(
                    "circuit breaker open, temporarily unavailable",
                    crate::ErrorContext::new().with_source("circuit_breaker"),
                ));
            }
            st.open_until = None;
            st.consecutive_failures = 0;
        }
        Ok(())
    }

    /// Record one attempt outcome.
    pub fn record(&self, success: bool) {
        let mut st = self.state.lock().unwrap();
        if success {
            st.consecutive_failures = 0;
            st.open_until = None;
        } else {
            st.consecutive_failures = st.consecutive_failures.saturating_add(1);
            if st.consecutive_failures >= self.cfg.failure_threshold {
                st.open_until = Some(Instant::now() + self.cfg.cooldown);
            }
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let st = self.state.lock().unwrap();
        let now = Instant::now();
        CircuitBreakerSnapshot {
            failure_threshold: self.cfg.failure_threshold,
            consecutive_failures: st.consecutive_failures,
            open_remaining_ms: st.open_until.and_then(|until| {
                (until > now).then(|| (until - now).as_millis() as u64)
            }),
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
