//! Circuit breaker guarding the downstream calls a worker makes
//!
//! The breaker moves `Closed -> Open -> HalfOpen -> Closed`. The transition
//! out of `Open` is lazy: nothing runs in the background, the next
//! [`CircuitBreaker::allow`] after the reset timeout flips the state and
//! admits a single trial call.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - calls pass through
    Closed,
    /// Circuit tripped - calls fail immediately
    Open,
    /// Testing recovery - one trial call allowed
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitConfig {
    /// Consecutive failures that trip the circuit
    pub failure_threshold: u32,
    /// Time since the last failure before a trial call is admitted
    pub reset_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitConfig {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
        }
    }
}

/// Rejection returned while the circuit is open (or a trial call is in flight)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit '{name}' is open")]
pub struct CircuitOpenError {
    pub name: String,
    /// Time left before a trial call will be admitted, if known
    pub retry_after: Option<Duration>,
}

/// Error from [`CircuitBreaker::call`]
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    #[error(transparent)]
    Open(CircuitOpenError),
    #[error("Call failed: {0}")]
    Failed(#[source] E),
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

/// Thread-safe circuit breaker, one per worker name
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: RwLock<BreakerState>,
    total_requests: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
    times_opened: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(name: &str, config: CircuitConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            inner: RwLock::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
            times_opened: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Check whether a call may proceed, moving `Open -> HalfOpen` once the
    /// reset timeout has elapsed.
    pub async fn allow(&self) -> Result<(), CircuitOpenError> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.write().await;

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let remaining = self.remaining_cooldown(&inner);
                if remaining.is_zero() {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    tracing::info!(circuit = %self.name, "Circuit half-open - admitting a trial call");
                    Ok(())
                } else {
                    Err(self.reject(Some(remaining)))
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(self.reject(None))
                } else {
                    inner.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Non-mutating version of [`allow`](Self::allow), used by the dispatch
    /// loop to avoid claiming jobs it would immediately reject.
    pub async fn would_allow(&self) -> bool {
        let inner = self.inner.read().await;
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => self.remaining_cooldown(&inner).is_zero(),
            CircuitState::HalfOpen => !inner.trial_in_flight,
        }
    }

    /// Record a successful call
    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.trial_in_flight = false;
                tracing::info!(circuit = %self.name, "Circuit recovered - now Closed");
            }
            // Late result from a call admitted before the circuit tripped
            CircuitState::Open => {}
        }
    }

    /// Record a failed call
    pub async fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.write().await;
        inner.last_failure = Some(Instant::now());

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    self.times_opened.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        circuit = %self.name,
                        failures = inner.failure_count,
                        "Circuit tripped - now Open"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.trial_in_flight = false;
                self.times_opened.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(circuit = %self.name, "Trial call failed - circuit back to Open");
            }
            CircuitState::Open => {}
        }
    }

    /// Get current state. Does not perform the lazy `Open -> HalfOpen` move.
    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }

    /// Get statistics
    pub async fn stats(&self) -> CircuitStats {
        let inner = self.inner.read().await;
        CircuitStats {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.failure_count,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
            times_opened: self.times_opened.load(Ordering::Relaxed),
        }
    }

    /// Execute with circuit breaker protection
    pub async fn call<F, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        self.allow().await.map_err(CircuitError::Open)?;

        match f.await {
            Ok(result) => {
                self.record_success().await;
                Ok(result)
            }
            Err(e) => {
                self.record_failure().await;
                Err(CircuitError::Failed(e))
            }
        }
    }

    fn remaining_cooldown(&self, inner: &BreakerState) -> Duration {
        match inner.last_failure {
            Some(at) => self.config.reset_timeout.saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        }
    }

    fn reject(&self, retry_after: Option<Duration>) -> CircuitOpenError {
        self.total_rejections.fetch_add(1, Ordering::Relaxed);
        CircuitOpenError {
            name: self.name.clone(),
            retry_after,
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub times_opened: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitConfig::new(threshold, Duration::from_millis(timeout_ms)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_trips() {
        let cb = breaker(2, 100);

        assert_eq!(cb.state().await, CircuitState::Closed);
        assert!(cb.allow().await.is_ok());

        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);

        let err = cb.allow().await.unwrap_err();
        assert_eq!(err.name, "test");
        assert!(err.retry_after.is_some());

        tokio::time::advance(Duration::from_millis(150)).await;

        assert!(cb.allow().await.is_ok());
        assert_eq!(cb.state().await, CircuitState::HalfOpen);

        cb.record_success().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_count() {
        let cb = breaker(3, 1000);

        cb.record_failure().await;
        cb.record_failure().await;
        cb.record_success().await;
        cb.record_failure().await;
        cb.record_failure().await;

        assert_eq!(cb.state().await, CircuitState::Closed);
        assert_eq!(cb.stats().await.consecutive_failures, 2);
    }

    #[tokio::test]
    async fn test_call_wraps_result() {
        let cb = breaker(1, 60_000);

        let ok: Result<u32, CircuitError<&str>> = cb.call(async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let failed: Result<u32, CircuitError<&str>> = cb.call(async { Err("boom") }).await;
        assert!(matches!(failed, Err(CircuitError::Failed("boom"))));

        let rejected: Result<u32, CircuitError<&str>> = cb.call(async { Ok(1) }).await;
        assert!(matches!(rejected, Err(CircuitError::Open(_))));

        let stats = cb.stats().await;
        assert_eq!(stats.total_rejections, 1);
        assert_eq!(stats.times_opened, 1);
    }
}
