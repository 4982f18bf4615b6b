//! Worker configuration
//!
//! Every worker runtime is built from a [`WorkerConfig`]. The supervisor runs
//! [`WorkerConfig::validate`] before accepting one; the runtime itself
//! assumes it is handed something sane.

use std::time::Duration;

use sluice_resilience::{AdaptiveRateConfig, CircuitConfig, RetryPolicy};

use crate::job::EnqueueOptions;

pub const MIN_CONCURRENCY: usize = 1;
pub const MAX_CONCURRENCY: usize = 50;
pub const MIN_TIMEOUT: Duration = Duration::from_secs(1);
pub const MAX_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const MAX_RETRIES: u32 = 10;

/// Error types for configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Per-queue worker configuration
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Worker name; also the queue it consumes
    pub name: String,
    /// Jobs executed at once by this runtime
    pub concurrency: usize,
    /// Retries after the first attempt, so `max_attempts = max_retries + 1`
    pub max_retries: u32,
    /// Per-job handler timeout
    pub timeout: Duration,
    pub circuit: CircuitConfig,
    /// Pace handler calls when set
    pub rate_limit: Option<AdaptiveRateConfig>,
    /// Sleep after an empty poll or while the circuit is open
    pub poll_interval: Duration,
    /// Sleep while every concurrency slot is taken
    pub saturation_backoff: Duration,
    /// How often an idle loop re-pends retryable failed jobs
    pub retry_trigger_interval: Duration,
    pub retry_trigger_batch: usize,
    /// Consecutive loop errors before the loop pauses
    pub max_consecutive_loop_errors: u32,
    pub loop_error_cooldown: Duration,
    /// Policy for status writes back to the store
    pub store_retry: RetryPolicy,
}

impl WorkerConfig {
    /// Defaults for a worker named `name`
    pub fn default_for(name: &str) -> Self {
        Self {
            name: name.to_string(),
            concurrency: 5,
            max_retries: 2,
            timeout: Duration::from_secs(5 * 60),
            circuit: CircuitConfig::default(),
            rate_limit: None,
            poll_interval: Duration::from_secs(1),
            saturation_backoff: Duration::from_millis(100),
            retry_trigger_interval: Duration::from_secs(30),
            retry_trigger_batch: 10,
            max_consecutive_loop_errors: 5,
            loop_error_cooldown: Duration::from_secs(30),
            store_retry: RetryPolicy::default(),
        }
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn circuit(mut self, circuit: CircuitConfig) -> Self {
        self.circuit = circuit;
        self
    }

    pub fn rate_limit(mut self, rate_limit: AdaptiveRateConfig) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Enqueue options matching this worker's retry budget
    pub fn enqueue_options(&self) -> EnqueueOptions {
        EnqueueOptions::default().max_attempts(self.max_attempts())
    }

    /// Validate against the worker it is meant for, collecting every problem
    pub fn validate(&self, expected_name: &str) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.name.trim().is_empty() {
            problems.push("name must not be empty".to_string());
        } else if self.name != expected_name {
            problems.push(format!(
                "name '{}' does not match worker '{}'",
                self.name, expected_name
            ));
        }
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&self.concurrency) {
            problems.push(format!(
                "concurrency must be between {} and {} (got {})",
                MIN_CONCURRENCY, MAX_CONCURRENCY, self.concurrency
            ));
        }
        if self.timeout < MIN_TIMEOUT || self.timeout > MAX_TIMEOUT {
            problems.push(format!(
                "timeout must be between 1s and 30m (got {:?})",
                self.timeout
            ));
        }
        if self.max_retries > MAX_RETRIES {
            problems.push(format!(
                "max_retries must be at most {} (got {})",
                MAX_RETRIES, self.max_retries
            ));
        }
        if self.circuit.failure_threshold == 0 {
            problems.push("circuit failure_threshold must be at least 1".to_string());
        }
        if self.poll_interval.is_zero() {
            problems.push("poll_interval must be positive".to_string());
        }
        if let Some(rate) = &self.rate_limit {
            if let Err(rate_problems) = rate.validate() {
                problems.extend(rate_problems);
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    /// A job must be able to time out before the dead-letter sweep treats
    /// it as orphaned, or the sweep hands a live job to a second worker.
    pub fn check_stuck_threshold(&self, stuck_threshold: Duration) -> Option<String> {
        (self.timeout >= stuck_threshold).then(|| {
            format!(
                "timeout {:?} must be shorter than the stuck-job threshold {:?}",
                self.timeout, stuck_threshold
            )
        })
    }
}
