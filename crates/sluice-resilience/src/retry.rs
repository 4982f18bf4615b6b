//! Retry with exponential backoff
//!
//! One policy shared by store writes, provider calls and anything else that
//! talks to an unreliable dependency.

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

/// Retry policy
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Apply +/-10% jitter to each delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-based), without jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        Duration::from_millis(millis as u64).min(self.max_delay)
    }

    /// Execute with retry and exponential backoff
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Debug,
    {
        self.execute_if(f, |_| true).await
    }

    /// Execute, retrying only errors for which `retryable` returns true
    pub async fn execute_if<F, Fut, T, E, P>(&self, mut f: F, retryable: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Debug,
        P: Fn(&E) -> bool,
    {
        let mut attempts = 0;

        loop {
            match f().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.max_attempts.max(1) || !retryable(&e) {
                        if attempts > 1 {
                            tracing::error!(attempts = attempts, error = ?e, "Retry exhausted");
                        }
                        return Err(e);
                    }

                    let delay = self.jittered(self.delay_for(attempts - 1));
                    tracing::warn!(
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = ?e,
                        "Retrying after failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter {
            return delay;
        }
        let jitter = delay.as_millis() as f64 * 0.1;
        let jittered = delay.as_millis() as f64 + (rand::random::<f64>() * 2.0 - 1.0) * jitter;
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}
