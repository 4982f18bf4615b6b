//! Per-worker metrics and health

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sluice_resilience::CircuitState;
use tokio::sync::RwLock;

/// Success rate a worker must stay above to count as healthy
pub const HEALTHY_SUCCESS_RATE: f64 = 0.8;
/// Consecutive failures at which a worker stops counting as healthy
pub const UNHEALTHY_CONSECUTIVE_FAILURES: u64 = 5;

#[derive(Debug, Default)]
struct LastEvents {
    processed_at: Option<DateTime<Utc>>,
    error_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

/// Counters owned by one worker runtime
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    processed: AtomicU64,
    failed: AtomicU64,
    timeouts: AtomicU64,
    circuit_rejections: AtomicU64,
    total_processing_ms: AtomicU64,
    consecutive_failures: AtomicU64,
    active_jobs: AtomicUsize,
    last: RwLock<LastEvents>,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a job that completed
    pub async fn record_success(&self, elapsed: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.total_processing_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.last.write().await.processed_at = Some(Utc::now());
    }

    /// Record a handler failure or timeout
    pub async fn record_failure(&self, elapsed: Duration, error: &str, timed_out: bool) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        if timed_out {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
        }
        self.total_processing_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);

        let mut last = self.last.write().await;
        last.error_at = Some(Utc::now());
        last.error = Some(error.to_string());
    }

    /// Record a job rejected by an open circuit. Not a handler failure.
    pub fn record_circuit_rejection(&self) {
        self.circuit_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_jobs(&self) -> usize {
        self.active_jobs.load(Ordering::SeqCst)
    }

    pub(crate) fn job_started(&self) {
        self.active_jobs.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn job_finished(&self) {
        self.active_jobs.fetch_sub(1, Ordering::SeqCst);
    }

    /// Fraction of handler runs that succeeded; 1.0 before any run
    pub fn success_rate(&self) -> f64 {
        let processed = self.processed.load(Ordering::Relaxed);
        let total = processed + self.failed.load(Ordering::Relaxed);
        if total == 0 {
            1.0
        } else {
            processed as f64 / total as f64
        }
    }

    pub fn is_healthy(&self) -> bool {
        let runs = self.processed.load(Ordering::Relaxed) + self.failed.load(Ordering::Relaxed);
        runs == 0
            || (self.success_rate() > HEALTHY_SUCCESS_RATE
                && self.consecutive_failures.load(Ordering::Relaxed) < UNHEALTHY_CONSECUTIVE_FAILURES)
    }

    /// Build a health snapshot for the runtime owning these metrics
    pub async fn health(
        &self,
        name: &str,
        running: bool,
        circuit_state: CircuitState,
    ) -> WorkerHealth {
        let processed = self.processed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let runs = processed + failed;
        let average_processing_ms = if runs == 0 {
            0.0
        } else {
            self.total_processing_ms.load(Ordering::Relaxed) as f64 / runs as f64
        };
        let last = self.last.read().await;

        WorkerHealth {
            name: name.to_string(),
            queue: name.to_string(),
            running,
            healthy: self.is_healthy(),
            success_rate: self.success_rate(),
            processed,
            failed,
            timeouts: self.timeouts.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            average_processing_ms,
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            circuit_state,
            active_jobs: self.active_jobs(),
            last_processed_at: last.processed_at,
            last_error_at: last.error_at,
            last_error: last.error.clone(),
        }
    }
}

/// Point-in-time worker health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub name: String,
    pub queue: String,
    pub running: bool,
    pub healthy: bool,
    pub success_rate: f64,
    pub processed: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub circuit_rejections: u64,
    pub average_processing_ms: f64,
    pub consecutive_failures: u64,
    pub circuit_state: CircuitState,
    pub active_jobs: usize,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}
