//! Dead-letter recovery
//!
//! A periodic sweep, independent of any worker runtime, that re-pends
//! retryable failed jobs and reclaims jobs orphaned in `processing` by a
//! crashed worker.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::store::QueueStore;

/// How failed jobs are put back in the queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryMode {
    /// Keep the attempt count, so `max_attempts` bounds total runs
    #[default]
    Bounded,
    /// Reset attempts to zero on every retry
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterConfig {
    pub interval: Duration,
    /// `processing` for longer than this counts as orphaned
    pub stuck_threshold: Duration,
    pub retry_mode: RetryMode,
    /// Failed jobs examined per queue per sweep
    pub batch_limit: usize,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stuck_threshold: Duration::from_secs(10 * 60),
            retry_mode: RetryMode::Bounded,
            batch_limit: 100,
        }
    }
}

/// Sweep results for one queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSweep {
    pub queue: String,
    pub failed_found: usize,
    pub failed_requeued: usize,
    pub stuck_found: usize,
    pub stuck_reset: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub queues: Vec<QueueSweep>,
}

impl SweepReport {
    pub fn failed_requeued(&self) -> usize {
        self.queues.iter().map(|q| q.failed_requeued).sum()
    }

    pub fn stuck_reset(&self) -> usize {
        self.queues.iter().map(|q| q.stuck_reset).sum()
    }

    pub fn errors(&self) -> usize {
        self.queues.iter().map(|q| q.errors).sum()
    }
}

pub struct DeadLetterManager {
    store: Arc<dyn QueueStore>,
    queues: Vec<String>,
    config: DeadLetterConfig,
}

impl DeadLetterManager {
    pub fn new(store: Arc<dyn QueueStore>, queues: Vec<String>, config: DeadLetterConfig) -> Self {
        Self {
            store,
            queues,
            config,
        }
    }

    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    pub fn config(&self) -> &DeadLetterConfig {
        &self.config
    }

    /// Sweep every known queue once. Failures are logged and counted, never returned.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for queue in &self.queues {
            report.queues.push(self.sweep_queue(queue).await);
        }

        let (requeued, reset, errors) =
            (report.failed_requeued(), report.stuck_reset(), report.errors());
        if requeued + reset + errors > 0 {
            info!(requeued = requeued, stuck_reset = reset, errors = errors, "Dead-letter sweep finished");
        } else {
            debug!("Dead-letter sweep found nothing to do");
        }
        report
    }

    async fn sweep_queue(&self, queue: &str) -> QueueSweep {
        let mut sweep = QueueSweep {
            queue: queue.to_string(),
            ..Default::default()
        };

        match self.store.get_retryable_failed(queue, self.config.batch_limit).await {
            Ok(jobs) => {
                sweep.failed_found = jobs.len();
                for job in jobs {
                    let result = match self.config.retry_mode {
                        RetryMode::Bounded => self.store.retry_failed(job.id).await,
                        RetryMode::Reset => self.store.restart_job(job.id).await.map(|_| true),
                    };
                    match result {
                        Ok(true) => sweep.failed_requeued += 1,
                        // Moved by someone else since it was listed
                        Ok(false) => {}
                        Err(e) => {
                            sweep.errors += 1;
                            warn!(queue = %queue, job_id = %job.id, error = %e, "Could not requeue failed job");
                        }
                    }
                }
            }
            Err(e) => {
                sweep.errors += 1;
                error!(queue = %queue, error = %e, "Could not list failed jobs");
            }
        }

        match self.store.get_stuck_jobs(queue, self.config.stuck_threshold).await {
            Ok(jobs) => {
                sweep.stuck_found = jobs.len();
                for job in jobs {
                    match self.store.restart_job(job.id).await {
                        Ok(()) => {
                            sweep.stuck_reset += 1;
                            warn!(
                                queue = %queue,
                                job_id = %job.id,
                                started_at = ?job.started_at,
                                "Reset stuck job"
                            );
                        }
                        Err(e) => {
                            sweep.errors += 1;
                            warn!(queue = %queue, job_id = %job.id, error = %e, "Could not reset stuck job");
                        }
                    }
                }
            }
            Err(e) => {
                sweep.errors += 1;
                error!(queue = %queue, error = %e, "Could not list stuck jobs");
            }
        }

        sweep
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `cancel` fires
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                queues = self.queues.len(),
                interval_secs = self.config.interval.as_secs(),
                "Dead-letter sweeper started"
            );
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                }
            }
            info!("Dead-letter sweeper stopped");
        })
    }
}
