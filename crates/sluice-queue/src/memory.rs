//! In-memory queue store
//!
//! Mirrors the claim protocol of the SQL store: the candidate is selected
//! under a read lock and the `pending -> processing` swap is a separate,
//! conditional step under the write lock. Concurrent claimers can therefore
//! pick the same candidate, and only one of them wins the swap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::job::{
    terminated_reason, Claim, EnqueueOptions, ForceTerminateOutcome, Job, JobId, JobStatus,
    QueueStats, TerminateAction,
};
use crate::store::{QueueError, QueueStore, MAX_CLAIM_CANDIDATES};
use crate::validation::PayloadRules;

#[derive(Debug, Clone)]
struct Entry {
    job: Job,
    /// Insertion order, breaks `created_at` ties
    seq: u64,
}

#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    jobs: RwLock<HashMap<JobId, Entry>>,
    next_seq: AtomicU64,
    rules: PayloadRules,
    offline: AtomicBool,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: PayloadRules) -> Self {
        Self {
            rules,
            ..Self::default()
        }
    }

    /// Simulate losing the connection to the store
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> Result<(), QueueError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(QueueError::Connectivity("memory store is offline".to_string()))
        } else {
            Ok(())
        }
    }

    async fn oldest_pending(&self, queue: &str) -> Option<JobId> {
        let jobs = self.jobs.read().await;
        jobs.values()
            .filter(|e| e.job.queue_name == queue && e.job.status == JobStatus::Pending)
            .min_by_key(|e| (e.job.created_at, e.seq))
            .map(|e| e.job.id)
    }

    /// Apply `f` to the row if it is still `processing` under `claim`
    async fn finish(&self, claim: Claim, f: impl FnOnce(&mut Job)) -> Result<(), QueueError> {
        let id = claim.job_id;
        let mut jobs = self.jobs.write().await;
        let entry = jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;

        if entry.job.status != JobStatus::Processing || entry.job.started_at != claim.started_at {
            tracing::warn!(
                job_id = %id,
                status = %entry.job.status,
                "Ignoring status write for a claim that is no longer current"
            );
            return Ok(());
        }

        f(&mut entry.job);
        Ok(())
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        opts: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        self.ensure_online()?;
        self.rules.check(queue, &payload, &opts)?;

        let job = Job::new(queue, payload, &opts);
        let id = job.id;

        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&id) {
            return Err(QueueError::Validation(format!("job {} already exists", id)));
        }
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        jobs.insert(id, Entry { job, seq });

        tracing::debug!(queue = %queue, job_id = %id, "Enqueued job");
        Ok(id)
    }

    async fn claim_next(&self, queue: &str) -> Result<Option<Job>, QueueError> {
        self.ensure_online()?;

        for _ in 0..MAX_CLAIM_CANDIDATES {
            let Some(candidate) = self.oldest_pending(queue).await else {
                return Ok(None);
            };

            // Let a concurrent claimer observe the same candidate
            tokio::task::yield_now().await;

            let mut jobs = self.jobs.write().await;
            if let Some(entry) = jobs.get_mut(&candidate) {
                if entry.job.status == JobStatus::Pending {
                    let now = Utc::now();
                    entry.job.status = JobStatus::Processing;
                    entry.job.started_at = Some(now);
                    entry.job.updated_at = now;
                    return Ok(Some(entry.job.clone()));
                }
            }
            tracing::trace!(queue = %queue, job_id = %candidate, "Lost claim race");
        }

        Ok(None)
    }

    async fn mark_completed(&self, claim: Claim) -> Result<(), QueueError> {
        self.ensure_online()?;
        self.finish(claim, |job| {
            let now = Utc::now();
            job.status = JobStatus::Completed;
            job.completed_at = Some(now);
            job.updated_at = now;
        })
        .await
    }

    async fn mark_failed(&self, claim: Claim, error: &str) -> Result<(), QueueError> {
        self.ensure_online()?;
        self.finish(claim, |job| {
            let now = Utc::now();
            job.status = JobStatus::Failed;
            job.attempts += 1;
            job.last_error = Some(error.to_string());
            job.completed_at = Some(now);
            job.updated_at = now;
        })
        .await
    }

    async fn release(&self, claim: Claim) -> Result<(), QueueError> {
        self.ensure_online()?;
        self.finish(claim, |job| {
            job.status = JobStatus::Pending;
            job.started_at = None;
            job.updated_at = Utc::now();
        })
        .await
    }

    async fn get_job(&self, id: JobId) -> Result<Job, QueueError> {
        self.ensure_online()?;
        let jobs = self.jobs.read().await;
        jobs.get(&id)
            .map(|e| e.job.clone())
            .ok_or(QueueError::NotFound(id))
    }

    async fn get_stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        self.ensure_online()?;
        let jobs = self.jobs.read().await;
        let mut stats = QueueStats::default();
        for entry in jobs.values().filter(|e| e.job.queue_name == queue) {
            stats.add(entry.job.status, 1);
        }
        Ok(stats)
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64, QueueError> {
        let stats = self.get_stats(queue).await?;
        Ok(stats.pending + stats.processing)
    }

    async fn get_stuck_jobs(&self, queue: &str, threshold: Duration) -> Result<Vec<Job>, QueueError> {
        self.ensure_online()?;
        let cutoff = chrono::Duration::from_std(threshold)
            .ok()
            .and_then(|threshold| Utc::now().checked_sub_signed(threshold))
            .ok_or_else(|| {
                QueueError::Validation(format!("stuck threshold out of range: {:?}", threshold))
            })?;

        let jobs = self.jobs.read().await;
        let mut stuck: Vec<&Entry> = jobs
            .values()
            .filter(|e| {
                e.job.queue_name == queue
                    && e.job.status == JobStatus::Processing
                    && e.job.started_at.is_some_and(|at| at < cutoff)
            })
            .collect();
        stuck.sort_by_key(|e| (e.job.started_at, e.seq));
        Ok(stuck.into_iter().map(|e| e.job.clone()).collect())
    }

    async fn get_retryable_failed(&self, queue: &str, limit: usize) -> Result<Vec<Job>, QueueError> {
        self.ensure_online()?;
        let jobs = self.jobs.read().await;
        let mut failed: Vec<&Entry> = jobs
            .values()
            .filter(|e| {
                e.job.queue_name == queue && e.job.status == JobStatus::Failed && e.job.can_retry()
            })
            .collect();
        failed.sort_by_key(|e| (e.job.created_at, e.seq));
        Ok(failed.into_iter().take(limit).map(|e| e.job.clone()).collect())
    }

    async fn retry_failed(&self, id: JobId) -> Result<bool, QueueError> {
        self.ensure_online()?;
        let mut jobs = self.jobs.write().await;
        let entry = jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;

        if entry.job.status != JobStatus::Failed || !entry.job.can_retry() {
            return Ok(false);
        }

        entry.job.status = JobStatus::Pending;
        entry.job.started_at = None;
        entry.job.completed_at = None;
        entry.job.updated_at = Utc::now();
        Ok(true)
    }

    async fn restart_job(&self, id: JobId) -> Result<(), QueueError> {
        self.ensure_online()?;
        let mut jobs = self.jobs.write().await;
        let entry = jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;

        entry.job.status = JobStatus::Pending;
        entry.job.attempts = 0;
        entry.job.last_error = None;
        entry.job.started_at = None;
        entry.job.completed_at = None;
        entry.job.updated_at = Utc::now();
        Ok(())
    }

    async fn force_terminate(&self, id: JobId, reason: &str) -> Result<ForceTerminateOutcome, QueueError> {
        self.ensure_online()?;
        let mut jobs = self.jobs.write().await;
        let entry = jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        let previous_status = entry.job.status;

        let action = match previous_status {
            JobStatus::Pending | JobStatus::Processing => {
                let now = Utc::now();
                entry.job.status = JobStatus::Failed;
                entry.job.attempts = entry.job.attempts.max(entry.job.max_attempts);
                entry.job.last_error = Some(terminated_reason(reason));
                entry.job.completed_at = Some(now);
                entry.job.updated_at = now;
                TerminateAction::MarkedFailed
            }
            JobStatus::Completed | JobStatus::Failed => {
                jobs.remove(&id);
                TerminateAction::Deleted
            }
        };

        Ok(ForceTerminateOutcome {
            job_id: id,
            previous_status,
            action,
        })
    }

    async fn clear_queue(&self, queue: &str) -> Result<u64, QueueError> {
        self.ensure_online()?;
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, e| e.job.queue_name != queue || e.job.status == JobStatus::Processing);
        Ok((before - jobs.len()) as u64)
    }

    async fn is_healthy(&self) -> bool {
        !self.offline.load(Ordering::SeqCst)
    }
}
