//! Queue store trait
//!
//! The job table is the only shared mutable resource. Every cross-process
//! guarantee, mutual exclusion of claims in particular, is expressed as a
//! conditional write against it.

use std::time::Duration;

use async_trait::async_trait;

use crate::job::{Claim, EnqueueOptions, ForceTerminateOutcome, Job, JobId, QueueStats};

/// Candidates one `claim_next` call tries before giving up the cycle
pub const MAX_CLAIM_CANDIDATES: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Job not found: {0}")]
    NotFound(JobId),
    #[error("Store unreachable: {0}")]
    Connectivity(String),
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Corrupt job row: {0}")]
    CorruptRow(String),
}

impl QueueError {
    /// Errors worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Connectivity(_))
    }
}

/// Durable job table
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert a `pending` job
    async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        opts: EnqueueOptions,
    ) -> Result<JobId, QueueError>;

    /// Claim the oldest pending job of `queue`.
    ///
    /// A lost race is not an error: after a bounded number of lost
    /// candidates this returns `Ok(None)`.
    async fn claim_next(&self, queue: &str) -> Result<Option<Job>, QueueError>;

    /// `processing -> completed` for the row still holding `claim`.
    /// Ignored (with a warning) when the row has moved on.
    async fn mark_completed(&self, claim: Claim) -> Result<(), QueueError>;

    /// `processing -> failed`, incrementing `attempts`
    async fn mark_failed(&self, claim: Claim, error: &str) -> Result<(), QueueError>;

    /// `processing -> pending` without touching `attempts`, for a claim
    /// whose handler never ran
    async fn release(&self, claim: Claim) -> Result<(), QueueError>;

    async fn get_job(&self, id: JobId) -> Result<Job, QueueError>;

    async fn get_stats(&self, queue: &str) -> Result<QueueStats, QueueError>;

    /// Pending plus processing rows. Diagnostic only.
    async fn queue_depth(&self, queue: &str) -> Result<u64, QueueError>;

    /// Jobs in `processing` whose `started_at` is older than `threshold`
    async fn get_stuck_jobs(&self, queue: &str, threshold: Duration) -> Result<Vec<Job>, QueueError>;

    /// Failed jobs with attempts left, oldest first
    async fn get_retryable_failed(&self, queue: &str, limit: usize) -> Result<Vec<Job>, QueueError>;

    /// Re-pend a failed job that still has attempts left, keeping its
    /// attempt count. Returns whether the row moved.
    async fn retry_failed(&self, id: JobId) -> Result<bool, QueueError>;

    /// Unconditionally reset a job to `pending` with zero attempts
    async fn restart_job(&self, id: JobId) -> Result<(), QueueError>;

    /// Fail a live job, or delete a finished one
    async fn force_terminate(&self, id: JobId, reason: &str) -> Result<ForceTerminateOutcome, QueueError>;

    /// Delete every row of `queue` that is not in flight. Returns the count.
    async fn clear_queue(&self, queue: &str) -> Result<u64, QueueError>;

    async fn is_healthy(&self) -> bool;
}
