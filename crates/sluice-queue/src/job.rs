//! Job definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Job Identifier
pub type JobId = Uuid;

/// Job Status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be claimed
    Pending,
    /// Claimed by exactly one worker
    Processing,
    /// Handler succeeded
    Completed,
    /// Handler failed or timed out
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// A persisted job row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue_name: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Job {
    /// Build a fresh `pending` job
    pub fn new(queue_name: &str, payload: serde_json::Value, opts: &EnqueueOptions) -> Self {
        let now = Utc::now();
        Self {
            id: opts.job_id.unwrap_or_else(Uuid::new_v4),
            queue_name: queue_name.to_string(),
            payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: opts.max_attempts,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            last_error: None,
        }
    }

    pub fn is_claimable(&self) -> bool {
        self.status == JobStatus::Pending
    }

    /// Attempts remain before `max_attempts` is reached
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Completed | JobStatus::Failed)
    }

    /// The claim this row currently records
    pub fn claim(&self) -> Claim {
        Claim {
            job_id: self.id,
            started_at: self.started_at,
        }
    }
}

/// One claim of a job, identified by the `started_at` it wrote.
///
/// Status writes carry the claim they belong to. A job that was reset and
/// claimed again has a new `started_at`, so a late write from the earlier
/// holder no longer matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub job_id: JobId,
    pub started_at: Option<DateTime<Utc>>,
}

/// Producer options for [`QueueStore::enqueue`](crate::store::QueueStore::enqueue)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub max_attempts: u32,
    /// Producer-supplied id; generated when absent
    pub job_id: Option<JobId>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            job_id: None,
        }
    }
}

impl EnqueueOptions {
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn job_id(mut self, id: JobId) -> Self {
        self.job_id = Some(id);
        self
    }
}

/// Per-status counts for one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
}

impl QueueStats {
    /// Add `count` rows of `status`
    pub fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
        }
        self.total += count;
    }
}

/// What [`force_terminate`](crate::store::QueueStore::force_terminate) did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminateAction {
    MarkedFailed,
    Deleted,
}

/// Audit record for a forced termination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceTerminateOutcome {
    pub job_id: JobId,
    pub previous_status: JobStatus,
    pub action: TerminateAction,
}

/// Error message recorded on administratively terminated jobs
pub fn terminated_reason(reason: &str) -> String {
    format!("terminated: {}", reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_round_trips_as_lowercase() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert_eq!(serde_json::to_value(JobStatus::Processing).unwrap(), json!("processing"));
        assert!("running".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_new_job_is_claimable() {
        let id = Uuid::new_v4();
        let job = Job::new(
            "metrics",
            json!({ "post_id": 1 }),
            &EnqueueOptions::default().max_attempts(5).job_id(id),
        );

        assert_eq!(job.id, id);
        assert!(job.is_claimable());
        assert!(job.can_retry());
        assert!(!job.is_terminal());
        assert_eq!(job.max_attempts, 5);
    }

    #[test]
    fn test_stats_total() {
        let mut stats = QueueStats::default();
        stats.add(JobStatus::Pending, 2);
        stats.add(JobStatus::Failed, 1);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.pending, 2);
    }
}
