//! Durable queue store on SQLite
//!
//! Claims use two statements: a SELECT for the oldest pending row, then an
//! UPDATE conditioned on that row still being `pending`. Zero affected rows
//! means another claimer won; no `SELECT ... FOR UPDATE` is needed.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sluice_queue::job::terminated_reason;
use sluice_queue::{
    Claim, EnqueueOptions, ForceTerminateOutcome, Job, JobId, JobStatus, PayloadRules, QueueError,
    QueueStats, QueueStore, TerminateAction, MAX_CLAIM_CANDIDATES,
};
use sqlx::SqlitePool;
use uuid::Uuid;

const JOB_COLUMNS: &str = "id, queue_name, payload, status, attempts, max_attempts, \
    created_at, updated_at, started_at, completed_at, last_error";

/// Map a driver error onto the queue taxonomy
pub(crate) fn map_sqlx(e: sqlx::Error) -> QueueError {
    match &e {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => QueueError::Connectivity(e.to_string()),
        sqlx::Error::Database(db) if db.code().is_some_and(|code| is_contention(&code)) => {
            QueueError::Connectivity(e.to_string())
        }
        _ => QueueError::Backend(e.to_string()),
    }
}

/// SQLITE_BUSY or SQLITE_LOCKED, extended codes included (`SQLITE_BUSY_SNAPSHOT` is 517)
fn is_contention(code: &str) -> bool {
    code.parse::<i64>()
        .map(|code| matches!(code & 0xff, 5 | 6))
        .unwrap_or(false)
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(column: &str, ms: i64) -> Result<DateTime<Utc>, QueueError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| QueueError::CorruptRow(format!("{} out of range: {}", column, ms)))
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: String,
    queue_name: String,
    payload: String,
    status: String,
    attempts: i64,
    max_attempts: i64,
    created_at: i64,
    updated_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    last_error: Option<String>,
}

impl TryFrom<JobRow> for Job {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|_| QueueError::CorruptRow(format!("invalid job id '{}'", row.id)))?;
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(|e| QueueError::CorruptRow(e.to_string()))?;
        let counter = |name: &str, value: i64| {
            u32::try_from(value)
                .map_err(|_| QueueError::CorruptRow(format!("{} out of range: {}", name, value)))
        };

        Ok(Job {
            id,
            queue_name: row.queue_name,
            payload: serde_json::from_str(&row.payload)?,
            status,
            attempts: counter("attempts", row.attempts)?,
            max_attempts: counter("max_attempts", row.max_attempts)?,
            created_at: from_millis("created_at", row.created_at)?,
            updated_at: from_millis("updated_at", row.updated_at)?,
            started_at: row
                .started_at
                .map(|ms| from_millis("started_at", ms))
                .transpose()?,
            completed_at: row
                .completed_at
                .map(|ms| from_millis("completed_at", ms))
                .transpose()?,
            last_error: row.last_error,
        })
    }
}

/// Durable queue store using SQLite
#[derive(Debug, Clone)]
pub struct SqliteQueueStore {
    pool: SqlitePool,
    rules: PayloadRules,
}

impl SqliteQueueStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            rules: PayloadRules::default(),
        }
    }

    pub fn with_rules(mut self, rules: PayloadRules) -> Self {
        self.rules = rules;
        self
    }

    async fn fetch(&self, id: &str) -> Result<Option<Job>, QueueError> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx)?;
        row.map(Job::try_from).transpose()
    }

    async fn exists(&self, id: JobId) -> Result<bool, QueueError> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(found.is_some())
    }

    /// Resolve a zero-row conditional write: the claim was superseded, or the row is gone
    async fn stale_write(&self, id: JobId, what: &str) -> Result<(), QueueError> {
        if self.exists(id).await? {
            tracing::warn!(job_id = %id, "Ignoring {} for a claim that is no longer current", what);
            Ok(())
        } else {
            Err(QueueError::NotFound(id))
        }
    }

    async fn query_jobs(&self, sql: &str, queue: &str, arg: i64) -> Result<Vec<Job>, QueueError> {
        let rows: Vec<JobRow> = sqlx::query_as(sql)
            .bind(queue)
            .bind(arg)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.into_iter().map(Job::try_from).collect()
    }
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        opts: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        self.rules.check(queue, &payload, &opts)?;

        let id = opts.job_id.unwrap_or_else(Uuid::new_v4);
        let now = now_millis();

        sqlx::query(
            "INSERT INTO jobs (id, queue_name, payload, status, attempts, max_attempts, created_at, updated_at) \
             VALUES (?, ?, ?, 'pending', 0, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(queue)
        .bind(serde_json::to_string(&payload)?)
        .bind(opts.max_attempts as i64)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db) = &e {
                if db.is_unique_violation() {
                    return QueueError::Validation(format!("job {} already exists", id));
                }
            }
            map_sqlx(e)
        })?;

        tracing::debug!(queue = %queue, job_id = %id, "Enqueued job");
        Ok(id)
    }

    async fn claim_next(&self, queue: &str) -> Result<Option<Job>, QueueError> {
        for _ in 0..MAX_CLAIM_CANDIDATES {
            let candidate: Option<String> = sqlx::query_scalar(
                "SELECT id FROM jobs WHERE queue_name = ? AND status = 'pending' \
                 ORDER BY created_at ASC, rowid ASC LIMIT 1",
            )
            .bind(queue)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;

            let Some(candidate) = candidate else {
                return Ok(None);
            };

            let now = now_millis();
            let claimed = sqlx::query(
                "UPDATE jobs SET status = 'processing', started_at = ?, updated_at = ? \
                 WHERE id = ? AND status = 'pending'",
            )
            .bind(now)
            .bind(now)
            .bind(&candidate)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;

            if claimed.rows_affected() == 1 {
                return self.fetch(&candidate).await;
            }
            tracing::trace!(queue = %queue, job_id = %candidate, "Lost claim race");
        }

        Ok(None)
    }

    // Status writes below are fenced on the `started_at` the claim stamped, so a
    // handler that outlived a stuck-job reset cannot overwrite the next claim.

    async fn mark_completed(&self, claim: Claim) -> Result<(), QueueError> {
        let now = now_millis();
        let result = sqlx::query(
            "UPDATE jobs SET status = 'completed', completed_at = ?, updated_at = ? \
             WHERE id = ? AND status = 'processing' AND started_at = ?",
        )
        .bind(now)
        .bind(now)
        .bind(claim.job_id.to_string())
        .bind(claim.started_at.map(|t| t.timestamp_millis()))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return self.stale_write(claim.job_id, "completion").await;
        }
        Ok(())
    }

    async fn mark_failed(&self, claim: Claim, error: &str) -> Result<(), QueueError> {
        let now = now_millis();
        let result = sqlx::query(
            "UPDATE jobs SET status = 'failed', attempts = attempts + 1, last_error = ?, \
             completed_at = ?, updated_at = ? \
             WHERE id = ? AND status = 'processing' AND started_at = ?",
        )
        .bind(error)
        .bind(now)
        .bind(now)
        .bind(claim.job_id.to_string())
        .bind(claim.started_at.map(|t| t.timestamp_millis()))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return self.stale_write(claim.job_id, "failure").await;
        }
        Ok(())
    }

    async fn release(&self, claim: Claim) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'pending', started_at = NULL, updated_at = ? \
             WHERE id = ? AND status = 'processing' AND started_at = ?",
        )
        .bind(now_millis())
        .bind(claim.job_id.to_string())
        .bind(claim.started_at.map(|t| t.timestamp_millis()))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return self.stale_write(claim.job_id, "release").await;
        }
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Job, QueueError> {
        self.fetch(&id.to_string())
            .await?
            .ok_or(QueueError::NotFound(id))
    }

    async fn get_stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM jobs WHERE queue_name = ? GROUP BY status",
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let status = status
                .parse::<JobStatus>()
                .map_err(|e| QueueError::CorruptRow(e.to_string()))?;
            stats.add(status, count.max(0) as u64);
        }
        Ok(stats)
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64, QueueError> {
        let depth: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE queue_name = ? AND status IN ('pending', 'processing')",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(depth.max(0) as u64)
    }

    async fn get_stuck_jobs(&self, queue: &str, threshold: Duration) -> Result<Vec<Job>, QueueError> {
        let cutoff = now_millis() - threshold.as_millis().min(i64::MAX as u128) as i64;
        self.query_jobs(
            &format!(
                "SELECT {} FROM jobs WHERE queue_name = ? AND status = 'processing' \
                 AND started_at < ? ORDER BY started_at ASC",
                JOB_COLUMNS
            ),
            queue,
            cutoff,
        )
        .await
    }

    async fn get_retryable_failed(&self, queue: &str, limit: usize) -> Result<Vec<Job>, QueueError> {
        self.query_jobs(
            &format!(
                "SELECT {} FROM jobs WHERE queue_name = ? AND status = 'failed' \
                 AND attempts < max_attempts ORDER BY created_at ASC, rowid ASC LIMIT ?",
                JOB_COLUMNS
            ),
            queue,
            limit.min(i64::MAX as usize) as i64,
        )
        .await
    }

    async fn retry_failed(&self, id: JobId) -> Result<bool, QueueError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'pending', started_at = NULL, completed_at = NULL, updated_at = ? \
             WHERE id = ? AND status = 'failed' AND attempts < max_attempts",
        )
        .bind(now_millis())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 1 {
            Ok(true)
        } else if self.exists(id).await? {
            Ok(false)
        } else {
            Err(QueueError::NotFound(id))
        }
    }

    async fn restart_job(&self, id: JobId) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'pending', attempts = 0, last_error = NULL, \
             started_at = NULL, completed_at = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(now_millis())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }

    async fn force_terminate(&self, id: JobId, reason: &str) -> Result<ForceTerminateOutcome, QueueError> {
        // Each write is conditioned on the status just read; retry if the row moved
        for _ in 0..MAX_CLAIM_CANDIDATES {
            let job = self.get_job(id).await?;
            let previous_status = job.status;

            let (action, result) = match previous_status {
                JobStatus::Pending | JobStatus::Processing => {
                    let now = now_millis();
                    let result = sqlx::query(
                        "UPDATE jobs SET status = 'failed', attempts = MAX(attempts, max_attempts), \
                         last_error = ?, completed_at = ?, updated_at = ? WHERE id = ? AND status = ?",
                    )
                    .bind(terminated_reason(reason))
                    .bind(now)
                    .bind(now)
                    .bind(id.to_string())
                    .bind(previous_status.as_str())
                    .execute(&self.pool)
                    .await
                    .map_err(map_sqlx)?;
                    (TerminateAction::MarkedFailed, result)
                }
                JobStatus::Completed | JobStatus::Failed => {
                    let result = sqlx::query("DELETE FROM jobs WHERE id = ? AND status = ?")
                        .bind(id.to_string())
                        .bind(previous_status.as_str())
                        .execute(&self.pool)
                        .await
                        .map_err(map_sqlx)?;
                    (TerminateAction::Deleted, result)
                }
            };

            if result.rows_affected() == 1 {
                tracing::info!(
                    job_id = %id,
                    previous = %previous_status,
                    action = ?action,
                    "Force-terminated job"
                );
                return Ok(ForceTerminateOutcome {
                    job_id: id,
                    previous_status,
                    action,
                });
            }
        }

        Err(QueueError::Backend(format!(
            "job {} kept changing state during termination",
            id
        )))
    }

    async fn clear_queue(&self, queue: &str) -> Result<u64, QueueError> {
        let result = sqlx::query("DELETE FROM jobs WHERE queue_name = ? AND status != 'processing'")
            .bind(queue)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected())
    }

    async fn is_healthy(&self) -> bool {
        !self.pool.is_closed() && sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::{SqliteBackend, SqliteConfig};
    use serde_json::json;

    async fn store() -> SqliteQueueStore {
        let backend = SqliteBackend::new_with_config(SqliteConfig::memory())
            .await
            .unwrap();
        SqliteQueueStore::new(backend.pool().clone())
    }

    #[tokio::test]
    async fn test_enqueue_claim_complete() {
        let store = store().await;
        let first = store
            .enqueue("metrics", json!({ "post_id": 1 }), EnqueueOptions::default())
            .await
            .unwrap();
        let second = store
            .enqueue("metrics", json!({ "post_id": 2 }), EnqueueOptions::default())
            .await
            .unwrap();

        let job = store.claim_next("metrics").await.unwrap().expect("Should have job");
        assert_eq!(job.id, first);
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.payload, json!({ "post_id": 1 }));

        store.mark_completed(job.claim()).await.unwrap();
        let job = store.get_job(first).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());

        assert_eq!(store.claim_next("metrics").await.unwrap().unwrap().id, second);
        assert!(store.claim_next("metrics").await.unwrap().is_none());

        let stats = store.get_stats("metrics").await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.total, 2);
        assert_eq!(store.queue_depth("metrics").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failure_counts_attempts_and_late_writes_are_ignored() {
        let store = store().await;
        let id = store
            .enqueue("metrics", json!({}), EnqueueOptions::default().max_attempts(2))
            .await
            .unwrap();

        let claimed = store.claim_next("metrics").await.unwrap().unwrap();
        store.mark_failed(claimed.claim(), "boom").await.unwrap();
        // Not processing any more
        store.mark_completed(claimed.claim()).await.unwrap();

        let job = store.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("boom"));

        assert_eq!(store.get_retryable_failed("metrics", 10).await.unwrap().len(), 1);
        assert!(store.retry_failed(id).await.unwrap());
        assert_eq!(store.get_job(id).await.unwrap().attempts, 1);

        let missing = Claim {
            job_id: Uuid::new_v4(),
            started_at: Some(Utc::now()),
        };
        assert!(matches!(
            store.mark_completed(missing).await,
            Err(QueueError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_write_from_superseded_claim_is_ignored() {
        let store = store().await;
        let id = store
            .enqueue("metrics", json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        let first = store.claim_next("metrics").await.unwrap().unwrap();
        store.restart_job(id).await.unwrap();
        // Claims are stamped in milliseconds
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = store.claim_next("metrics").await.unwrap().unwrap();
        assert_ne!(first.claim(), second.claim());

        store.mark_failed(first.claim(), "late failure").await.unwrap();
        store.release(first.claim()).await.unwrap();
        let job = store.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempts, 0);
        assert!(job.last_error.is_none());

        store.mark_completed(second.claim()).await.unwrap();
        assert_eq!(store.get_job(id).await.unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_release_keeps_attempts() {
        let store = store().await;
        let id = store
            .enqueue("metrics", json!({}), EnqueueOptions::default().max_attempts(2))
            .await
            .unwrap();

        let claimed = store.claim_next("metrics").await.unwrap().unwrap();
        store.release(claimed.claim()).await.unwrap();

        let job = store.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.started_at.is_none());
        assert_eq!(store.claim_next("metrics").await.unwrap().unwrap().id, id);
    }

    #[test]
    fn test_contention_codes_include_extended_variants() {
        // SQLITE_BUSY, SQLITE_LOCKED, SQLITE_BUSY_SNAPSHOT, SQLITE_LOCKED_SHAREDCACHE
        for code in ["5", "6", "517", "262"] {
            assert!(is_contention(code), "{}", code);
        }
        // SQLITE_CONSTRAINT, SQLITE_CONSTRAINT_UNIQUE
        for code in ["19", "2067", "not-a-code"] {
            assert!(!is_contention(code), "{}", code);
        }
    }

    #[tokio::test]
    async fn test_force_terminate_and_clear() {
        let store = store().await;
        let live = store
            .enqueue("metrics", json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        let done = store
            .enqueue("metrics", json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        store.claim_next("metrics").await.unwrap();
        let claimed = store.claim_next("metrics").await.unwrap().unwrap();
        assert_eq!(claimed.id, done);
        store.mark_completed(claimed.claim()).await.unwrap();

        let outcome = store.force_terminate(live, "stuck upstream").await.unwrap();
        assert_eq!(outcome.previous_status, JobStatus::Processing);
        assert_eq!(outcome.action, TerminateAction::MarkedFailed);
        let job = store.get_job(live).await.unwrap();
        assert_eq!(job.last_error.as_deref(), Some("terminated: stuck upstream"));
        assert!(!job.can_retry());

        let outcome = store.force_terminate(done, "cleanup").await.unwrap();
        assert_eq!(outcome.action, TerminateAction::Deleted);

        let in_flight = store
            .enqueue("metrics", json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        store.claim_next("metrics").await.unwrap();
        assert_eq!(store.clear_queue("metrics").await.unwrap(), 1);
        assert!(store.get_job(in_flight).await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_id_is_validation_error() {
        let store = store().await;
        let opts = EnqueueOptions::default().job_id(Uuid::new_v4());
        store.enqueue("metrics", json!({}), opts.clone()).await.unwrap();
        assert!(matches!(
            store.enqueue("metrics", json!({}), opts).await,
            Err(QueueError::Validation(_))
        ));
    }
}
