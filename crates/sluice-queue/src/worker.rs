//! Worker runtime: one dispatch loop per queue
//!
//! The loop claims jobs one at a time and runs each on its own task, up to
//! the configured concurrency. Mutual exclusion between runtimes (in this
//! process or any other) comes entirely from the store's conditional claim.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sluice_resilience::{AdaptiveRateLimiter, CircuitBreaker, CircuitOpenError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::job::{Job, JobId};
use crate::metrics::{WorkerHealth, WorkerMetrics};
use crate::store::{QueueError, QueueStore};

/// Business logic run for each claimed job
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: Job) -> anyhow::Result<()>;
}

/// Handler built from a closure
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, job: Job) -> anyhow::Result<()> {
        (self.0)(job).await
    }
}

/// Wrap a closure as a shareable [`JobHandler`]
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Why a job execution did not succeed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("Handler failed: {0}")]
    Handler(String),
    #[error("Job timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),
}

/// Result of one dispatch iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Every concurrency slot is taken
    Saturated,
    /// The breaker would reject; nothing was claimed
    CircuitOpen,
    /// No pending job
    Idle,
    /// A job was claimed and handed to a task
    Dispatched(JobId),
}

/// Decrements the active job count however the job task ends
struct ActiveJobGuard(Arc<WorkerMetrics>);

impl ActiveJobGuard {
    fn new(metrics: Arc<WorkerMetrics>) -> Self {
        metrics.job_started();
        Self(metrics)
    }
}

impl Drop for ActiveJobGuard {
    fn drop(&mut self) {
        self.0.job_finished();
    }
}

/// Polling/dispatch runtime for a single queue.
///
/// A runtime is started at most once; after [`shutdown`](Self::shutdown) a
/// new one has to be built.
pub struct WorkerRuntime {
    config: WorkerConfig,
    store: Arc<dyn QueueStore>,
    handler: Arc<dyn JobHandler>,
    breaker: Arc<CircuitBreaker>,
    rate_limiter: Option<Arc<AdaptiveRateLimiter>>,
    metrics: Arc<WorkerMetrics>,
    cancel: CancellationToken,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    last_retry_trigger: Mutex<Instant>,
}

impl WorkerRuntime {
    pub fn new(config: WorkerConfig, store: Arc<dyn QueueStore>, handler: Arc<dyn JobHandler>) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(&config.name, config.circuit));
        let rate_limiter = config
            .rate_limit
            .clone()
            .map(|rate| Arc::new(AdaptiveRateLimiter::new(&config.name, rate)));

        Self {
            config,
            store,
            handler,
            breaker,
            rate_limiter,
            metrics: Arc::new(WorkerMetrics::new()),
            cancel: CancellationToken::new(),
            loop_handle: Mutex::new(None),
            last_retry_trigger: Mutex::new(Instant::now()),
        }
    }

    /// Use `limiter` instead of one built from the config
    pub fn with_rate_limiter(mut self, limiter: Arc<AdaptiveRateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn rate_limiter(&self) -> Option<&Arc<AdaptiveRateLimiter>> {
        self.rate_limiter.as_ref()
    }

    pub fn metrics(&self) -> &Arc<WorkerMetrics> {
        &self.metrics
    }

    /// Spawn the dispatch loop. Returns false if it was already started.
    pub async fn start(self: &Arc<Self>) -> bool {
        let mut handle = self.loop_handle.lock().await;
        if handle.is_some() || self.cancel.is_cancelled() {
            warn!(worker = %self.config.name, "Worker runtime already started");
            return false;
        }

        let runtime = Arc::clone(self);
        *handle = Some(tokio::spawn(runtime.run()));
        true
    }

    /// The dispatch loop is alive
    pub async fn is_running(&self) -> bool {
        match self.loop_handle.lock().await.as_ref() {
            Some(handle) => !handle.is_finished() && !self.cancel.is_cancelled(),
            None => false,
        }
    }

    /// Stop claiming, then wait up to `grace` for in-flight jobs.
    /// Returns whether every job finished in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.cancel.cancel();

        if let Some(handle) = self.loop_handle.lock().await.take() {
            if let Err(e) = handle.await {
                error!(worker = %self.config.name, error = %e, "Dispatch loop ended abnormally");
            }
        }

        let metrics = Arc::clone(&self.metrics);
        let drained = tokio::time::timeout(grace, async move {
            while metrics.active_jobs() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok();

        if drained {
            info!(worker = %self.config.name, "Worker runtime shut down");
        } else {
            warn!(
                worker = %self.config.name,
                active_jobs = self.metrics.active_jobs(),
                "Shutdown grace period elapsed with jobs still running"
            );
        }
        drained
    }

    pub async fn health(&self) -> WorkerHealth {
        let running = self.is_running().await;
        let circuit_state = self.breaker.state().await;
        self.metrics
            .health(&self.config.name, running, circuit_state)
            .await
    }

    async fn run(self: Arc<Self>) {
        info!(
            worker = %self.config.name,
            concurrency = self.config.concurrency,
            "Worker runtime started"
        );

        let mut consecutive_errors = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let pause = match self.poll_once().await {
                Ok(PollOutcome::Dispatched(_)) => {
                    consecutive_errors = 0;
                    Duration::ZERO
                }
                Ok(PollOutcome::Saturated) => {
                    consecutive_errors = 0;
                    self.config.saturation_backoff
                }
                Ok(PollOutcome::Idle) | Ok(PollOutcome::CircuitOpen) => {
                    consecutive_errors = 0;
                    self.config.poll_interval
                }
                Err(e) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= self.config.max_consecutive_loop_errors {
                        error!(
                            worker = %self.config.name,
                            errors = consecutive_errors,
                            cooldown_ms = self.config.loop_error_cooldown.as_millis() as u64,
                            error = %e,
                            "Dispatch loop keeps failing, pausing"
                        );
                        consecutive_errors = 0;
                        self.config.loop_error_cooldown
                    } else {
                        warn!(worker = %self.config.name, error = %e, "Dispatch iteration failed");
                        self.config.poll_interval
                    }
                }
            };

            if pause.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!(worker = %self.config.name, "Worker runtime stopped");
    }

    /// Run one dispatch iteration
    pub async fn poll_once(self: &Arc<Self>) -> Result<PollOutcome, QueueError> {
        let queue = &self.config.name;

        if self.metrics.active_jobs() >= self.config.concurrency {
            return Ok(PollOutcome::Saturated);
        }

        if !self.breaker.would_allow().await {
            debug!(worker = %queue, "Circuit open, not claiming");
            return Ok(PollOutcome::CircuitOpen);
        }

        match self.store.queue_depth(queue).await {
            Ok(depth) => debug!(worker = %queue, depth = depth, "Queue depth"),
            Err(e) => debug!(worker = %queue, error = %e, "Queue depth unavailable"),
        }

        match self.store.claim_next(queue).await? {
            Some(job) => {
                let job_id = job.id;
                info!(worker = %queue, job_id = %job_id, attempts = job.attempts, "claimed job");

                let guard = ActiveJobGuard::new(Arc::clone(&self.metrics));
                let runtime = Arc::clone(self);
                tokio::spawn(async move {
                    runtime.execute(job).await;
                    drop(guard);
                });

                Ok(PollOutcome::Dispatched(job_id))
            }
            None => {
                debug!(worker = %queue, "no job available");
                self.maybe_trigger_retries().await;
                Ok(PollOutcome::Idle)
            }
        }
    }

    async fn execute(&self, job: Job) {
        let job_id = job.id;
        let claim = job.claim();
        let started = Instant::now();

        match self.run_handler(job).await {
            Ok(()) => {
                let elapsed = started.elapsed();
                self.breaker.record_success().await;
                if let Some(limiter) = &self.rate_limiter {
                    limiter.record_success().await;
                }
                self.metrics.record_success(elapsed).await;
                debug!(
                    worker = %self.config.name,
                    job_id = %job_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Job completed"
                );

                self.write_status(job_id, "completion", || self.store.mark_completed(claim))
                    .await;
            }
            Err(ExecutionError::CircuitOpen(e)) => {
                // The handler never ran, so no attempt is spent
                self.metrics.record_circuit_rejection();
                warn!(
                    worker = %self.config.name,
                    job_id = %job_id,
                    error = %e,
                    "Circuit open, returning job to the queue"
                );

                self.write_status(job_id, "release", || self.store.release(claim))
                    .await;
            }
            Err(e) => {
                let elapsed = started.elapsed();
                let timed_out = matches!(e, ExecutionError::Timeout(_));
                let message = e.to_string();

                self.breaker.record_failure().await;
                if let Some(limiter) = &self.rate_limiter {
                    limiter.record_failure().await;
                }
                self.metrics.record_failure(elapsed, &message, timed_out).await;

                if timed_out {
                    warn!(worker = %self.config.name, job_id = %job_id, "Job timed out");
                } else {
                    warn!(worker = %self.config.name, job_id = %job_id, error = %message, "Job failed");
                }

                self.write_status(job_id, "failure", || self.store.mark_failed(claim, &message))
                    .await;
            }
        }
    }

    /// Breaker check, pacing, then the handler raced against the timeout.
    /// A timed-out handler task is left to finish on its own.
    async fn run_handler(&self, job: Job) -> Result<(), ExecutionError> {
        self.breaker.allow().await?;

        if let Some(limiter) = &self.rate_limiter {
            limiter.wait_for_next_call().await;
        }

        let handler = Arc::clone(&self.handler);
        let task = tokio::spawn(async move { handler.handle(job).await });

        match tokio::time::timeout(self.config.timeout, task).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(ExecutionError::Handler(format!("{:#}", e))),
            Ok(Err(join_error)) => Err(ExecutionError::Handler(format!(
                "handler panicked: {}",
                join_error
            ))),
            Err(_) => Err(ExecutionError::Timeout(self.config.timeout)),
        }
    }

    async fn write_status<F, Fut>(&self, job_id: JobId, what: &str, write: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), QueueError>>,
    {
        if let Err(e) = self
            .config
            .store_retry
            .execute_if(write, QueueError::is_transient)
            .await
        {
            error!(
                worker = %self.config.name,
                job_id = %job_id,
                error = %e,
                "Could not record job {}; stored state diverges until the dead-letter sweep",
                what
            );
        }
    }

    async fn maybe_trigger_retries(&self) {
        {
            let mut last = self.last_retry_trigger.lock().await;
            if last.elapsed() < self.config.retry_trigger_interval {
                return;
            }
            *last = Instant::now();
        }

        let queue = &self.config.name;
        let jobs = match self
            .store
            .get_retryable_failed(queue, self.config.retry_trigger_batch)
            .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(worker = %queue, error = %e, "Could not load retryable jobs");
                return;
            }
        };

        let mut requeued = 0;
        for job in jobs {
            match self.store.retry_failed(job.id).await {
                Ok(true) => requeued += 1,
                Ok(false) => {}
                Err(e) => warn!(worker = %queue, job_id = %job.id, error = %e, "Retry trigger failed"),
            }
        }

        if requeued > 0 {
            info!(worker = %queue, requeued = requeued, "Re-pended retryable failed jobs");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{EnqueueOptions, JobStatus};
    use crate::memory::MemoryQueueStore;
    use serde_json::json;
    use sluice_resilience::{CircuitConfig, CircuitState};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config() -> WorkerConfig {
        WorkerConfig::default_for("metrics")
            .timeout(Duration::from_secs(1))
            .poll_interval(Duration::from_millis(10))
    }

    async fn wait_for_status(store: &MemoryQueueStore, id: JobId, status: JobStatus) -> Job {
        for _ in 0..200 {
            let job = store.get_job(id).await.unwrap();
            if job.status == status {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached {}", id, status);
    }

    #[tokio::test]
    async fn test_successful_job_is_completed() {
        let store = Arc::new(MemoryQueueStore::new());
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let handler = handler_fn(move |_job| {
            counted.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        });

        let id = store
            .enqueue("metrics", json!({ "post_id": 1 }), EnqueueOptions::default())
            .await
            .unwrap();

        let runtime = Arc::new(WorkerRuntime::new(config(), store.clone(), handler));
        assert_eq!(runtime.poll_once().await.unwrap(), PollOutcome::Dispatched(id));

        let job = wait_for_status(&store, id, JobStatus::Completed).await;
        assert!(job.completed_at.is_some());
        assert_eq!(job.attempts, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Let the task drop its slot
        tokio::time::sleep(Duration::from_millis(20)).await;
        let health = runtime.health().await;
        assert_eq!(health.processed, 1);
        assert_eq!(health.active_jobs, 0);
        assert!(health.healthy);
    }

    #[tokio::test]
    async fn test_timeout_marks_failed() {
        let store = Arc::new(MemoryQueueStore::new());
        let handler = handler_fn(|_job| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        });
        let config = config().timeout(Duration::from_millis(50));

        let id = store
            .enqueue("metrics", json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        let runtime = Arc::new(WorkerRuntime::new(config, store.clone(), handler));
        runtime.poll_once().await.unwrap();

        let job = wait_for_status(&store, id, JobStatus::Failed).await;
        assert_eq!(job.attempts, 1);
        assert!(job.last_error.unwrap().contains("timed out"));
        assert_eq!(runtime.metrics().health("metrics", false, CircuitState::Closed).await.timeouts, 1);
    }

    #[tokio::test]
    async fn test_saturated_runtime_does_not_claim() {
        let store = Arc::new(MemoryQueueStore::new());
        let handler = handler_fn(|_job| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        });
        for n in 0..2 {
            store
                .enqueue("metrics", json!({ "n": n }), EnqueueOptions::default())
                .await
                .unwrap();
        }

        let runtime = Arc::new(WorkerRuntime::new(config().concurrency(1), store.clone(), handler));
        assert!(matches!(runtime.poll_once().await.unwrap(), PollOutcome::Dispatched(_)));
        assert_eq!(runtime.poll_once().await.unwrap(), PollOutcome::Saturated);
        assert_eq!(store.get_stats("metrics").await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_open_circuit_leaves_jobs_pending() {
        let store = Arc::new(MemoryQueueStore::new());
        let handler = handler_fn(|_job| async { anyhow::bail!("downstream unavailable") });
        let config = config().circuit(CircuitConfig::new(1, Duration::from_secs(60)));

        let first = store
            .enqueue("metrics", json!({ "n": 1 }), EnqueueOptions::default())
            .await
            .unwrap();
        let second = store
            .enqueue("metrics", json!({ "n": 2 }), EnqueueOptions::default())
            .await
            .unwrap();

        let runtime = Arc::new(WorkerRuntime::new(config, store.clone(), handler));
        runtime.poll_once().await.unwrap();
        let job = wait_for_status(&store, first, JobStatus::Failed).await;
        assert!(job.last_error.unwrap().contains("downstream unavailable"));

        assert_eq!(runtime.poll_once().await.unwrap(), PollOutcome::CircuitOpen);
        assert_eq!(store.get_job(second).await.unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_store_outage_is_an_error_not_a_claim() {
        let store = Arc::new(MemoryQueueStore::new());
        let runtime = Arc::new(WorkerRuntime::new(
            config(),
            store.clone(),
            handler_fn(|_job| async { Ok(()) }),
        ));

        store.set_offline(true);
        let err = runtime.poll_once().await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(runtime.metrics().active_jobs(), 0);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let store = Arc::new(MemoryQueueStore::new());
        let runtime = Arc::new(WorkerRuntime::new(
            config(),
            store.clone(),
            handler_fn(|_job| async { Ok(()) }),
        ));

        assert!(runtime.start().await);
        assert!(!runtime.start().await);
        assert!(runtime.is_running().await);

        let id = store
            .enqueue("metrics", json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        wait_for_status(&store, id, JobStatus::Completed).await;

        assert!(runtime.shutdown(Duration::from_secs(1)).await);
        assert!(!runtime.is_running().await);
        assert!(!runtime.start().await);
    }

    #[tokio::test]
    async fn test_rejected_after_cooldown_keeps_its_attempts() {
        let store = Arc::new(MemoryQueueStore::new());
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let handler = handler_fn(move |_job| {
            counted.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                anyhow::bail!("downstream unavailable")
            }
        });
        let config = config().circuit(CircuitConfig::new(1, Duration::from_millis(50)));

        let first = store
            .enqueue("metrics", json!({ "n": 1 }), EnqueueOptions::default())
            .await
            .unwrap();
        let runtime = Arc::new(WorkerRuntime::new(config, store.clone(), handler));
        runtime.poll_once().await.unwrap();
        wait_for_status(&store, first, JobStatus::Failed).await;

        let mut ids = Vec::new();
        for n in 2..4 {
            ids.push(
                store
                    .enqueue("metrics", json!({ "n": n }), EnqueueOptions::default())
                    .await
                    .unwrap(),
            );
        }
        tokio::time::sleep(Duration::from_millis(80)).await;

        // Both are claimed before either task has asked the breaker
        for id in &ids {
            assert_eq!(runtime.poll_once().await.unwrap(), PollOutcome::Dispatched(*id));
        }

        // One task gets the half-open trial call, the other is turned away
        let mut jobs = Vec::new();
        for id in &ids {
            for _ in 0..200 {
                if store.get_job(*id).await.unwrap().status != JobStatus::Processing {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            jobs.push(store.get_job(*id).await.unwrap());
        }
        jobs.sort_by_key(|job| job.attempts);

        assert_eq!(jobs[0].status, JobStatus::Pending);
        assert_eq!(jobs[0].attempts, 0);
        assert!(jobs[0].last_error.is_none());
        assert_eq!(jobs[1].status, JobStatus::Failed);
        assert_eq!(jobs[1].attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let health = runtime.health().await;
        assert_eq!(health.circuit_rejections, 1);
        assert_eq!(health.failed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_loop_errors_pause_the_loop() {
        let store = Arc::new(MemoryQueueStore::new());
        let mut config = config();
        config.max_consecutive_loop_errors = 3;
        config.loop_error_cooldown = Duration::from_secs(30);
        let runtime = Arc::new(WorkerRuntime::new(
            config,
            store.clone(),
            handler_fn(|_job| async { Ok(()) }),
        ));

        store.set_offline(true);
        assert!(runtime.start().await);
        // Three failed polls 10ms apart, then the cool-down begins
        tokio::time::sleep(Duration::from_millis(100)).await;

        store.set_offline(false);
        let id = store
            .enqueue("metrics", json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(store.get_job(id).await.unwrap().status, JobStatus::Pending);
        assert!(runtime.is_running().await);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(store.get_job(id).await.unwrap().status, JobStatus::Completed);

        assert!(runtime.shutdown(Duration::from_secs(1)).await);
    }
}
