//! SQLite queue store against real database files

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sluice_persist::{SqliteBackend, SqliteConfig, SqliteQueueStore, StoragePaceStore};
use sluice_queue::{
    handler_fn, DeadLetterConfig, DeadLetterManager, EnqueueOptions, JobStatus, PayloadRules,
    PollOutcome, QueueError, QueueStore, RetryMode, WorkerConfig, WorkerRuntime,
};
use sluice_resilience::{AdaptiveRateConfig, AdaptiveRateLimiter};

async fn file_backend(dir: &tempfile::TempDir) -> SqliteBackend {
    let url = format!("sqlite:{}?mode=rwc", dir.path().join("sluice.db").display());
    let config = SqliteConfig {
        max_connections: 8,
        ..SqliteConfig::file(&url)
    };
    SqliteBackend::new_with_config(config).await.unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claimers_get_distinct_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let backend = file_backend(&dir).await;
    let store = Arc::new(SqliteQueueStore::new(backend.pool().clone()));

    let single = store
        .enqueue("metrics", json!({ "post_id": 1 }), EnqueueOptions::default())
        .await
        .unwrap();

    let claims = futures::future::join_all((0..8).map(|_| {
        let store = store.clone();
        tokio::spawn(async move { store.claim_next("metrics").await.unwrap() })
    }))
    .await;
    let winners: Vec<_> = claims.into_iter().filter_map(|c| c.unwrap()).collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].id, single);

    for n in 0..6 {
        store
            .enqueue("metrics", json!({ "post_id": n }), EnqueueOptions::default())
            .await
            .unwrap();
    }
    let claims = futures::future::join_all((0..12).map(|_| {
        let store = store.clone();
        tokio::spawn(async move { store.claim_next("metrics").await.unwrap() })
    }))
    .await;
    let ids: Vec<_> = claims
        .into_iter()
        .filter_map(|c| c.unwrap())
        .map(|job| job.id)
        .collect();
    let unique: HashSet<_> = ids.iter().collect();
    assert_eq!(unique.len(), ids.len());
    assert!(ids.len() <= 6);
}

#[tokio::test]
async fn test_jobs_survive_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let backend = file_backend(&dir).await;
        let store = SqliteQueueStore::new(backend.pool().clone());
        let id = store
            .enqueue("metrics", json!({ "post_id": 9 }), EnqueueOptions::default().max_attempts(4))
            .await
            .unwrap();
        backend.close().await;
        id
    };

    let backend = file_backend(&dir).await;
    let store = SqliteQueueStore::new(backend.pool().clone());
    let job = store.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.max_attempts, 4);
    assert_eq!(job.payload, json!({ "post_id": 9 }));
}

#[tokio::test]
async fn test_payload_rules_apply_before_insert() {
    let backend = SqliteBackend::new_with_config(SqliteConfig::memory())
        .await
        .unwrap();
    let store = SqliteQueueStore::new(backend.pool().clone())
        .with_rules(PayloadRules::new().require("metrics", &["post_id"]));

    assert!(matches!(
        store.enqueue("metrics", json!({ "other": 1 }), EnqueueOptions::default()).await,
        Err(QueueError::Validation(_))
    ));
    assert!(matches!(
        store.enqueue("", json!({}), EnqueueOptions::default()).await,
        Err(QueueError::Validation(_))
    ));
    assert_eq!(store.get_stats("metrics").await.unwrap().total, 0);
}

#[tokio::test]
async fn test_failing_job_retries_until_exhausted() {
    let backend = SqliteBackend::new_with_config(SqliteConfig::memory())
        .await
        .unwrap();
    let store = Arc::new(SqliteQueueStore::new(backend.pool().clone()));
    let calls = Arc::new(AtomicU32::new(0));
    let counted = calls.clone();
    let handler = handler_fn(move |_job| {
        counted.fetch_add(1, Ordering::SeqCst);
        async { Err(anyhow::anyhow!("upstream unavailable")) }
    });

    let mut config = WorkerConfig::default_for("metrics").poll_interval(Duration::from_millis(10));
    config.retry_trigger_interval = Duration::from_secs(3600);
    let runtime = Arc::new(WorkerRuntime::new(config, store.clone(), handler));
    let sweeper = DeadLetterManager::new(
        store.clone(),
        vec!["metrics".to_string()],
        DeadLetterConfig::default(),
    );

    let id = store
        .enqueue("metrics", json!({ "post_id": 42 }), EnqueueOptions::default().max_attempts(3))
        .await
        .unwrap();

    for attempt in 1..=3u32 {
        assert_eq!(runtime.poll_once().await.unwrap(), PollOutcome::Dispatched(id));
        let mut job = store.get_job(id).await.unwrap();
        for _ in 0..300 {
            if job.status == JobStatus::Failed && job.attempts == attempt {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            job = store.get_job(id).await.unwrap();
        }
        assert_eq!(job.attempts, attempt);
        sweeper.sweep().await;
    }

    let job = store.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.last_error.unwrap().contains("upstream unavailable"));
    assert_eq!(runtime.poll_once().await.unwrap(), PollOutcome::Idle);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_sweep_resets_attempts_and_stuck_jobs() {
    let backend = SqliteBackend::new_with_config(SqliteConfig::memory())
        .await
        .unwrap();
    let store = Arc::new(SqliteQueueStore::new(backend.pool().clone()));
    let sweeper = DeadLetterManager::new(
        store.clone(),
        vec!["metrics".to_string()],
        DeadLetterConfig {
            stuck_threshold: Duration::from_millis(50),
            retry_mode: RetryMode::Reset,
            ..Default::default()
        },
    );

    let failed = store
        .enqueue("metrics", json!({ "post_id": 1 }), EnqueueOptions::default().max_attempts(2))
        .await
        .unwrap();
    let claimed = store.claim_next("metrics").await.unwrap().unwrap();
    store.mark_failed(claimed.claim(), "boom").await.unwrap();

    let stuck = store
        .enqueue("metrics", json!({ "post_id": 2 }), EnqueueOptions::default())
        .await
        .unwrap();
    let orphan = store.claim_next("metrics").await.unwrap().unwrap();
    assert_eq!(orphan.id, stuck);
    tokio::time::sleep(Duration::from_millis(80)).await;

    let report = sweeper.sweep().await;
    assert_eq!(report.failed_requeued(), 1);
    assert_eq!(report.stuck_reset(), 1);
    assert_eq!(report.errors(), 0);

    let job = store.get_job(failed).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);
    let job = store.get_job(stuck).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.started_at.is_none());

    // The orphaned handler finishing late must not touch the next run
    tokio::time::sleep(Duration::from_millis(5)).await;
    let rerun = loop {
        let job = store.claim_next("metrics").await.unwrap().unwrap();
        if job.id == stuck {
            break job;
        }
    };
    store.mark_completed(orphan.claim()).await.unwrap();
    assert_eq!(store.get_job(stuck).await.unwrap().status, JobStatus::Processing);
    store.mark_completed(rerun.claim()).await.unwrap();
    assert_eq!(store.get_job(stuck).await.unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn test_pace_persists_in_kv_table() {
    let dir = tempfile::tempdir().unwrap();
    let config = AdaptiveRateConfig::default();

    {
        let backend = Arc::new(file_backend(&dir).await);
        let limiter = AdaptiveRateLimiter::new("metrics", config.clone())
            .with_store(Arc::new(StoragePaceStore::new(backend.clone())));
        for _ in 0..config.max_failures {
            limiter.record_failure().await;
        }
        backend.close().await;
    }

    let backend = Arc::new(file_backend(&dir).await);
    let pace = Arc::new(StoragePaceStore::new(backend));
    let restored = AdaptiveRateLimiter::new("metrics", config.clone()).with_store(pace);
    restored.restore().await;
    assert!(restored.current_interval().await > config.initial_interval);
}
