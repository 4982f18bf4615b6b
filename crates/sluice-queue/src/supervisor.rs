//! Worker supervisor
//!
//! Owns every [`WorkerRuntime`] in the process. Configuration is validated
//! here; an invalid config never leaves a queue without a worker, the
//! supervisor falls back to the last config that validated for that worker,
//! or to the defaults.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sluice_resilience::{AdaptiveRateLimiter, PaceStore};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::config::{ConfigError, WorkerConfig};
use crate::job::{EnqueueOptions, JobId, QueueStats};
use crate::metrics::WorkerHealth;
use crate::store::{QueueError, QueueStore};
use crate::worker::{JobHandler, WorkerRuntime};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Restart runtimes whose health check fails, not only dead ones
    pub auto_restart_unhealthy: bool,
    /// Initialization errors kept for diagnostics
    pub max_init_errors: usize,
    /// Grace period when replacing a running runtime
    pub replace_grace: Duration,
    /// Dead-letter stuck threshold; worker timeouts must stay below it
    pub stuck_threshold: Option<Duration>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            auto_restart_unhealthy: false,
            max_init_errors: 50,
            replace_grace: Duration::from_secs(30),
            stuck_threshold: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Unknown worker: {0}")]
    UnknownWorker(String),
}

/// A rejected worker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitError {
    pub worker: String,
    pub at: DateTime<Utc>,
    pub problems: Vec<String>,
}

struct WorkerEntry {
    runtime: Arc<WorkerRuntime>,
    handler: Arc<dyn JobHandler>,
}

/// Typed handle to a registered queue
#[derive(Clone)]
pub struct QueueHandle {
    name: String,
    store: Arc<dyn QueueStore>,
    runtime: Arc<WorkerRuntime>,
}

impl QueueHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue with this worker's retry budget
    pub async fn enqueue(&self, payload: serde_json::Value) -> Result<JobId, QueueError> {
        self.enqueue_with(payload, self.runtime.config().enqueue_options())
            .await
    }

    pub async fn enqueue_with(
        &self,
        payload: serde_json::Value,
        opts: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        self.store.enqueue(&self.name, payload, opts).await
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.store.get_stats(&self.name).await
    }

    pub async fn health(&self) -> WorkerHealth {
        self.runtime.health().await
    }

    pub fn runtime(&self) -> &Arc<WorkerRuntime> {
        &self.runtime
    }
}

pub struct WorkerSupervisor {
    store: Arc<dyn QueueStore>,
    pace_store: Option<Arc<dyn PaceStore>>,
    config: SupervisorConfig,
    workers: RwLock<HashMap<String, WorkerEntry>>,
    last_good: RwLock<HashMap<String, WorkerConfig>>,
    init_errors: Mutex<VecDeque<InitError>>,
    /// Serialises (re)initialization so one name never has two live runtimes
    init_lock: Mutex<()>,
}

impl WorkerSupervisor {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self::with_config(store, SupervisorConfig::default())
    }

    pub fn with_config(store: Arc<dyn QueueStore>, config: SupervisorConfig) -> Self {
        Self {
            store,
            pace_store: None,
            config,
            workers: RwLock::new(HashMap::new()),
            last_good: RwLock::new(HashMap::new()),
            init_errors: Mutex::new(VecDeque::new()),
            init_lock: Mutex::new(()),
        }
    }

    /// Persist and restore rate-limiter pace through `pace_store`
    pub fn with_pace_store(mut self, pace_store: Arc<dyn PaceStore>) -> Self {
        self.pace_store = Some(pace_store);
        self
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    /// Validate `config`, replace any runtime already registered as `name`
    /// and start a new one.
    pub async fn initialize_worker(
        &self,
        name: &str,
        config: WorkerConfig,
        handler: Arc<dyn JobHandler>,
    ) -> QueueHandle {
        let _init = self.init_lock.lock().await;

        let problems = self.check(name, &config);
        let effective = if problems.is_empty() {
            self.last_good
                .write()
                .await
                .insert(name.to_string(), config.clone());
            config
        } else {
            let fallback = self.fallback_config(name).await;
            warn!(
                worker = %name,
                problems = ?problems,
                fallback_concurrency = fallback.concurrency,
                "Invalid worker configuration, falling back"
            );
            self.record_init_error(name, problems).await;
            if let Some(problem) = self.stuck_threshold_problem(&fallback) {
                warn!(worker = %name, problem = %problem, "Fallback configuration is not safe either");
            }
            fallback
        };

        self.replace(name, effective, handler).await
    }

    /// Force re-creation of a worker
    pub async fn reinitialize_worker(
        &self,
        name: &str,
        config: WorkerConfig,
        handler: Arc<dyn JobHandler>,
    ) -> QueueHandle {
        info!(worker = %name, "Reinitializing worker");
        self.initialize_worker(name, config, handler).await
    }

    /// Re-create a worker from its stored handler and current config
    pub async fn restart_worker(&self, name: &str) -> Result<QueueHandle, SupervisorError> {
        let _init = self.init_lock.lock().await;

        let (config, handler) = {
            let workers = self.workers.read().await;
            let entry = workers
                .get(name)
                .ok_or_else(|| SupervisorError::UnknownWorker(name.to_string()))?;
            (entry.runtime.config().clone(), Arc::clone(&entry.handler))
        };

        info!(worker = %name, "Restarting worker");
        Ok(self.replace(name, config, handler).await)
    }

    /// Restart dead runtimes, and unhealthy ones when configured to.
    /// Returns the restarted worker names.
    pub async fn check_health_and_restart(&self) -> Vec<String> {
        let runtimes: Vec<(String, Arc<WorkerRuntime>)> = {
            let workers = self.workers.read().await;
            workers
                .iter()
                .map(|(name, entry)| (name.clone(), Arc::clone(&entry.runtime)))
                .collect()
        };

        let mut restarted = Vec::new();
        for (name, runtime) in runtimes {
            let reason = if !runtime.is_running().await {
                Some("dispatch loop not running")
            } else if self.config.auto_restart_unhealthy && !runtime.metrics().is_healthy() {
                Some("unhealthy")
            } else {
                None
            };

            if let Some(reason) = reason {
                warn!(worker = %name, reason = reason, "Auto-restarting worker");
                match self.restart_worker(&name).await {
                    Ok(_) => restarted.push(name),
                    Err(e) => warn!(worker = %name, error = %e, "Auto-restart failed"),
                }
            }
        }
        restarted
    }

    pub async fn health(&self) -> Vec<WorkerHealth> {
        let runtimes: Vec<Arc<WorkerRuntime>> = {
            let workers = self.workers.read().await;
            workers.values().map(|e| Arc::clone(&e.runtime)).collect()
        };

        let mut health = Vec::with_capacity(runtimes.len());
        for runtime in runtimes {
            health.push(runtime.health().await);
        }
        health.sort_by(|a, b| a.name.cmp(&b.name));
        health
    }

    pub async fn worker(&self, name: &str) -> Option<QueueHandle> {
        let workers = self.workers.read().await;
        workers.get(name).map(|entry| self.handle(name, &entry.runtime))
    }

    pub async fn worker_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Recent initialization errors, oldest first
    pub async fn init_errors(&self) -> Vec<InitError> {
        self.init_errors.lock().await.iter().cloned().collect()
    }

    /// Stop every runtime. Returns whether all in-flight jobs finished within `grace`.
    pub async fn shutdown_all(&self, grace: Duration) -> bool {
        // A restart in progress finishes first; later ones find no entry
        let _init = self.init_lock.lock().await;
        let entries: Vec<WorkerEntry> = {
            let mut workers = self.workers.write().await;
            workers.drain().map(|(_, entry)| entry).collect()
        };

        info!(workers = entries.len(), "Shutting down all workers");
        let results =
            futures::future::join_all(entries.iter().map(|e| e.runtime.shutdown(grace))).await;
        results.into_iter().all(|drained| drained)
    }

    /// Every problem with `config` as a worker for `name`
    fn check(&self, name: &str, config: &WorkerConfig) -> Vec<String> {
        let mut problems = match config.validate(name) {
            Ok(()) => Vec::new(),
            Err(ConfigError::Invalid(problems)) => problems,
        };
        problems.extend(self.stuck_threshold_problem(config));
        problems
    }

    fn stuck_threshold_problem(&self, config: &WorkerConfig) -> Option<String> {
        self.config
            .stuck_threshold
            .and_then(|threshold| config.check_stuck_threshold(threshold))
    }

    async fn fallback_config(&self, name: &str) -> WorkerConfig {
        match self.last_good.read().await.get(name) {
            Some(config) => config.clone(),
            None => WorkerConfig::default_for(name),
        }
    }

    async fn record_init_error(&self, name: &str, problems: Vec<String>) {
        let mut errors = self.init_errors.lock().await;
        errors.push_back(InitError {
            worker: name.to_string(),
            at: Utc::now(),
            problems,
        });
        while errors.len() > self.config.max_init_errors {
            errors.pop_front();
        }
    }

    async fn replace(
        &self,
        name: &str,
        config: WorkerConfig,
        handler: Arc<dyn JobHandler>,
    ) -> QueueHandle {
        let previous = self.workers.write().await.remove(name);
        if let Some(previous) = previous {
            if !previous.runtime.shutdown(self.config.replace_grace).await {
                warn!(worker = %name, "Previous runtime still had jobs running when replaced");
            }
        }

        let runtime = Arc::new(self.build_runtime(config, Arc::clone(&handler)).await);
        runtime.start().await;

        let handle = self.handle(name, &runtime);
        self.workers
            .write()
            .await
            .insert(name.to_string(), WorkerEntry { runtime, handler });

        info!(worker = %name, "Worker initialized");
        handle
    }

    async fn build_runtime(&self, config: WorkerConfig, handler: Arc<dyn JobHandler>) -> WorkerRuntime {
        let limiter = match (&config.rate_limit, &self.pace_store) {
            (Some(rate), Some(pace_store)) => {
                let limiter = AdaptiveRateLimiter::new(&config.name, rate.clone())
                    .with_store(Arc::clone(pace_store));
                limiter.restore().await;
                Some(Arc::new(limiter))
            }
            _ => None,
        };

        let runtime = WorkerRuntime::new(config, Arc::clone(&self.store), handler);
        match limiter {
            Some(limiter) => runtime.with_rate_limiter(limiter),
            None => runtime,
        }
    }

    fn handle(&self, name: &str, runtime: &Arc<WorkerRuntime>) -> QueueHandle {
        QueueHandle {
            name: name.to_string(),
            store: Arc::clone(&self.store),
            runtime: Arc::clone(runtime),
        }
    }
}
