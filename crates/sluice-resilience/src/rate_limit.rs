//! Adaptive pacing for calls to an external dependency
//!
//! Unlike a fixed-window limiter, [`AdaptiveRateLimiter`] keeps a single
//! interval between calls and stretches or shrinks it based on observed
//! outcomes: a streak of failures multiplies the interval by the penalty
//! factor, a streak of successes by the recovery factor. The interval is
//! persisted through a [`PaceStore`] so a restarted process resumes at the
//! last known pace.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

/// Adaptive rate limiter configuration
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveRateConfig {
    /// Fastest allowed pace
    pub min_interval: Duration,
    /// Slowest allowed pace
    pub max_interval: Duration,
    /// Pace used on a cold start
    pub initial_interval: Duration,
    /// Multiplier applied after `max_failures` consecutive failures (> 1)
    pub penalty_factor: f64,
    /// Multiplier applied after `min_successes` consecutive successes (< 1)
    pub recovery_factor: f64,
    pub max_failures: u32,
    pub min_successes: u32,
}

impl Default for AdaptiveRateConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(60),
            initial_interval: Duration::from_secs(1),
            penalty_factor: 2.0,
            recovery_factor: 0.8,
            max_failures: 3,
            min_successes: 5,
        }
    }
}

impl AdaptiveRateConfig {
    /// Check the configuration, returning every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();

        if self.min_interval > self.max_interval {
            problems.push("rate limit min_interval must not exceed max_interval".to_string());
        }
        if self.initial_interval < self.min_interval || self.initial_interval > self.max_interval {
            problems.push(
                "rate limit initial_interval must lie within [min_interval, max_interval]"
                    .to_string(),
            );
        }
        if self.penalty_factor.is_nan() || self.penalty_factor <= 1.0 {
            problems.push("rate limit penalty_factor must be greater than 1".to_string());
        }
        if self.recovery_factor.is_nan() || self.recovery_factor <= 0.0 || self.recovery_factor >= 1.0 {
            problems.push("rate limit recovery_factor must be between 0 and 1".to_string());
        }
        if self.max_failures == 0 {
            problems.push("rate limit max_failures must be at least 1".to_string());
        }
        if self.min_successes == 0 {
            problems.push("rate limit min_successes must be at least 1".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }

    fn clamp(&self, interval: Duration) -> Duration {
        interval.max(self.min_interval).min(self.max_interval)
    }

    /// `interval * factor`, clamped; out-of-range products land on a bound
    fn scale(&self, interval: Duration, factor: f64) -> Duration {
        match Duration::try_from_secs_f64(interval.as_secs_f64() * factor) {
            Ok(scaled) => self.clamp(scaled),
            Err(_) if factor > 1.0 => self.max_interval,
            Err(_) => self.min_interval,
        }
    }
}

/// Persisted pacing state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaceSnapshot {
    pub name: String,
    pub current_interval_ms: u64,
    pub success_streak: u32,
    pub failure_streak: u32,
}

/// Pace store error
#[derive(Debug, thiserror::Error)]
pub enum PaceStoreError {
    #[error("Pace store unavailable: {0}")]
    Unavailable(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Cache layer the limiter persists its pace to
#[async_trait]
pub trait PaceStore: Send + Sync {
    async fn load(&self, name: &str) -> Result<Option<PaceSnapshot>, PaceStoreError>;

    async fn save(&self, snapshot: &PaceSnapshot) -> Result<(), PaceStoreError>;
}

/// In-memory pace store (for testing and single-process use)
#[derive(Debug, Default)]
pub struct MemoryPaceStore {
    entries: RwLock<HashMap<String, PaceSnapshot>>,
}

impl MemoryPaceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaceStore for MemoryPaceStore {
    async fn load(&self, name: &str) -> Result<Option<PaceSnapshot>, PaceStoreError> {
        Ok(self.entries.read().await.get(name).cloned())
    }

    async fn save(&self, snapshot: &PaceSnapshot) -> Result<(), PaceStoreError> {
        self.entries
            .write()
            .await
            .insert(snapshot.name.clone(), snapshot.clone());
        Ok(())
    }
}

#[derive(Debug)]
struct PaceState {
    current_interval: Duration,
    next_slot: Option<Instant>,
    success_streak: u32,
    failure_streak: u32,
}

/// Per-dependency adaptive rate limiter
pub struct AdaptiveRateLimiter {
    name: String,
    config: AdaptiveRateConfig,
    state: Mutex<PaceState>,
    store: Option<Arc<dyn PaceStore>>,
}

impl std::fmt::Debug for AdaptiveRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveRateLimiter")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("persisted", &self.store.is_some())
            .finish()
    }
}

impl AdaptiveRateLimiter {
    /// Create a limiter starting at the configured initial interval
    pub fn new(name: &str, config: AdaptiveRateConfig) -> Self {
        let initial = config.clamp(config.initial_interval);
        Self {
            name: name.to_string(),
            config,
            state: Mutex::new(PaceState {
                current_interval: initial,
                next_slot: None,
                success_streak: 0,
                failure_streak: 0,
            }),
            store: None,
        }
    }

    /// Persist pace adjustments to `store`
    pub fn with_store(mut self, store: Arc<dyn PaceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resume from the last persisted pace. Returns whether a snapshot was found.
    pub async fn restore(&self) -> bool {
        let Some(store) = &self.store else {
            return false;
        };

        match store.load(&self.name).await {
            Ok(Some(snapshot)) => {
                let interval = self
                    .config
                    .clamp(Duration::from_millis(snapshot.current_interval_ms));
                let mut state = self.state.lock().await;
                state.current_interval = interval;
                state.success_streak = snapshot.success_streak;
                state.failure_streak = snapshot.failure_streak;
                tracing::info!(
                    limiter = %self.name,
                    interval_ms = interval.as_millis() as u64,
                    "Restored persisted pace"
                );
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(limiter = %self.name, error = %e, "Failed to load persisted pace");
                false
            }
        }
    }

    /// Wait until the current interval has passed since the previous call.
    ///
    /// The slot is reserved under the lock and the sleep happens outside it,
    /// so concurrent callers queue up one interval apart.
    pub async fn wait_for_next_call(&self) {
        let wait_until = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let slot = match state.next_slot {
                Some(next) if next > now => next,
                _ => now,
            };
            state.next_slot = Some(slot + state.current_interval);
            slot
        };

        tokio::time::sleep_until(wait_until).await;
    }

    /// Record a successful call; speeds up after `min_successes` in a row
    pub async fn record_success(&self) {
        let snapshot = {
            let mut state = self.state.lock().await;
            state.failure_streak = 0;
            state.success_streak += 1;

            if state.success_streak < self.config.min_successes {
                return;
            }

            state.success_streak = 0;
            let previous = state.current_interval;
            state.current_interval = self.config.scale(previous, self.config.recovery_factor);

            if state.current_interval == previous {
                return;
            }
            tracing::debug!(
                limiter = %self.name,
                interval_ms = state.current_interval.as_millis() as u64,
                "Pace recovered"
            );
            self.snapshot_of(&state)
        };

        self.persist(snapshot).await;
    }

    /// Record a failed call; slows down after `max_failures` in a row
    pub async fn record_failure(&self) {
        let snapshot = {
            let mut state = self.state.lock().await;
            state.success_streak = 0;
            state.failure_streak += 1;

            if state.failure_streak < self.config.max_failures {
                return;
            }

            state.failure_streak = 0;
            let previous = state.current_interval;
            state.current_interval = self.config.scale(previous, self.config.penalty_factor);

            tracing::warn!(
                limiter = %self.name,
                interval_ms = state.current_interval.as_millis() as u64,
                "Pace penalised after repeated failures"
            );
            self.snapshot_of(&state)
        };

        self.persist(snapshot).await;
    }

    pub async fn current_interval(&self) -> Duration {
        self.state.lock().await.current_interval
    }

    pub async fn snapshot(&self) -> PaceSnapshot {
        let state = self.state.lock().await;
        self.snapshot_of(&state)
    }

    fn snapshot_of(&self, state: &PaceState) -> PaceSnapshot {
        PaceSnapshot {
            name: self.name.clone(),
            current_interval_ms: state.current_interval.as_millis() as u64,
            success_streak: state.success_streak,
            failure_streak: state.failure_streak,
        }
    }

    async fn persist(&self, snapshot: PaceSnapshot) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&snapshot).await {
                tracing::warn!(limiter = %self.name, error = %e, "Failed to persist pace");
            }
        }
    }
}
