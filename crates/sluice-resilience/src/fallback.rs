//! Ordered provider fallback with result caching
//!
//! A [`FallbackExecutor`] tries a list of providers in ascending priority
//! order and returns the first success. Providers that fail their health
//! check, or that have failed too often inside the cool-down window, are
//! passed over. Successful results are cached with moka so repeated lookups
//! for the same key never hit a provider.
//!
//! Provider health here is about *selection*; call suppression is the
//! circuit breaker's job and the two are tracked independently.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::retry::RetryPolicy;

/// Source label for results served from the cache
pub const CACHE_SOURCE: &str = "cache";

/// A named, prioritised way of producing a `T`
#[async_trait]
pub trait FallbackProvider<T>: Send + Sync {
    fn name(&self) -> &str;

    /// Lower runs first
    fn priority(&self) -> u32;

    async fn execute(&self) -> anyhow::Result<T>;

    async fn health_check(&self) -> bool {
        true
    }
}

/// Provider built from a closure
pub struct FnProvider<T, F> {
    name: String,
    priority: u32,
    f: F,
    _output: PhantomData<fn() -> T>,
}

impl<T, F, Fut> FnProvider<T, F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<T>> + Send,
{
    pub fn new(name: &str, priority: u32, f: F) -> Self {
        Self {
            name: name.to_string(),
            priority,
            f,
            _output: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F, Fut> FallbackProvider<T> for FnProvider<T, F>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    async fn execute(&self) -> anyhow::Result<T> {
        (self.f)().await
    }
}

/// Fallback executor configuration
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    /// A provider is skipped once its failures inside `cooldown` exceed this
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub cache_enabled: bool,
    pub cache_ttl: Duration,
    pub cache_max_entries: u64,
    /// Retry each provider call before moving down the chain
    pub retry: Option<RetryPolicy>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(300),
            cache_enabled: true,
            cache_ttl: Duration::from_secs(600),
            cache_max_entries: 1000,
            retry: None,
        }
    }
}

/// Result of a successful fallback execution
#[derive(Debug, Clone)]
pub struct FallbackOutcome<T> {
    pub value: T,
    /// Provider name, or [`CACHE_SOURCE`]
    pub source: String,
    /// Providers passed over (skipped or failed) before the winner
    pub attempts: usize,
    pub is_fallback: bool,
}

/// One provider's failure during an execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFailure {
    pub provider: String,
    pub error: String,
}

/// Fallback execution errors
#[derive(Debug, thiserror::Error)]
pub enum FallbackError {
    #[error("No providers registered")]
    NoProviders,
    #[error("All {} providers failed; last: {}", .attempted.len(), last_failure(.attempted))]
    Exhausted { attempted: Vec<ProviderFailure> },
}

fn last_failure(attempted: &[ProviderFailure]) -> String {
    attempted
        .last()
        .map(|f| format!("{}: {}", f.provider, f.error))
        .unwrap_or_default()
}

#[derive(Debug, Default)]
struct ProviderHealth {
    successes: u64,
    failures: u64,
    average_latency_ms: f64,
    recent_failures: VecDeque<Instant>,
}

impl ProviderHealth {
    fn prune(&mut self, cooldown: Duration) {
        while let Some(front) = self.recent_failures.front() {
            if front.elapsed() > cooldown {
                self.recent_failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn record_latency(&mut self, latency: Duration) {
        let samples = (self.successes + self.failures) as f64;
        let ms = latency.as_secs_f64() * 1000.0;
        self.average_latency_ms += (ms - self.average_latency_ms) / samples.max(1.0);
    }
}

/// Health snapshot for one provider
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealthSnapshot {
    pub name: String,
    pub successes: u64,
    pub failures: u64,
    pub recent_failures: usize,
    pub average_latency_ms: f64,
}

/// Priority-ordered provider chain
pub struct FallbackExecutor<T: Clone + Send + Sync + 'static> {
    config: FallbackConfig,
    providers: Vec<Arc<dyn FallbackProvider<T>>>,
    health: RwLock<HashMap<String, ProviderHealth>>,
    cache: Cache<String, T>,
}

impl<T: Clone + Send + Sync + 'static> FallbackExecutor<T> {
    pub fn new(config: FallbackConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.cache_max_entries)
            .time_to_live(config.cache_ttl)
            .build();

        Self {
            config,
            providers: Vec::new(),
            health: RwLock::new(HashMap::new()),
            cache,
        }
    }

    /// Add a provider, keeping the chain sorted by priority
    pub fn with_provider(mut self, provider: Arc<dyn FallbackProvider<T>>) -> Self {
        self.providers.push(provider);
        // Stable sort keeps registration order between equal priorities
        self.providers.sort_by_key(|p| p.priority());
        self
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    /// Run the chain, consulting the cache first when a key is given
    pub async fn execute(&self, cache_key: Option<&str>) -> Result<FallbackOutcome<T>, FallbackError> {
        if self.providers.is_empty() {
            return Err(FallbackError::NoProviders);
        }

        if let (true, Some(key)) = (self.config.cache_enabled, cache_key) {
            if let Some(value) = self.cache.get(key).await {
                tracing::debug!(cache_key = %key, "Fallback cache hit");
                return Ok(FallbackOutcome {
                    value,
                    source: CACHE_SOURCE.to_string(),
                    attempts: 0,
                    is_fallback: false,
                });
            }
        }

        let mut attempted = Vec::new();

        for (index, provider) in self.providers.iter().enumerate() {
            let name = provider.name().to_string();

            if self.is_cooling_down(&name).await {
                tracing::debug!(provider = %name, "Skipping provider in cool-down");
                attempted.push(ProviderFailure {
                    provider: name,
                    error: "skipped: too many recent failures".to_string(),
                });
                continue;
            }

            if !provider.health_check().await {
                tracing::debug!(provider = %name, "Skipping provider that failed its health check");
                attempted.push(ProviderFailure {
                    provider: name,
                    error: "skipped: health check failed".to_string(),
                });
                continue;
            }

            let started = Instant::now();
            let result = match &self.config.retry {
                Some(policy) => policy.execute(|| provider.execute()).await,
                None => provider.execute().await,
            };
            match result {
                Ok(value) => {
                    self.record(&name, started.elapsed(), true).await;

                    if let (true, Some(key)) = (self.config.cache_enabled, cache_key) {
                        self.cache.insert(key.to_string(), value.clone()).await;
                    }

                    if index > 0 {
                        tracing::info!(provider = %name, passed_over = index, "Served by fallback provider");
                    }

                    return Ok(FallbackOutcome {
                        value,
                        source: name,
                        attempts: index,
                        is_fallback: index > 0,
                    });
                }
                Err(e) => {
                    self.record(&name, started.elapsed(), false).await;
                    tracing::warn!(provider = %name, error = %e, "Provider failed, trying next");
                    attempted.push(ProviderFailure {
                        provider: name,
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::error!(providers = attempted.len(), "Every provider in the chain failed");
        Err(FallbackError::Exhausted { attempted })
    }

    pub async fn provider_health(&self) -> Vec<ProviderHealthSnapshot> {
        let mut health = self.health.write().await;
        self.providers
            .iter()
            .map(|p| {
                let entry = health.entry(p.name().to_string()).or_default();
                entry.prune(self.config.cooldown);
                ProviderHealthSnapshot {
                    name: p.name().to_string(),
                    successes: entry.successes,
                    failures: entry.failures,
                    recent_failures: entry.recent_failures.len(),
                    average_latency_ms: entry.average_latency_ms,
                }
            })
            .collect()
    }

    /// Forget a provider's failure history so it is eligible again
    pub async fn reset_provider(&self, name: &str) {
        self.health.write().await.remove(name);
    }

    pub fn clear_cache(&self) {
        self.cache.invalidate_all();
    }

    async fn is_cooling_down(&self, name: &str) -> bool {
        let mut health = self.health.write().await;
        match health.get_mut(name) {
            Some(entry) => {
                entry.prune(self.config.cooldown);
                entry.recent_failures.len() > self.config.failure_threshold as usize
            }
            None => false,
        }
    }

    async fn record(&self, name: &str, latency: Duration, success: bool) {
        let mut health = self.health.write().await;
        let entry = health.entry(name.to_string()).or_default();
        if success {
            entry.successes += 1;
        } else {
            entry.failures += 1;
            entry.recent_failures.push_back(Instant::now());
        }
        entry.record_latency(latency);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn failing(name: &str, priority: u32) -> Arc<dyn FallbackProvider<String>> {
        let name_owned = name.to_string();
        Arc::new(FnProvider::<String, _>::new(name, priority, move || {
            let name = name_owned.clone();
            async move { Err(anyhow::anyhow!("{} is down", name)) }
        }))
    }

    fn constant(name: &str, priority: u32, value: &str) -> Arc<dyn FallbackProvider<String>> {
        let value = value.to_string();
        Arc::new(FnProvider::<String, _>::new(name, priority, move || {
            let value = value.clone();
            async move { Ok(value) }
        }))
    }

    #[tokio::test]
    async fn test_primary_wins_when_healthy() {
        let executor = FallbackExecutor::new(FallbackConfig::default())
            .with_provider(constant("secondary", 2, "b"))
            .with_provider(constant("primary", 1, "a"));

        let outcome = executor.execute(None).await.unwrap();
        assert_eq!(outcome.value, "a");
        assert_eq!(outcome.source, "primary");
        assert!(!outcome.is_fallback);
    }

    #[tokio::test]
    async fn test_falls_back_and_caches() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let executor = FallbackExecutor::new(FallbackConfig::default())
            .with_provider(failing("primary", 1))
            .with_provider(Arc::new(FnProvider::<String, _>::new("backup", 2, move || {
                counted.fetch_add(1, Ordering::SeqCst);
                async { Ok("from-backup".to_string()) }
            })));

        let first = executor.execute(Some("post:1")).await.unwrap();
        assert_eq!(first.source, "backup");
        assert!(first.is_fallback);
        assert_eq!(first.attempts, 1);

        let second = executor.execute(Some("post:1")).await.unwrap();
        assert_eq!(second.source, CACHE_SOURCE);
        assert_eq!(second.value, "from-backup");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_names_last_failure() {
        let executor = FallbackExecutor::new(FallbackConfig::default())
            .with_provider(failing("a", 1))
            .with_provider(failing("b", 2));

        let err = executor.execute(None).await.unwrap_err();
        match &err {
            FallbackError::Exhausted { attempted } => assert_eq!(attempted.len(), 2),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("b: b is down"));
    }

    #[tokio::test]
    async fn test_cooling_down_provider_is_skipped() {
        let config = FallbackConfig {
            failure_threshold: 2,
            ..Default::default()
        };
        let executor = FallbackExecutor::new(config)
            .with_provider(failing("flaky", 1))
            .with_provider(constant("steady", 2, "ok"));

        for _ in 0..3 {
            executor.execute(None).await.unwrap();
        }

        let health = executor.provider_health().await;
        assert_eq!(health[0].failures, 3);

        // Three failures exceed the threshold of two: "flaky" is not called
        executor.execute(None).await.unwrap();
        let health = executor.provider_health().await;
        assert_eq!(health[0].failures, 3);

        executor.reset_provider("flaky").await;
        executor.execute(None).await.unwrap();
        let health = executor.provider_health().await;
        assert_eq!(health[0].failures, 1);
    }

    #[tokio::test]
    async fn test_at_threshold_provider_is_still_tried() {
        let config = FallbackConfig {
            failure_threshold: 1,
            ..Default::default()
        };
        let executor = FallbackExecutor::new(config)
            .with_provider(failing("flaky", 1))
            .with_provider(constant("steady", 2, "ok"));

        executor.execute(None).await.unwrap();
        executor.execute(None).await.unwrap();
        assert_eq!(executor.provider_health().await[0].failures, 2);

        executor.execute(None).await.unwrap();
        assert_eq!(executor.provider_health().await[0].failures, 2);
    }

    struct Unhealthy {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl FallbackProvider<String> for Unhealthy {
        fn name(&self) -> &str {
            "unhealthy"
        }

        fn priority(&self) -> u32 {
            1
        }

        async fn execute(&self) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("never".to_string())
        }

        async fn health_check(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_failed_health_check_skips_provider() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = FallbackExecutor::new(FallbackConfig::default())
            .with_provider(Arc::new(Unhealthy { calls: calls.clone() }))
            .with_provider(constant("steady", 2, "ok"));

        let outcome = executor.execute(None).await.unwrap();
        assert_eq!(outcome.source, "steady");
        assert!(outcome.is_fallback);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // Skipping is not a failure
        let health = executor.provider_health().await;
        assert_eq!(health[0].failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_policy_wraps_provider_calls() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let flaky = Arc::new(FnProvider::<String, _>::new("flaky", 1, move || {
            let call = counted.fetch_add(1, Ordering::SeqCst);
            async move {
                if call == 0 {
                    anyhow::bail!("connection reset");
                }
                Ok("recovered".to_string())
            }
        }));
        let config = FallbackConfig {
            retry: Some(RetryPolicy {
                jitter: false,
                ..Default::default()
            }),
            ..Default::default()
        };
        let executor = FallbackExecutor::new(config)
            .with_provider(flaky)
            .with_provider(constant("steady", 2, "backup"));

        let outcome = executor.execute(None).await.unwrap();
        assert_eq!(outcome.source, "flaky");
        assert_eq!(outcome.value, "recovered");
        assert!(!outcome.is_fallback);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(executor.provider_health().await[0].failures, 0);
    }
}
