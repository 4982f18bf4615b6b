//! # Sluice Resilience
//!
//! Building blocks that keep workers well-behaved when a dependency is not.
//!
//! - [`CircuitBreaker`]: stop calling a dependency after repeated failures
//! - [`AdaptiveRateLimiter`]: pace calls, slowing down on failure streaks
//! - [`RetryPolicy`]: exponential backoff with jitter
//! - [`FallbackExecutor`]: try providers in priority order, caching results

pub mod circuit_breaker;
pub mod fallback;
pub mod rate_limit;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitConfig, CircuitError, CircuitOpenError, CircuitState, CircuitStats,
};
pub use fallback::{
    FallbackConfig, FallbackError, FallbackExecutor, FallbackOutcome, FallbackProvider,
    FnProvider, ProviderFailure, ProviderHealthSnapshot, CACHE_SOURCE,
};
pub use rate_limit::{
    AdaptiveRateConfig, AdaptiveRateLimiter, MemoryPaceStore, PaceSnapshot, PaceStore,
    PaceStoreError,
};
pub use retry::RetryPolicy;
