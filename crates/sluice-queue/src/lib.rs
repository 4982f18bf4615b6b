//! # Sluice Queue
//!
//! Background job processing on top of a plain SQL table.
//!
//! Features:
//! - `QueueStore` trait with a two-phase conditional claim
//! - Worker runtime with concurrency ceiling, timeouts and circuit breaking
//! - Supervisor with config validation and last-known-good fallback
//! - Dead-letter sweep for retryable and orphaned jobs

pub mod config;
pub mod dead_letter;
pub mod job;
pub mod memory;
pub mod metrics;
pub mod store;
pub mod supervisor;
pub mod validation;
pub mod worker;

pub use config::{ConfigError, WorkerConfig};
pub use dead_letter::{DeadLetterConfig, DeadLetterManager, QueueSweep, RetryMode, SweepReport};
pub use job::{
    Claim, EnqueueOptions, ForceTerminateOutcome, Job, JobId, JobStatus, QueueStats,
    TerminateAction,
};
pub use memory::MemoryQueueStore;
pub use metrics::{WorkerHealth, WorkerMetrics};
pub use store::{QueueError, QueueStore, MAX_CLAIM_CANDIDATES};
pub use supervisor::{InitError, QueueHandle, SupervisorConfig, SupervisorError, WorkerSupervisor};
pub use validation::PayloadRules;
pub use worker::{handler_fn, ExecutionError, JobHandler, PollOutcome, WorkerRuntime};
