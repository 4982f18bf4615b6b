//! Daemon settings
//!
//! Layered from built-in defaults, an optional TOML file and
//! `SLUICE__`-prefixed environment variables (`SLUICE__DATABASE__URL`,
//! `SLUICE__WORKERS__METRICS__CONCURRENCY`, ...).

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use serde::Deserialize;
use sluice_persist::SqliteConfig;
use sluice_queue::{
    ConfigError, DeadLetterConfig, PayloadRules, RetryMode, SupervisorConfig, WorkerConfig,
};
use sluice_resilience::AdaptiveRateConfig;

const DEFAULT_CONFIG_FILE: &str = "sluice";
const ENV_PREFIX: &str = "SLUICE";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    /// `tracing` filter directive used when neither `RUST_LOG` nor `-v` is given
    pub log_filter: Option<String>,
    pub dead_letter: DeadLetterSettings,
    pub supervisor: SupervisorSettings,
    /// Worker settings keyed by queue name
    pub workers: BTreeMap<String, WorkerSettings>,
    /// Required top-level payload keys, keyed by queue name
    pub payload_rules: PayloadRules,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
    pub wal_mode: bool,
    pub busy_timeout_secs: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        let defaults = SqliteConfig::default();
        Self {
            url: defaults.url,
            max_connections: defaults.max_connections,
            wal_mode: defaults.wal_mode,
            busy_timeout_secs: defaults.busy_timeout_secs,
        }
    }
}

impl DatabaseSettings {
    pub fn sqlite_config(&self) -> SqliteConfig {
        SqliteConfig {
            url: self.url.clone(),
            max_connections: self.max_connections,
            wal_mode: self.wal_mode,
            busy_timeout_secs: self.busy_timeout_secs,
            ..SqliteConfig::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeadLetterSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    pub stuck_threshold_secs: u64,
    pub retry_mode: RetryMode,
    pub batch_limit: usize,
}

impl Default for DeadLetterSettings {
    fn default() -> Self {
        let defaults = DeadLetterConfig::default();
        Self {
            enabled: true,
            interval_secs: defaults.interval.as_secs(),
            stuck_threshold_secs: defaults.stuck_threshold.as_secs(),
            retry_mode: defaults.retry_mode,
            batch_limit: defaults.batch_limit,
        }
    }
}

impl DeadLetterSettings {
    pub fn dead_letter_config(&self) -> DeadLetterConfig {
        DeadLetterConfig {
            interval: Duration::from_secs(self.interval_secs.max(1)),
            stuck_threshold: Duration::from_secs(self.stuck_threshold_secs),
            retry_mode: self.retry_mode,
            batch_limit: self.batch_limit,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    pub auto_restart_unhealthy: bool,
    pub health_check_interval_secs: u64,
    /// How long in-flight jobs get to finish on shutdown
    pub shutdown_grace_secs: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            auto_restart_unhealthy: false,
            health_check_interval_secs: 30,
            shutdown_grace_secs: 30,
        }
    }
}

impl SupervisorSettings {
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            auto_restart_unhealthy: self.auto_restart_unhealthy,
            replace_grace: self.shutdown_grace(),
            ..SupervisorConfig::default()
        }
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Per-queue overrides on top of [`WorkerConfig::default_for`]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub enabled: bool,
    /// Program and arguments run once per job, payload on stdin
    pub command: Vec<String>,
    pub concurrency: Option<usize>,
    pub max_retries: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub circuit_threshold: Option<u32>,
    pub circuit_reset_secs: Option<u64>,
    pub rate_limit: Option<RateLimitSettings>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            command: Vec::new(),
            concurrency: None,
            max_retries: None,
            timeout_secs: None,
            poll_interval_ms: None,
            circuit_threshold: None,
            circuit_reset_secs: None,
            rate_limit: None,
        }
    }
}

impl WorkerSettings {
    /// Unvalidated worker config; the supervisor decides whether to accept it
    pub fn worker_config(&self, name: &str) -> WorkerConfig {
        let mut config = WorkerConfig::default_for(name);

        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(max_retries) = self.max_retries {
            config.max_retries = max_retries;
        }
        if let Some(secs) = self.timeout_secs {
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = self.poll_interval_ms {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(threshold) = self.circuit_threshold {
            config.circuit.failure_threshold = threshold;
        }
        if let Some(secs) = self.circuit_reset_secs {
            config.circuit.reset_timeout = Duration::from_secs(secs);
        }
        config.rate_limit = self.rate_limit.as_ref().map(RateLimitSettings::rate_config);

        config
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    pub initial_interval_ms: u64,
    pub penalty_factor: f64,
    pub recovery_factor: f64,
    pub max_failures: u32,
    pub min_successes: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        let defaults = AdaptiveRateConfig::default();
        Self {
            min_interval_ms: defaults.min_interval.as_millis() as u64,
            max_interval_ms: defaults.max_interval.as_millis() as u64,
            initial_interval_ms: defaults.initial_interval.as_millis() as u64,
            penalty_factor: defaults.penalty_factor,
            recovery_factor: defaults.recovery_factor,
            max_failures: defaults.max_failures,
            min_successes: defaults.min_successes,
        }
    }
}

impl RateLimitSettings {
    pub fn rate_config(&self) -> AdaptiveRateConfig {
        AdaptiveRateConfig {
            min_interval: Duration::from_millis(self.min_interval_ms),
            max_interval: Duration::from_millis(self.max_interval_ms),
            initial_interval: Duration::from_millis(self.initial_interval_ms),
            penalty_factor: self.penalty_factor,
            recovery_factor: self.recovery_factor,
            max_failures: self.max_failures,
            min_successes: self.min_successes,
        }
    }
}

impl Settings {
    /// Load from `path` (required) or `./sluice.toml` (optional), then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let builder = match path {
            Some(path) => Config::builder().add_source(File::from(path).required(true)),
            None => Config::builder()
                .add_source(File::with_name(DEFAULT_CONFIG_FILE).required(false)),
        };
        Self::build(builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        ))
    }

    /// Parse a TOML document without consulting the environment
    pub fn from_toml(source: &str) -> Result<Self> {
        Self::build(Config::builder().add_source(File::from_str(source, FileFormat::Toml)))
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        builder
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Queues with an enabled worker
    pub fn enabled_queues(&self) -> Vec<String> {
        self.workers
            .iter()
            .filter(|(_, worker)| worker.enabled)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Worker config for `queue`, or the defaults when it has no section
    pub fn worker_config(&self, queue: &str) -> WorkerConfig {
        self.workers
            .get(queue)
            .map(|worker| worker.worker_config(queue))
            .unwrap_or_else(|| WorkerConfig::default_for(queue))
    }

    /// Threshold the dead-letter sweep resets processing jobs at, if it runs
    pub fn stuck_threshold(&self) -> Option<Duration> {
        self.dead_letter
            .enabled
            .then(|| self.dead_letter.dead_letter_config().stuck_threshold)
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            stuck_threshold: self.stuck_threshold(),
            ..self.supervisor.supervisor_config()
        }
    }

    /// Reasons `name`'s worker section cannot run; empty when it can
    pub fn worker_problems(&self, name: &str, worker: &WorkerSettings) -> Vec<String> {
        let config = worker.worker_config(name);
        let mut problems = match config.validate(name) {
            Ok(()) => Vec::new(),
            Err(ConfigError::Invalid(problems)) => problems,
        };
        if worker.enabled && worker.command.is_empty() {
            problems.push("command must not be empty".to_string());
        }
        if let Some(threshold) = self.stuck_threshold() {
            problems.extend(config.check_stuck_threshold(threshold));
        }
        problems
    }
}
