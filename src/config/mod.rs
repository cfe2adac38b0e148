/// Configuration management for scanflow
///
/// Handles database connection settings, retry behavior, the completed-phase
/// cache, failure-threshold policy and the stale-phase sweeper.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,
    /// Retry policy for transient storage failures
    pub retry: RetryConfig,
    /// Phase aggregation settings
    pub phase: PhaseConfig,
    /// Stale-phase sweeper settings
    pub sweeper: SweeperConfig,
    /// Log level for the fmt subscriber (e.g. "info", "debug")
    pub log_level: String,
}

/// SQLite connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL (e.g. "sqlite://data/scanflow.db")
    pub url: String,
    /// Upper bound on pooled connections
    pub max_connections: u32,
    /// How long a writer waits on a locked database before SQLITE_BUSY
    pub busy_timeout_ms: u64,
}

/// Bounded retry with exponential backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled for every further attempt
    pub backoff_ms: u64,
}

/// What the coordinator does when a completed phase exceeds its failure threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdPolicy {
    /// Fail the owning step, cancelling everything downstream
    Fail,
    /// Complete the owning step but report the phase as degraded
    Degrade,
}

impl FromStr for ThresholdPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "degrade" => Ok(Self::Degrade),
            other => Err(format!("unknown threshold policy: {other}")),
        }
    }
}

/// Phase aggregation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseConfig {
    /// Failure threshold used when the caller does not supply one
    pub default_failure_threshold: f64,
    /// Policy applied when the threshold is exceeded
    pub threshold_policy: ThresholdPolicy,
    /// Maximum number of completed scan records kept in memory
    pub cache_capacity: usize,
    /// How long a cached record may be served before it is read again
    pub cache_ttl_secs: u64,
    /// Capacity of the pipeline event broadcast channel
    pub event_capacity: usize,
}

/// What the sweeper does with a phase that stopped receiving results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StaleAction {
    /// Publish a stale-phase event and leave state untouched
    Report,
    /// Mark the phase FAILED and fail its owning step
    Fail,
}

impl FromStr for StaleAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "report" => Ok(Self::Report),
            "fail" => Ok(Self::Fail),
            other => Err(format!("unknown stale action: {other}")),
        }
    }
}

/// Stale-phase sweeper settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Cron expression (with seconds) for the sweep job
    pub schedule: String,
    /// A phase whose last update is older than this is considered stuck
    pub stale_after_secs: u64,
    pub action: StaleAction,
}

impl RetryConfig {
    /// Backoff before the attempt following `attempt` (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

impl PhaseConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl SweeperConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for container deployment
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: env_or("SCANFLOW_DATABASE_URL", "sqlite://data/scanflow.db".to_string()),
                max_connections: env_or("SCANFLOW_DB_MAX_CONNECTIONS", 8),
                busy_timeout_ms: env_or("SCANFLOW_DB_BUSY_TIMEOUT_MS", 5000),
            },
            retry: RetryConfig {
                max_attempts: env_or("SCANFLOW_RETRY_MAX_ATTEMPTS", 3),
                backoff_ms: env_or("SCANFLOW_RETRY_BACKOFF_MS", 25),
            },
            phase: PhaseConfig {
                default_failure_threshold: env_or("SCANFLOW_DEFAULT_FAILURE_THRESHOLD", 0.05),
                threshold_policy: env_or("SCANFLOW_THRESHOLD_POLICY", ThresholdPolicy::Fail),
                cache_capacity: env_or("SCANFLOW_PHASE_CACHE_CAPACITY", 1024),
                cache_ttl_secs: env_or("SCANFLOW_PHASE_CACHE_TTL_SECS", 30),
                event_capacity: env_or("SCANFLOW_EVENT_CAPACITY", 256),
            },
            sweeper: SweeperConfig {
                schedule: env_or("SCANFLOW_STALE_SWEEP_SCHEDULE", "0 */5 * * * *".to_string()),
                stale_after_secs: env_or("SCANFLOW_STALE_AFTER_SECS", 3600),
                action: env_or("SCANFLOW_STALE_ACTION", StaleAction::Report),
            },
            log_level: env_or("SCANFLOW_LOG_LEVEL", "info".to_string()),
        }
    }
}

/// Read and parse an env var, falling back to `default` when unset or malformed
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
