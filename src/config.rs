//! Configuration types.
//!
//! All values are startup constants. `QueueConfig::from_env()` reads
//! `EMBED_QUEUE_*` overrides once; nothing is editable at runtime.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Queue, retry, host and scheduler tunables.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Width of a coalescing bucket.
    pub bucket_width: Duration,
    /// Backoff for the first failed attempt (before jitter).
    pub backoff_base: Duration,
    /// Upper bound on any single backoff.
    pub backoff_max: Duration,
    /// Failed attempts after which a record is dead-lettered.
    pub max_attempts: u32,
    /// Records per batch under foreground load.
    pub batch_size: usize,
    /// Records per batch when the system reports idle.
    pub idle_batch_size: usize,
    /// Worker host is closed after this long without a batch.
    pub host_idle_timeout: Duration,
    /// Tick cadence of the durable scheduler.
    pub tick_interval: Duration,
    /// Local orchestration budget per tick (dispatch awaits excluded).
    pub tick_budget: Duration,
    /// How long a tick waits for a batch result.
    pub dispatch_timeout: Duration,
    /// Hard cap on batches dispatched within one tick.
    pub max_batches_per_tick: usize,
    /// Seed for backoff jitter. `None` draws one at startup.
    pub jitter_seed: Option<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            bucket_width: Duration::from_secs(60),
            backoff_base: Duration::from_secs(10),
            backoff_max: Duration::from_secs(6 * 60 * 60), // 6 hours
            max_attempts: 8,
            batch_size: 8,
            idle_batch_size: 24,
            host_idle_timeout: Duration::from_secs(15),
            tick_interval: Duration::from_secs(60), // 1 minute
            tick_budget: Duration::from_millis(250),
            dispatch_timeout: Duration::from_secs(60),
            max_batches_per_tick: 16,
            jitter_seed: None,
        }
    }
}

impl QueueConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bucket_width: env_secs("EMBED_QUEUE_BUCKET_SECS").unwrap_or(defaults.bucket_width),
            backoff_base: env_secs("EMBED_QUEUE_BACKOFF_BASE_SECS")
                .unwrap_or(defaults.backoff_base),
            backoff_max: env_secs("EMBED_QUEUE_BACKOFF_MAX_SECS").unwrap_or(defaults.backoff_max),
            max_attempts: env_parse("EMBED_QUEUE_MAX_ATTEMPTS").unwrap_or(defaults.max_attempts),
            batch_size: env_parse("EMBED_QUEUE_BATCH_SIZE").unwrap_or(defaults.batch_size),
            idle_batch_size: env_parse("EMBED_QUEUE_IDLE_BATCH_SIZE")
                .unwrap_or(defaults.idle_batch_size),
            host_idle_timeout: env_secs("EMBED_QUEUE_HOST_IDLE_SECS")
                .unwrap_or(defaults.host_idle_timeout),
            tick_interval: env_secs("EMBED_QUEUE_TICK_SECS").unwrap_or(defaults.tick_interval),
            tick_budget: env_parse("EMBED_QUEUE_TICK_BUDGET_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.tick_budget),
            dispatch_timeout: env_secs("EMBED_QUEUE_DISPATCH_TIMEOUT_SECS")
                .unwrap_or(defaults.dispatch_timeout),
            max_batches_per_tick: env_parse("EMBED_QUEUE_MAX_BATCHES_PER_TICK")
                .unwrap_or(defaults.max_batches_per_tick),
            jitter_seed: env_parse("EMBED_QUEUE_JITTER_SEED"),
        }
    }

    /// Reject combinations the queue cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket_width.is_zero() {
            return Err(invalid("bucket_width", "must be greater than zero"));
        }
        if self.tick_interval.is_zero() {
            return Err(invalid("tick_interval", "must be greater than zero"));
        }
        if self.max_attempts == 0 {
            return Err(invalid("max_attempts", "must be at least 1"));
        }
        if self.batch_size == 0 || self.idle_batch_size == 0 {
            return Err(invalid("batch_size", "batch sizes must be at least 1"));
        }
        if self.backoff_max < self.backoff_base {
            return Err(invalid("backoff_max", "must not be smaller than backoff_base"));
        }
        Ok(())
    }
}

/// Daemon settings that only the binary needs.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub db_path: PathBuf,
    /// Program and arguments of the worker host subprocess.
    pub host_command: Vec<String>,
}

impl DaemonConfig {
    /// Build from `EMBED_QUEUE_DB_PATH` and `EMBED_QUEUE_HOST_CMD`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_path = std::env::var("EMBED_QUEUE_DB_PATH")
            .unwrap_or_else(|_| "./data/embed-queue.db".to_string());

        let raw = std::env::var("EMBED_QUEUE_HOST_CMD")
            .map_err(|_| ConfigError::MissingEnvVar("EMBED_QUEUE_HOST_CMD".to_string()))?;
        let host_command: Vec<String> = raw.split_whitespace().map(str::to_string).collect();
        if host_command.is_empty() {
            return Err(invalid("EMBED_QUEUE_HOST_CMD", "command is empty"));
        }

        Ok(Self {
            db_path: PathBuf::from(db_path),
            host_command,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_values() {
        let config = QueueConfig::default();
        assert_eq!(config.bucket_width, Duration::from_secs(60));
        assert_eq!(config.backoff_base, Duration::from_secs(10));
        assert_eq!(config.backoff_max, Duration::from_secs(21_600));
        assert_eq!(config.max_attempts, 8);
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.idle_batch_size, 24);
        assert_eq!(config.host_idle_timeout, Duration::from_secs(15));
        assert_eq!(config.tick_budget, Duration::from_millis(250));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_bucket() {
        let config = QueueConfig {
            bucket_width: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn validate_rejects_inverted_backoff() {
        let config = QueueConfig {
            backoff_base: Duration::from_secs(100),
            backoff_max: Duration::from_secs(10),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
