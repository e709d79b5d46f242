//! Injector configuration
//!
//! Configuration loaded from environment variables and command line.

use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Injector configuration
#[derive(Debug, Clone)]
pub struct InjectorConfig {
    /// PostgreSQL database URL
    pub database_url: String,

    /// Number of independent worker loops
    pub threads: usize,

    /// Seconds to sleep after an empty batch (never after doing work)
    pub sleep_time_secs: u64,

    /// Maximum rules claimed per batch
    pub batch_size: usize,

    /// Rule lease time-to-live in seconds
    pub lease_ttl_secs: u64,

    /// Consecutive no-progress passes before a rule goes STUCK
    pub no_progress_threshold: i32,

    /// Maximum source-replica candidates per transfer request
    pub max_sources: usize,

    /// Attempts for transient store errors within one pass
    pub retry_attempts: u32,

    /// Base delay between transient retries in milliseconds
    pub retry_delay_ms: u64,

    /// Dry run mode (evaluate and log, emit nothing)
    pub dry_run: bool,
}

impl Default for InjectorConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            threads: 1,
            sleep_time_secs: 30,
            batch_size: 100,
            lease_ttl_secs: 300,
            no_progress_threshold: 10,
            max_sources: 4,
            retry_attempts: 3,
            retry_delay_ms: 500,
            dry_run: false,
        }
    }
}

impl InjectorConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?;

        let threads = std::env::var("INJECTOR_THREADS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);

        let sleep_time_secs = std::env::var("INJECTOR_SLEEP_TIME")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        let batch_size = std::env::var("INJECTOR_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(100);

        let lease_ttl_secs = std::env::var("INJECTOR_LEASE_TTL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(300);

        let no_progress_threshold = std::env::var("INJECTOR_NO_PROGRESS_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        let max_sources = std::env::var("INJECTOR_MAX_SOURCES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(4);

        let retry_attempts = std::env::var("INJECTOR_RETRY_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3);

        let retry_delay_ms = std::env::var("INJECTOR_RETRY_DELAY_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(500);

        let dry_run = std::env::var("INJECTOR_DRY_RUN")
            .ok()
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        if threads == 0 {
            return Err(ConfigError::InvalidValue(
                "INJECTOR_THREADS".to_string(),
                "must be >= 1".to_string(),
            ));
        }

        Ok(Self {
            database_url,
            threads,
            sleep_time_secs,
            batch_size,
            lease_ttl_secs,
            no_progress_threshold,
            max_sources,
            retry_attempts,
            retry_delay_ms,
            dry_run,
        })
    }

    /// Get idle sleep as Duration
    pub fn sleep_time(&self) -> Duration {
        Duration::from_secs(self.sleep_time_secs)
    }

    /// Get lease TTL as Duration
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    /// Get transient-retry base delay as Duration
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}
