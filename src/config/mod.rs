use crate::services::backoff::{BackoffPolicy, BackoffStrategy};
use std::env;
use std::time::Duration;

/// S3 allows at most 10 000 parts per multipart upload.
pub const MAX_MULTIPART_PARTS: u32 = 10_000;

/// Configuration for the upload engine
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Nominal chunk size in bytes (default: 5 MB)
    pub chunk_size: u64,

    /// Payloads at or below this size are sent as a single part (default: 5 MB)
    pub multipart_threshold: u64,

    /// Upper bound on parts per upload (default: 10 000)
    pub max_parts: u32,

    /// Retries per chunk after the first attempt (default: 5)
    pub max_retries: u32,

    /// Backoff strategy: "linear", "exponential" or "fibonacci" (default: "exponential")
    pub backoff_strategy: BackoffStrategy,

    /// Delay before the first retry (default: 1 s)
    pub initial_delay: Duration,

    /// Ceiling for any computed delay (default: 30 s)
    pub max_delay: Duration,

    /// Randomize delays by ±30% (default: true)
    pub jitter: bool,

    /// Retries for the metadata registration call (default: 3)
    pub finalize_max_retries: u32,

    /// Key prefix for persisted chunk plans (default: "upload_ledger:")
    pub ledger_prefix: String,

    /// SQLite URL for the durable ledger (default: "sqlite://upload_ledger.db")
    pub database_url: String,

    /// Capacity of the progress event channel (default: 256)
    pub event_capacity: usize,

    /// Restart a job from scratch once when storage has lost its parts (default: true)
    pub auto_restart_unrecoverable: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: 5 * 1024 * 1024,          // 5 MB
            multipart_threshold: 5 * 1024 * 1024, // 5 MB
            max_parts: MAX_MULTIPART_PARTS,
            max_retries: 5,
            backoff_strategy: BackoffStrategy::Exponential,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: true,
            finalize_max_retries: 3,
            ledger_prefix: "upload_ledger:".to_string(),
            database_url: "sqlite://upload_ledger.db".to_string(),
            event_capacity: 256,
            auto_restart_unrecoverable: true,
        }
    }
}

impl UploadConfig {
    /// Load configuration from environment variables (and `.env` if present)
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let default = Self::default();

        Self {
            chunk_size: env_parse("UPLOAD_CHUNK_SIZE").unwrap_or(default.chunk_size),

            multipart_threshold: env_parse("UPLOAD_MULTIPART_THRESHOLD")
                .unwrap_or(default.multipart_threshold),

            max_parts: default.max_parts,

            max_retries: env_parse("UPLOAD_MAX_RETRIES").unwrap_or(default.max_retries),

            backoff_strategy: env::var("UPLOAD_BACKOFF_STRATEGY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.backoff_strategy),

            initial_delay: env_parse("UPLOAD_INITIAL_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(default.initial_delay),

            max_delay: env_parse("UPLOAD_MAX_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(default.max_delay),

            jitter: env::var("UPLOAD_JITTER")
                .map(|v| v.to_lowercase() != "false" && v != "0")
                .unwrap_or(default.jitter),

            finalize_max_retries: env_parse("UPLOAD_FINALIZE_MAX_RETRIES")
                .unwrap_or(default.finalize_max_retries),

            ledger_prefix: env::var("UPLOAD_LEDGER_PREFIX").unwrap_or(default.ledger_prefix),

            database_url: env::var("LEDGER_DATABASE_URL").unwrap_or(default.database_url),

            event_capacity: env_parse("UPLOAD_EVENT_CAPACITY").unwrap_or(default.event_capacity),

            auto_restart_unrecoverable: default.auto_restart_unrecoverable,
        }
    }

    /// Create config for development (fast retries, no jitter)
    pub fn development() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(500),
            jitter: false,
            database_url: "sqlite::memory:".to_string(),
            ..Self::default()
        }
    }

    /// Create config for production (patient retries, jittered)
    pub fn production() -> Self {
        Self {
            chunk_size: 8 * 1024 * 1024,
            multipart_threshold: 8 * 1024 * 1024,
            max_retries: 8,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
            database_url: env::var("LEDGER_DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://upload_ledger.db".to_string()),
            ..Self::default()
        }
    }

    /// Backoff settings for chunk uploads.
    pub fn chunk_backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            strategy: self.backoff_strategy,
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            jitter: self.jitter,
            max_retries: self.max_retries,
        }
    }

    /// Backoff settings for the registration call.
    pub fn finalize_backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.finalize_max_retries,
            ..self.chunk_backoff()
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}
