//! Engine configuration.
//!
//! Every section has sensible defaults. `EngineConfig::from_env` overlays
//! `INGESTFLOW_*` environment variables on top of them.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::logging::DEFAULT_LOG_FILTER;
use crate::resilience::BackoffPolicy;
use crate::{Error, Result};

/// Prefix shared by every environment variable the engine reads.
pub const ENV_PREFIX: &str = "INGESTFLOW_";

/// Job queue defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobQueueConfig {
    /// Attempts a job gets when its options do not say otherwise.
    pub default_max_attempts: u32,
    /// Backoff used when a job's options do not say otherwise.
    pub default_backoff: BackoffPolicy,
    /// Directory for the file-backed job store. In-memory when unset.
    pub store_dir: Option<String>,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: 3,
            default_backoff: BackoffPolicy::default(),
            store_dir: None,
        }
    }
}

/// Worker pool settings, applied per registered queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Maximum concurrent jobs per queue.
    pub concurrency: usize,
    /// Per-attempt timeout in seconds.
    ///
    /// A handler future that exceeds it is dropped and the attempt fails with
    /// a retryable timeout error.
    pub job_timeout_secs: u64,
    /// Poll interval in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            job_timeout_secs: 300,
            poll_interval_ms: 250,
        }
    }
}

impl WorkerPoolConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call, in milliseconds.
    pub open_duration_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration_ms: 30_000,
        }
    }
}

/// Batch ingestion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Documents per batch.
    pub batch_size: usize,
    /// Batches in flight at once.
    pub concurrency: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            concurrency: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Capacity of each broadcast channel.
    pub capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

/// Outbound HTTP settings for the crawler and scraper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            user_agent: concat!("ingestflow/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Initial filter directive. `RUST_LOG` wins when set.
    pub filter: String,
    /// Directory for daily-rolled log files. Console only when unset.
    pub dir: Option<String>,
    /// Days rolled files are kept.
    pub retention_days: i64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            dir: None,
            retention_days: 7,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub queue: JobQueueConfig,
    pub workers: WorkerPoolConfig,
    pub breaker: BreakerConfig,
    pub batch: BatchConfig,
    pub events: EventBusConfig,
    pub http: HttpConfig,
    pub log: LogConfig,
}

impl EngineConfig {
    /// Load configuration from the process environment, falling back to
    /// defaults.
    ///
    /// Supported env vars (all prefixed with `INGESTFLOW_`):
    /// - `MAX_ATTEMPTS`, `BACKOFF_DELAY_MS`, `BACKOFF_MAX_DELAY_MS`, `STORE_DIR`
    /// - `WORKER_CONCURRENCY`, `JOB_TIMEOUT_SECS`, `POLL_INTERVAL_MS`
    /// - `BREAKER_THRESHOLD`, `BREAKER_OPEN_MS`
    /// - `BATCH_SIZE`, `BATCH_CONCURRENCY`
    /// - `EVENT_CAPACITY`
    /// - `HTTP_TIMEOUT_SECS`, `USER_AGENT`
    /// - `LOG_FILTER`, `LOG_DIR`, `LOG_RETENTION_DAYS`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`EngineConfig::from_env`] but reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut config = Self::default();

        if let Some(v) = get("MAX_ATTEMPTS") {
            config.queue.default_max_attempts = parse_var("MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("BACKOFF_DELAY_MS") {
            config.queue.default_backoff.delay_ms = parse_var("BACKOFF_DELAY_MS", &v)?;
        }
        if let Some(v) = get("BACKOFF_MAX_DELAY_MS") {
            config.queue.default_backoff.max_delay_ms = parse_var("BACKOFF_MAX_DELAY_MS", &v)?;
        }
        if let Some(v) = get("STORE_DIR") {
            config.queue.store_dir = Some(v);
        }

        if let Some(v) = get("WORKER_CONCURRENCY") {
            config.workers.concurrency = parse_var("WORKER_CONCURRENCY", &v)?;
        }
        if let Some(v) = get("JOB_TIMEOUT_SECS") {
            config.workers.job_timeout_secs = parse_var("JOB_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("POLL_INTERVAL_MS") {
            config.workers.poll_interval_ms = parse_var("POLL_INTERVAL_MS", &v)?;
        }

        if let Some(v) = get("BREAKER_THRESHOLD") {
            config.breaker.failure_threshold = parse_var("BREAKER_THRESHOLD", &v)?;
        }
        if let Some(v) = get("BREAKER_OPEN_MS") {
            config.breaker.open_duration_ms = parse_var("BREAKER_OPEN_MS", &v)?;
        }

        if let Some(v) = get("BATCH_SIZE") {
            config.batch.batch_size = parse_var("BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("BATCH_CONCURRENCY") {
            config.batch.concurrency = parse_var("BATCH_CONCURRENCY", &v)?;
        }

        if let Some(v) = get("EVENT_CAPACITY") {
            config.events.capacity = parse_var("EVENT_CAPACITY", &v)?;
        }

        if let Some(v) = get("HTTP_TIMEOUT_SECS") {
            config.http.timeout_secs = parse_var("HTTP_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("USER_AGENT") {
            config.http.user_agent = v;
        }

        if let Some(v) = get("LOG_FILTER") {
            config.log.filter = v;
        }
        if let Some(v) = get("LOG_DIR") {
            config.log.dir = Some(v);
        }
        if let Some(v) = get("LOG_RETENTION_DAYS") {
            config.log.retention_days = parse_var("LOG_RETENTION_DAYS", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.queue.default_max_attempts == 0 {
            return Err(Error::config("max attempts must be at least 1"));
        }
        if self.workers.concurrency == 0 {
            return Err(Error::config("worker concurrency must be at least 1"));
        }
        if self.workers.poll_interval_ms == 0 {
            return Err(Error::config("poll interval must be greater than 0"));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(Error::config("breaker threshold must be at least 1"));
        }
        if self.batch.batch_size == 0 {
            return Err(Error::config("batch size must be at least 1"));
        }
        if self.batch.concurrency == 0 {
            return Err(Error::config("batch concurrency must be at least 1"));
        }
        if self.events.capacity == 0 {
            return Err(Error::config("event capacity must be at least 1"));
        }
        if self.queue.default_backoff.max_delay_ms < self.queue.default_backoff.delay_ms {
            return Err(Error::config(
                "backoff max delay must not be smaller than the base delay",
            ));
        }
        Ok(())
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| Error::config(format!("{ENV_PREFIX}{name}={value:?}: {e}")))
}
