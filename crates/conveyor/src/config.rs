//! Queue configuration
//!
//! Configuration is layered: built-in defaults, an optional TOML file, then
//! environment variables. Recognized variables:
//!
//! - `CONVEYOR_CONFIG` — path to a TOML file loaded before the overlay
//! - `QUEUE_TRANSPORT` — `memory` | `redis` | `database`
//! - `QUEUE_NAME`, `QUEUE_CONCURRENCY`, `QUEUE_MAX_ATTEMPTS`
//! - `QUEUE_RETRY_DELAY_MS`, `QUEUE_RETRY_BACKOFF`, `QUEUE_DEFAULT_PRIORITY`
//! - `QUEUE_REMOVE_ON_COMPLETE`, `QUEUE_REMOVE_ON_FAIL`
//! - `QUEUE_MEMORY_MAX_JOBS`, `QUEUE_MEMORY_CLEANUP_INTERVAL_MS`
//! - `REDIS_URL`, `QUEUE_REDIS_KEY_PREFIX`, `QUEUE_REDIS_MAX_RETRIES`,
//!   `QUEUE_REDIS_RETRY_DELAY_MS`, `QUEUE_REDIS_POLL_INTERVAL_MS`
//! - `DATABASE_URL`, `QUEUE_DATABASE_TABLE`, `QUEUE_DATABASE_BATCH_SIZE`,
//!   `QUEUE_DATABASE_POLL_INTERVAL_MS`, `QUEUE_DATABASE_MAX_CONNECTIONS`
//! - `QUEUE_WORKER_ENABLED`, `QUEUE_SHUTDOWN_TIMEOUT_MS`,
//!   `QUEUE_STALLED_INTERVAL_MS`, `QUEUE_MAX_STALLED_COUNT`

use crate::error::{QueueError, Result};
use crate::retry::{BackoffKind, RetryPolicy, DEFAULT_MAX_DELAY};
use crate::transport::TransportKind;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Main queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Explicit transport override; auto-detected from URLs when absent
    #[serde(default)]
    pub transport: Option<TransportKind>,

    /// Queue name, used to share a backend between queues
    #[serde(default = "default_queue_name")]
    pub queue_name: String,

    /// Max active jobs per worker process (1-100)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Default per-job retry ceiling (1-10)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base retry delay in milliseconds (1,000-300,000)
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Default backoff strategy
    #[serde(default)]
    pub retry_backoff: BackoffKind,

    /// Default job priority
    #[serde(default)]
    pub default_priority: i32,

    /// Default completed retention bound per type
    #[serde(default = "default_retention")]
    pub remove_on_complete: u32,

    /// Default failed retention bound per type
    #[serde(default = "default_retention")]
    pub remove_on_fail: u32,

    /// Memory transport tuning
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Redis transport tuning
    #[serde(default)]
    pub redis: RedisConfig,

    /// Database transport tuning
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Worker behaviour
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            transport: None,
            queue_name: default_queue_name(),
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_backoff: BackoffKind::default(),
            default_priority: 0,
            remove_on_complete: default_retention(),
            remove_on_fail: default_retention(),
            memory: MemoryConfig::default(),
            redis: RedisConfig::default(),
            database: DatabaseConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl QueueConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| QueueError::invalid(format!("failed to read config file: {}", e)))?;

        let config: QueueConfig = toml::from_str(&contents)
            .map_err(|e| QueueError::invalid(format!("failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from the environment.
    ///
    /// Starts from defaults (or from the file named by `CONVEYOR_CONFIG`),
    /// then overlays the recognized variables.
    pub fn from_env() -> Result<Self> {
        let mut config = if let Ok(path) = std::env::var("CONVEYOR_CONFIG") {
            Self::load(&path)?
        } else {
            Self::default()
        };

        if let Some(transport) = env_parse::<TransportKind>("QUEUE_TRANSPORT")? {
            config.transport = Some(transport);
        }
        if let Ok(name) = std::env::var("QUEUE_NAME") {
            config.queue_name = name;
        }
        if let Some(v) = env_parse("QUEUE_CONCURRENCY")? {
            config.concurrency = v;
        }
        if let Some(v) = env_parse("QUEUE_MAX_ATTEMPTS")? {
            config.max_attempts = v;
        }
        if let Some(v) = env_parse("QUEUE_RETRY_DELAY_MS")? {
            config.retry_delay_ms = v;
        }
        if let Some(v) = env_parse::<BackoffKind>("QUEUE_RETRY_BACKOFF")? {
            config.retry_backoff = v;
        }
        if let Some(v) = env_parse("QUEUE_DEFAULT_PRIORITY")? {
            config.default_priority = v;
        }
        if let Some(v) = env_parse("QUEUE_REMOVE_ON_COMPLETE")? {
            config.remove_on_complete = v;
        }
        if let Some(v) = env_parse("QUEUE_REMOVE_ON_FAIL")? {
            config.remove_on_fail = v;
        }
        if let Some(v) = env_parse("QUEUE_MEMORY_MAX_JOBS")? {
            config.memory.max_jobs = v;
        }
        if let Some(v) = env_parse("QUEUE_MEMORY_CLEANUP_INTERVAL_MS")? {
            config.memory.cleanup_interval_ms = v;
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            config.redis.url = Some(url);
        }
        if let Ok(prefix) = std::env::var("QUEUE_REDIS_KEY_PREFIX") {
            config.redis.key_prefix = prefix;
        }
        if let Some(v) = env_parse("QUEUE_REDIS_MAX_RETRIES")? {
            config.redis.max_retries_per_request = v;
        }
        if let Some(v) = env_parse("QUEUE_REDIS_RETRY_DELAY_MS")? {
            config.redis.retry_delay_on_failover_ms = v;
        }
        if let Some(v) = env_parse("QUEUE_REDIS_POLL_INTERVAL_MS")? {
            config.redis.poll_interval_ms = v;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database.url = Some(url);
        }
        if let Ok(table) = std::env::var("QUEUE_DATABASE_TABLE") {
            config.database.table_name = table;
        }
        if let Some(v) = env_parse("QUEUE_DATABASE_BATCH_SIZE")? {
            config.database.batch_size = v;
        }
        if let Some(v) = env_parse("QUEUE_DATABASE_POLL_INTERVAL_MS")? {
            config.database.poll_interval_ms = v;
        }
        if let Some(v) = env_parse("QUEUE_DATABASE_MAX_CONNECTIONS")? {
            config.database.max_connections = v;
        }
        if let Some(v) = env_parse("QUEUE_WORKER_ENABLED")? {
            config.worker.enabled = v;
        }
        if let Some(v) = env_parse("QUEUE_SHUTDOWN_TIMEOUT_MS")? {
            config.worker.graceful_shutdown_timeout_ms = v;
        }
        if let Some(v) = env_parse("QUEUE_STALLED_INTERVAL_MS")? {
            config.worker.stalled_interval_ms = v;
        }
        if let Some(v) = env_parse("QUEUE_MAX_STALLED_COUNT")? {
            config.worker.max_stalled_count = v;
        }

        config.validate()?;

        Ok(config)
    }

    /// Development configuration (small pools, fast ticks)
    pub fn development() -> Self {
        Self {
            concurrency: 2,
            redis: RedisConfig {
                poll_interval_ms: 250,
                ..RedisConfig::default()
            },
            database: DatabaseConfig {
                poll_interval_ms: 1_000,
                ..DatabaseConfig::default()
            },
            ..Self::default()
        }
    }

    /// Production configuration (more workers, more retries)
    pub fn production() -> Self {
        Self {
            concurrency: 20,
            max_attempts: 5,
            worker: WorkerConfig {
                graceful_shutdown_timeout_ms: 60_000,
                ..WorkerConfig::default()
            },
            ..Self::default()
        }
    }

    /// Validate the recognized ranges
    pub fn validate(&self) -> Result<()> {
        if self.queue_name.is_empty() {
            return Err(QueueError::invalid("queue_name must not be empty"));
        }
        if !(1..=100).contains(&self.concurrency) {
            return Err(QueueError::invalid("concurrency must be within 1-100"));
        }
        if !(1..=10).contains(&self.max_attempts) {
            return Err(QueueError::invalid("max_attempts must be within 1-10"));
        }
        if !(1_000..=300_000).contains(&self.retry_delay_ms) {
            return Err(QueueError::invalid(
                "retry_delay_ms must be within 1,000-300,000",
            ));
        }
        if self.memory.max_jobs == 0 {
            return Err(QueueError::invalid("memory.max_jobs must be > 0"));
        }
        if !(1_000..=60_000).contains(&self.database.poll_interval_ms) {
            return Err(QueueError::invalid(
                "database.poll_interval_ms must be within 1,000-60,000",
            ));
        }
        if self.database.batch_size == 0 {
            return Err(QueueError::invalid("database.batch_size must be > 0"));
        }
        if !self
            .database
            .table_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
            || self.database.table_name.is_empty()
        {
            return Err(QueueError::invalid(
                "database.table_name must match [A-Za-z0-9_]+",
            ));
        }
        if !(5_000..=120_000).contains(&self.worker.graceful_shutdown_timeout_ms) {
            return Err(QueueError::invalid(
                "worker.graceful_shutdown_timeout_ms must be within 5,000-120,000",
            ));
        }
        if self.worker.stalled_interval_ms == 0 {
            return Err(QueueError::invalid("worker.stalled_interval_ms must be > 0"));
        }
        if let Some(ref url) = self.redis.url {
            let parsed = url::Url::parse(url)
                .map_err(|e| QueueError::invalid(format!("redis.url is not a valid URL: {}", e)))?;
            if !matches!(parsed.scheme(), "redis" | "rediss") {
                return Err(QueueError::invalid(
                    "redis.url must use the redis:// or rediss:// scheme",
                ));
            }
        }
        if let Some(ref url) = self.database.url {
            let parsed = url::Url::parse(url).map_err(|e| {
                QueueError::invalid(format!("database.url is not a valid URL: {}", e))
            })?;
            if !matches!(parsed.scheme(), "postgres" | "postgresql" | "mysql" | "sqlite") {
                return Err(QueueError::invalid(
                    "database.url must use a postgres://, mysql:// or sqlite:// scheme",
                ));
            }
        }
        Ok(())
    }

    /// Retry policy derived from the configured defaults
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            kind: self.retry_backoff,
            base_delay: Duration::from_millis(self.retry_delay_ms),
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

/// Memory transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Total jobs the transport will hold before rejecting enqueues
    #[serde(default = "default_memory_max_jobs")]
    pub max_jobs: usize,

    /// Retention sweep period in milliseconds
    #[serde(default = "default_memory_cleanup_interval")]
    pub cleanup_interval_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_jobs: default_memory_max_jobs(),
            cleanup_interval_ms: default_memory_cleanup_interval(),
        }
    }
}

impl MemoryConfig {
    /// Get cleanup interval as Duration
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

/// Redis transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Connection string (redis:// or rediss://)
    #[serde(default)]
    pub url: Option<String>,

    /// Key namespace
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Reconnect attempts before a request fails
    #[serde(default = "default_redis_max_retries")]
    pub max_retries_per_request: u32,

    /// Delay between reconnect attempts in milliseconds
    #[serde(default = "default_redis_retry_delay")]
    pub retry_delay_on_failover_ms: u64,

    /// Worker tick period in milliseconds
    #[serde(default = "default_redis_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: default_key_prefix(),
            max_retries_per_request: default_redis_max_retries(),
            retry_delay_on_failover_ms: default_redis_retry_delay(),
            poll_interval_ms: default_redis_poll_interval(),
        }
    }
}

impl RedisConfig {
    /// Get failover retry delay as Duration
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_on_failover_ms)
    }

    /// Get worker tick period as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Database transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Connection string (postgres://, mysql:// or sqlite://)
    #[serde(default)]
    pub url: Option<String>,

    /// Jobs table identifier
    #[serde(default = "default_table_name")]
    pub table_name: String,

    /// Rows claimed per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Worker tick period in milliseconds (1,000-60,000)
    #[serde(default = "default_db_poll_interval")]
    pub poll_interval_ms: u64,

    /// Connection pool size
    #[serde(default = "default_db_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            table_name: default_table_name(),
            batch_size: default_batch_size(),
            poll_interval_ms: default_db_poll_interval(),
            max_connections: default_db_max_connections(),
        }
    }
}

impl DatabaseConfig {
    /// Get worker tick period as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Worker behaviour configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// When false the queue only enqueues; no dispatch loops run
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Budget for in-flight handlers during close, in ms (5,000-120,000)
    #[serde(default = "default_shutdown_timeout")]
    pub graceful_shutdown_timeout_ms: u64,

    /// Lease length for active jobs in milliseconds
    #[serde(default = "default_stalled_interval")]
    pub stalled_interval_ms: u64,

    /// Times a stalled job is requeued before failing
    #[serde(default = "default_max_stalled_count")]
    pub max_stalled_count: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            graceful_shutdown_timeout_ms: default_shutdown_timeout(),
            stalled_interval_ms: default_stalled_interval(),
            max_stalled_count: default_max_stalled_count(),
        }
    }
}

impl WorkerConfig {
    /// Get shutdown budget as Duration
    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_shutdown_timeout_ms)
    }

    /// Get lease length as Duration
    pub fn stalled_interval(&self) -> Duration {
        Duration::from_millis(self.stalled_interval_ms)
    }
}

/// Parse an environment variable, mapping parse failures to InvalidArgument
fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| QueueError::invalid(format!("{} has an invalid value: {}", key, raw))),
        Err(_) => Ok(None),
    }
}

// Default value helper functions
fn default_true() -> bool {
    true
}
fn default_queue_name() -> String {
    "default".to_string()
}
fn default_concurrency() -> usize {
    5
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1_000
}
fn default_retention() -> u32 {
    100
}
fn default_memory_max_jobs() -> usize {
    10_000
}
fn default_memory_cleanup_interval() -> u64 {
    60_000
}
fn default_key_prefix() -> String {
    "conveyor".to_string()
}
fn default_redis_max_retries() -> u32 {
    3
}
fn default_redis_retry_delay() -> u64 {
    1_000
}
fn default_redis_poll_interval() -> u64 {
    1_000
}
fn default_table_name() -> String {
    "conveyor_jobs".to_string()
}
fn default_batch_size() -> u32 {
    10
}
fn default_db_poll_interval() -> u64 {
    1_000
}
fn default_db_max_connections() -> u32 {
    10
}
fn default_shutdown_timeout() -> u64 {
    30_000
}
fn default_stalled_interval() -> u64 {
    30_000
}
fn default_max_stalled_count() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QueueConfig::default();
        assert!(config.transport.is_none());
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.retry_backoff, BackoffKind::Exponential);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets() {
        let dev = QueueConfig::development();
        assert_eq!(dev.concurrency, 2);
        assert!(dev.validate().is_ok());

        let prod = QueueConfig::production();
        assert_eq!(prod.concurrency, 20);
        assert_eq!(prod.max_attempts, 5);
        assert!(prod.validate().is_ok());
    }

    #[test]
    fn test_validate_ranges() {
        let mut config = QueueConfig::default();
        config.concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = QueueConfig::default();
        config.max_attempts = 11;
        assert!(config.validate().is_err());

        let mut config = QueueConfig::default();
        config.retry_delay_ms = 500;
        assert!(config.validate().is_err());

        let mut config = QueueConfig::default();
        config.database.table_name = "jobs; DROP TABLE".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_urls() {
        let mut config = QueueConfig::default();
        config.redis.url = Some("http://localhost".to_string());
        assert!(config.validate().is_err());

        config.redis.url = Some("redis://127.0.0.1:6379/0".to_string());
        assert!(config.validate().is_ok());

        config.database.url = Some("mongodb://localhost".to_string());
        assert!(config.validate().is_err());

        config.database.url = Some("postgres://localhost/queue".to_string());
        assert!(config.validate().is_ok());
    }

    // Environment mutation is process-wide, so the overlay checks share one
    // test to keep them sequential.
    #[test]
    fn test_from_env() {
        std::env::set_var("QUEUE_CONCURRENCY", "7");
        std::env::set_var("QUEUE_RETRY_BACKOFF", "fixed");

        let config = QueueConfig::from_env().unwrap();
        assert_eq!(config.concurrency, 7);
        assert_eq!(config.retry_backoff, BackoffKind::Fixed);

        std::env::set_var("QUEUE_MAX_ATTEMPTS", "lots");
        assert!(QueueConfig::from_env().is_err());

        std::env::remove_var("QUEUE_CONCURRENCY");
        std::env::remove_var("QUEUE_RETRY_BACKOFF");
        std::env::remove_var("QUEUE_MAX_ATTEMPTS");
    }

    #[test]
    fn test_retry_policy_from_config() {
        let mut config = QueueConfig::default();
        config.retry_backoff = BackoffKind::Fixed;
        config.retry_delay_ms = 2_000;

        let policy = config.retry_policy();
        assert_eq!(policy.delay_for(3), Duration::from_millis(2_000));
    }
}
