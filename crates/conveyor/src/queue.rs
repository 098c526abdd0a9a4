//! Queue façade
//!
//! Validates inputs, merges options over the configured defaults, assigns job
//! ids, selects the transport once per instance and delegates the operational
//! surface to it. Handlers are wrapped for timing, tracing and metrics before
//! they reach a transport; retry scheduling stays with the transport.

use crate::config::QueueConfig;
use crate::error::{HandlerResult, QueueError, Result};
use crate::job::{Job, JobId, JobInfo, JobOptions, JobStatus};
use crate::metrics::{JobMetrics, MetricsSummary};
use crate::transport::database::DatabaseTransport;
use crate::transport::memory::MemoryTransport;
use crate::transport::redis::RedisTransport;
use crate::transport::{
    FnHandler, Health, HealthStatus, JobHandler, QueueStats, Transport, TransportKind,
};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

lazy_static! {
    static ref JOB_TYPE_PATTERN: Regex =
        Regex::new("^[A-Za-z0-9_-]{1,100}$").expect("valid job type pattern");
}

/// Longest accepted enqueue delay (one year)
const MAX_DELAY_MS: u64 = 365 * 24 * 60 * 60 * 1_000;

/// Default `clean` grace (24 hours)
const DEFAULT_CLEAN_GRACE_MS: u64 = 24 * 60 * 60 * 1_000;

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

fn validate_job_type(job_type: &str) -> Result<()> {
    if JOB_TYPE_PATTERN.is_match(job_type) {
        Ok(())
    } else {
        Err(QueueError::invalid(
            "job type must match [A-Za-z0-9_-]+ and be at most 100 characters",
        ))
    }
}

/// Adds timing, tracing and metrics around a user handler
struct WrappedHandler {
    job_type: String,
    inner: Arc<dyn JobHandler>,
    metrics: Arc<JobMetrics>,
}

#[async_trait]
impl JobHandler for WrappedHandler {
    async fn handle(&self, data: serde_json::Value) -> HandlerResult {
        let start = std::time::Instant::now();
        let result = self.inner.handle(data).await;
        let elapsed = start.elapsed();
        match &result {
            Ok(_) => {
                self.metrics.record_success(elapsed);
                debug!(
                    "handler succeeded: type={}, duration_ms={}",
                    self.job_type,
                    elapsed.as_millis()
                );
            }
            Err(error) => {
                self.metrics.record_failure(elapsed);
                debug!(
                    "handler failed: type={}, duration_ms={}, error={}",
                    self.job_type,
                    elapsed.as_millis(),
                    error.message
                );
            }
        }
        result
    }
}

/// The public queue handle
pub struct Queue {
    config: QueueConfig,
    transport: Arc<dyn Transport>,
    registered: std::sync::Mutex<HashSet<String>>,
    state: AtomicU8,
    fallback_reason: Option<String>,
    metrics: Arc<JobMetrics>,
    hook_installed: AtomicBool,
}

impl Queue {
    /// Build a queue, selecting the transport once.
    ///
    /// An explicit `transport` override wins; otherwise the first configured
    /// backend URL decides (Redis, then database), and memory is the default.
    /// A backend that fails to initialize falls back to memory and the reason
    /// surfaces through `health()` until the queue closes.
    pub async fn new(config: QueueConfig) -> Result<Self> {
        config.validate()?;

        let selected = match config.transport {
            Some(kind) => kind,
            None if config.redis.url.is_some() => TransportKind::Redis,
            None if config.database.url.is_some() => TransportKind::Database,
            None => TransportKind::Memory,
        };

        let (transport, fallback_reason): (Arc<dyn Transport>, Option<String>) = match selected {
            TransportKind::Memory => (Arc::new(MemoryTransport::new(config.clone())), None),
            TransportKind::Redis => match RedisTransport::connect(config.clone()).await {
                Ok(transport) => (Arc::new(transport), None),
                Err(e) => {
                    let reason = format!("redis transport unavailable: {}", e);
                    warn!("{}; falling back to memory", reason);
                    (Arc::new(MemoryTransport::new(config.clone())), Some(reason))
                }
            },
            TransportKind::Database => match DatabaseTransport::connect(config.clone()).await {
                Ok(transport) => (Arc::new(transport), None),
                Err(e) => {
                    let reason = format!("database transport unavailable: {}", e);
                    warn!("{}; falling back to memory", reason);
                    (Arc::new(MemoryTransport::new(config.clone())), Some(reason))
                }
            },
        };

        info!(
            "queue ready: name={}, transport={}",
            config.queue_name,
            transport.kind()
        );

        Ok(Self {
            config,
            transport,
            registered: std::sync::Mutex::new(HashSet::new()),
            state: AtomicU8::new(STATE_OPEN),
            fallback_reason,
            metrics: Arc::new(JobMetrics::new()),
            hook_installed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.load(Ordering::SeqCst) == STATE_OPEN {
            Ok(())
        } else {
            Err(QueueError::Closed)
        }
    }

    /// Which backend this queue runs on
    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// The configuration the queue was built with
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn build_job(&self, job_type: &str, data: serde_json::Value, options: &JobOptions) -> Job {
        let mut job = Job::new(JobId::new_v4(), job_type, data);
        job.priority = options.priority.unwrap_or(self.config.default_priority);
        job.max_attempts = options.max_attempts.unwrap_or(self.config.max_attempts);
        job.backoff = options.backoff.unwrap_or(self.config.retry_backoff);
        job.retry_delay_ms = options.retry_delay_ms.unwrap_or(self.config.retry_delay_ms);
        job.remove_on_complete = options
            .remove_on_complete
            .unwrap_or(self.config.remove_on_complete);
        job.remove_on_fail = options.remove_on_fail.unwrap_or(self.config.remove_on_fail);

        let delay_ms = options.delay_ms.unwrap_or(0);
        if delay_ms > 0 {
            job.delay_ms = delay_ms;
            job.available_at = job.created_at + delay_ms as i64;
            job.status = JobStatus::Delayed;
        }
        job
    }

    /// Enqueue a job; returns its id once the transport has recorded it
    pub async fn add(
        &self,
        job_type: &str,
        data: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobId> {
        self.ensure_open()?;
        validate_job_type(job_type)?;
        if data.is_null() {
            return Err(QueueError::invalid("job data must not be null"));
        }
        if let Some(delay_ms) = options.delay_ms {
            if delay_ms > MAX_DELAY_MS {
                return Err(QueueError::invalid("delay must not exceed one year"));
            }
        }

        let job = self.build_job(job_type, data, &options);
        let id = job.id;
        self.transport.add(job).await?;
        debug!("job added: id={}, type={}", id, job_type);
        Ok(id)
    }

    /// Enqueue a job that becomes eligible after `delay_ms`
    pub async fn schedule(
        &self,
        job_type: &str,
        data: serde_json::Value,
        delay_ms: u64,
    ) -> Result<JobId> {
        self.add(job_type, data, JobOptions::new().with_delay_ms(delay_ms))
            .await
    }

    /// Register the handler for a job type.
    ///
    /// Exactly one handler per type per process; a second registration is a
    /// `Conflict`.
    pub async fn process(&self, job_type: &str, handler: Arc<dyn JobHandler>) -> Result<()> {
        self.ensure_open()?;
        validate_job_type(job_type)?;
        {
            let mut registered = self.registered.lock().expect("registered set lock");
            if !registered.insert(job_type.to_owned()) {
                return Err(QueueError::conflict(format!(
                    "a handler is already registered for type {}",
                    job_type
                )));
            }
        }

        let wrapped = Arc::new(WrappedHandler {
            job_type: job_type.to_owned(),
            inner: handler,
            metrics: self.metrics.clone(),
        });
        match self.transport.process(job_type, wrapped).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.registered
                    .lock()
                    .expect("registered set lock")
                    .remove(job_type);
                Err(e)
            }
        }
    }

    /// Register an async closure as the handler for a job type
    pub async fn process_fn<F, Fut>(&self, job_type: &str, handler: F) -> Result<()>
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.process(job_type, Arc::new(FnHandler::new(handler)))
            .await
    }

    /// Stop dispatching one type, or every type when `None`. Idempotent.
    pub async fn pause(&self, job_type: Option<&str>) -> Result<()> {
        self.ensure_open()?;
        if let Some(job_type) = job_type {
            validate_job_type(job_type)?;
        }
        self.transport.pause(job_type).await
    }

    /// Undo a pause. Idempotent.
    pub async fn resume(&self, job_type: Option<&str>) -> Result<()> {
        self.ensure_open()?;
        if let Some(job_type) = job_type {
            validate_job_type(job_type)?;
        }
        self.transport.resume(job_type).await
    }

    /// Counts by status, optionally per type
    pub async fn stats(&self, job_type: Option<&str>) -> Result<QueueStats> {
        self.ensure_open()?;
        self.transport.stats(job_type).await
    }

    /// Job descriptors in a status, capped and ordered by enqueue time
    pub async fn jobs(&self, status: JobStatus, job_type: Option<&str>) -> Result<Vec<JobInfo>> {
        self.ensure_open()?;
        self.transport.jobs(status, job_type).await
    }

    /// Fetch a full job record
    pub async fn job(&self, id: JobId) -> Result<Option<Job>> {
        self.ensure_open()?;
        self.transport.job(id).await
    }

    /// Reset a failed job back to waiting with a clean slate
    pub async fn retry(&self, id: JobId) -> Result<()> {
        self.ensure_open()?;
        self.transport.retry(id).await
    }

    /// Remove a job in any non-active status
    pub async fn remove(&self, id: JobId) -> Result<()> {
        self.ensure_open()?;
        self.transport.remove(id).await
    }

    /// Delete terminal records older than the grace period (default 24h)
    pub async fn clean(&self, status: JobStatus, grace_ms: Option<u64>) -> Result<u64> {
        self.ensure_open()?;
        let grace = Duration::from_millis(grace_ms.unwrap_or(DEFAULT_CLEAN_GRACE_MS));
        self.transport.clean(status, grace).await
    }

    /// Current backend condition, including any transport fallback
    pub async fn health(&self) -> Health {
        let health = self.transport.health().await;
        match (&self.fallback_reason, health.status) {
            (Some(reason), HealthStatus::Healthy) => {
                Health::degraded(health.transport, reason.clone())
            }
            _ => health,
        }
    }

    /// Snapshot of this process's handler metrics
    pub fn metrics(&self) -> MetricsSummary {
        self.metrics.summary()
    }

    /// Pause intake, wait for in-flight handlers up to the configured budget,
    /// then release transport resources. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self
            .state
            .compare_exchange(STATE_OPEN, STATE_CLOSING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        info!("queue closing: name={}", self.config.queue_name);
        let result = self
            .transport
            .close(self.config.worker.graceful_shutdown_timeout())
            .await;
        self.state.store(STATE_CLOSED, Ordering::SeqCst);
        info!("queue closed: name={}", self.config.queue_name);
        result
    }

    /// Close the queue when the process receives ctrl-c.
    ///
    /// Installed at most once per instance, and only when the host asks:
    /// construction never touches process-wide signal handling.
    pub fn install_shutdown_hook(self: &Arc<Self>) {
        if self.hook_installed.swap(true, Ordering::SeqCst) {
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received, closing queue");
                let _ = queue.close().await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Mutex;

    fn memory_config() -> QueueConfig {
        // RUST_LOG=conveyor=debug surfaces the queue's tracing in test output
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();

        let mut config = QueueConfig::default();
        config.concurrency = 1;
        config
    }

    async fn wait_until<F, Fut>(predicate: F, timeout_ms: u64) -> bool
    where
        F: Fn() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if predicate().await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_immediate_success() {
        let queue = Queue::new(memory_config()).await.unwrap();
        queue
            .process_fn("email", |_| async { Ok(json!("ok")) })
            .await
            .unwrap();

        let id = queue
            .add("email", json!({"to": "a@b"}), JobOptions::new())
            .await
            .unwrap();

        assert!(
            wait_until(
                || async { queue.job(id).await.unwrap().unwrap().status == JobStatus::Completed },
                1_000,
            )
            .await
        );
        let stats = queue.stats(None).await.unwrap();
        assert_eq!(stats.completed, 1);

        // Round-trip law: the payload survives unchanged
        let job = queue.job(id).await.unwrap().unwrap();
        assert_eq!(job.data, json!({"to": "a@b"}));
        assert_eq!(job.result, Some(json!("ok")));

        let metrics = queue.metrics();
        assert_eq!(metrics.succeeded, 1);
        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_then_succeed() {
        let queue = Queue::new(memory_config()).await.unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        queue
            .process_fn("flaky", move |_| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) + 1 < 3 {
                        Err(HandlerError::new("transient"))
                    } else {
                        Ok(json!(null))
                    }
                }
            })
            .await
            .unwrap();

        let id = queue
            .add(
                "flaky",
                json!({}),
                JobOptions::new()
                    .with_max_attempts(5)
                    .with_backoff(crate::retry::BackoffKind::Fixed)
                    .with_retry_delay_ms(100),
            )
            .await
            .unwrap();

        assert!(
            wait_until(
                || async { queue.job(id).await.unwrap().unwrap().status == JobStatus::Completed },
                3_000,
            )
            .await
        );
        let job = queue.job(id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 3);
        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_terminal_failure_then_retry() {
        let queue = Queue::new(memory_config()).await.unwrap();
        queue
            .process_fn("doomed", |_| async { Err(HandlerError::new("nope")) })
            .await
            .unwrap();

        let id = queue
            .add(
                "doomed",
                json!({}),
                JobOptions::new()
                    .with_max_attempts(2)
                    .with_backoff(crate::retry::BackoffKind::Fixed)
                    .with_retry_delay_ms(50),
            )
            .await
            .unwrap();

        assert!(
            wait_until(
                || async { queue.job(id).await.unwrap().unwrap().status == JobStatus::Failed },
                3_000,
            )
            .await
        );
        let job = queue.job(id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        assert!(job.last_error.is_some());

        let failed = queue.jobs(JobStatus::Failed, None).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].last_error.is_some());

        // Hold dispatch so the reset state is observable
        queue.pause(Some("doomed")).await.unwrap();
        queue.retry(id).await.unwrap();
        let job = queue.job(id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 0);
        assert!(job.last_error.is_none());
        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_scheduled_job_progression() {
        let queue = Queue::new(memory_config()).await.unwrap();
        queue
            .process_fn("report", |_| async { Ok(json!("done")) })
            .await
            .unwrap();

        let id = queue.schedule("report", json!({}), 200).await.unwrap();
        assert_eq!(
            queue.job(id).await.unwrap().unwrap().status,
            JobStatus::Delayed
        );

        assert!(
            wait_until(
                || async { queue.job(id).await.unwrap().unwrap().status == JobStatus::Completed },
                3_000,
            )
            .await
        );
        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_priority_ordering() {
        let queue = Queue::new(memory_config()).await.unwrap();

        let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = order.clone();

        // Enqueue before any handler runs so both are waiting
        queue
            .add("render", json!({"name": "low"}), JobOptions::new())
            .await
            .unwrap();
        queue
            .add(
                "render",
                json!({"name": "high"}),
                JobOptions::new().with_priority(10),
            )
            .await
            .unwrap();

        queue
            .process_fn("render", move |data| {
                let seen = seen.clone();
                async move {
                    let name = data["name"].as_str().unwrap_or("?").to_owned();
                    seen.lock().await.push(name);
                    Ok(json!(null))
                }
            })
            .await
            .unwrap();

        assert!(
            wait_until(
                || async { queue.stats(None).await.unwrap().completed == 2 },
                3_000,
            )
            .await
        );
        assert_eq!(*order.lock().await, vec!["high", "low"]);
        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_graceful_shutdown() {
        let queue = Arc::new(Queue::new(memory_config()).await.unwrap());
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        queue
            .process_fn("slow", move |_| {
                let flag = flag.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(json!("finished"))
                }
            })
            .await
            .unwrap();

        queue.add("slow", json!({}), JobOptions::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        queue.close().await.unwrap();
        // The in-flight handler was allowed to finish before close returned
        assert!(finished.load(Ordering::SeqCst));

        let err = queue.add("slow", json!({}), JobOptions::new()).await.unwrap_err();
        assert!(matches!(err, QueueError::Closed));

        // Idempotent
        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_validation() {
        let queue = Queue::new(memory_config()).await.unwrap();

        assert!(matches!(
            queue.add("", json!({}), JobOptions::new()).await.unwrap_err(),
            QueueError::InvalidArgument(_)
        ));
        assert!(matches!(
            queue
                .add("bad type!", json!({}), JobOptions::new())
                .await
                .unwrap_err(),
            QueueError::InvalidArgument(_)
        ));
        assert!(matches!(
            queue
                .add("email", serde_json::Value::Null, JobOptions::new())
                .await
                .unwrap_err(),
            QueueError::InvalidArgument(_)
        ));

        // 100 characters is accepted, 101 is not
        let hundred = "a".repeat(100);
        assert!(queue.add(&hundred, json!({}), JobOptions::new()).await.is_ok());
        let overlong = "a".repeat(101);
        assert!(queue
            .add(&overlong, json!({}), JobOptions::new())
            .await
            .is_err());

        // Delay boundaries: zero is immediate, over one year is rejected
        assert!(queue.schedule("email", json!({}), 0).await.is_ok());
        let over_a_year = 366 * 24 * 60 * 60 * 1_000;
        assert!(matches!(
            queue.schedule("email", json!({}), over_a_year).await.unwrap_err(),
            QueueError::InvalidArgument(_)
        ));

        // Negative priority is allowed
        assert!(queue
            .add("email", json!({}), JobOptions::new().with_priority(-5))
            .await
            .is_ok());

        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_handler_rejected() {
        let queue = Queue::new(memory_config()).await.unwrap();
        queue
            .process_fn("email", |_| async { Ok(json!(null)) })
            .await
            .unwrap();
        let err = queue
            .process_fn("email", |_| async { Ok(json!(null)) })
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Conflict(_)));
        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_pause_resume_idempotence() {
        let queue = Queue::new(memory_config()).await.unwrap();
        queue.add("mail", json!({}), JobOptions::new()).await.unwrap();

        queue.pause(None).await.unwrap();
        queue.pause(None).await.unwrap();
        let paused_once = queue.stats(None).await.unwrap();

        queue.resume(None).await.unwrap();
        queue.resume(None).await.unwrap();
        let resumed = queue.stats(None).await.unwrap();

        assert_eq!(paused_once.paused, 1);
        assert_eq!(resumed.waiting, 1);
        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_fallback_to_memory() {
        let mut config = memory_config();
        config.transport = Some(TransportKind::Redis);
        // No redis.url configured: initialization fails and memory takes over
        let queue = Queue::new(config).await.unwrap();
        assert_eq!(queue.transport_kind(), TransportKind::Memory);

        let health = queue.health().await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert!(health.message.unwrap().contains("redis"));
        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_health_on_memory() {
        let queue = Queue::new(memory_config()).await.unwrap();
        let health = queue.health().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.transport, TransportKind::Memory);
        queue.close().await.unwrap();
    }
}
