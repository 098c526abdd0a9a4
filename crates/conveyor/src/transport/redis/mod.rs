//! Redis transport
//!
//! Distributed store over Redis data structures. Per job type: a `waiting`
//! sorted set scored by (priority desc, enqueue order), an `active` sorted set
//! scored by lease expiry, and bounded `completed`/`failed` lists. A single
//! `delayed` sorted set is scored by `available_at`. Every multi-key
//! transition runs as a Lua script so concurrent worker processes cannot
//! observe half-applied state; coordination between processes happens solely
//! through those scripts.
//!
//! Each process runs a tick loop (promote delayed → claim per type → recover
//! stalled) and a pub/sub listener that turns `notify:{type}` publications
//! into immediate wake-ups.

pub mod connection;

use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::job::{now_ms, Job, JobId, JobInfo, JobStatus};
use crate::retry::RetryPolicy;
use crate::transport::{
    finish_listing, run_handler, Health, JobHandler, QueueStats, Transport, TransportKind,
    MAX_JOBS_PAGE,
};
use async_trait::async_trait;
use connection::RedisPool;
use dashmap::DashMap;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::Script;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Jobs promoted from the delayed set per tick
const PROMOTE_BATCH: usize = 100;

/// Key names under the configured prefix
struct Keyspace {
    prefix: String,
}

impl Keyspace {
    fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn job(&self, id: JobId) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    fn job_prefix(&self) -> String {
        format!("{}:job:", self.prefix)
    }

    fn waiting(&self, job_type: &str) -> String {
        format!("{}:waiting:{}", self.prefix, job_type)
    }

    fn waiting_prefix(&self) -> String {
        format!("{}:waiting:", self.prefix)
    }

    fn active(&self, job_type: &str) -> String {
        format!("{}:active:{}", self.prefix, job_type)
    }

    fn delayed(&self) -> String {
        format!("{}:delayed", self.prefix)
    }

    fn completed(&self, job_type: &str) -> String {
        format!("{}:completed:{}", self.prefix, job_type)
    }

    fn failed(&self, job_type: &str) -> String {
        format!("{}:failed:{}", self.prefix, job_type)
    }

    fn paused(&self, job_type: Option<&str>) -> String {
        format!("{}:paused:{}", self.prefix, job_type.unwrap_or("*"))
    }

    fn notify(&self, job_type: &str) -> String {
        format!("{}:notify:{}", self.prefix, job_type)
    }

    fn notify_prefix(&self) -> String {
        format!("{}:notify:", self.prefix)
    }

    fn notify_pattern(&self) -> String {
        format!("{}:notify:*", self.prefix)
    }

    fn types(&self) -> String {
        format!("{}:types", self.prefix)
    }

    fn seq(&self) -> String {
        format!("{}:seq", self.prefix)
    }
}

/// Atomic transitions, loaded once
struct Scripts {
    enqueue: Script,
    claim: Script,
    complete: Script,
    retry_later: Script,
    fail: Script,
    promote: Script,
    recover: Script,
    retry: Script,
    remove: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            enqueue: Script::new(include_str!("lua/enqueue.lua")),
            claim: Script::new(include_str!("lua/claim.lua")),
            complete: Script::new(include_str!("lua/complete.lua")),
            retry_later: Script::new(include_str!("lua/retry_later.lua")),
            fail: Script::new(include_str!("lua/fail.lua")),
            promote: Script::new(include_str!("lua/promote.lua")),
            recover: Script::new(include_str!("lua/recover.lua")),
            retry: Script::new(include_str!("lua/retry.lua")),
            remove: Script::new(include_str!("lua/remove.lua")),
        }
    }
}

struct RedisInner {
    config: QueueConfig,
    pool: RedisPool,
    keys: Keyspace,
    scripts: Scripts,
    handlers: DashMap<String, Arc<dyn JobHandler>>,
    slots: Arc<Semaphore>,
    active: AtomicUsize,
    closed: AtomicBool,
    pubsub_ok: AtomicBool,
    wake: Notify,
    drained: Notify,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Redis-backed transport
pub struct RedisTransport {
    inner: Arc<RedisInner>,
}

impl RedisTransport {
    /// Connect to Redis and start the worker loops
    pub async fn connect(config: QueueConfig) -> Result<Self> {
        let pool = RedisPool::connect(config.redis.clone()).await?;
        let keys = Keyspace::new(config.redis.key_prefix.clone());
        let concurrency = config.concurrency;
        let worker_enabled = config.worker.enabled;

        let inner = Arc::new(RedisInner {
            config,
            pool,
            keys,
            scripts: Scripts::new(),
            handlers: DashMap::new(),
            slots: Arc::new(Semaphore::new(concurrency)),
            active: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            pubsub_ok: AtomicBool::new(false),
            wake: Notify::new(),
            drained: Notify::new(),
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        if worker_enabled {
            let worker = tokio::spawn(worker_loop(inner.clone()));
            let listener = tokio::spawn(pubsub_loop(inner.clone()));
            inner
                .tasks
                .lock()
                .expect("task list lock")
                .extend([worker, listener]);
        }

        info!(
            "redis transport started: prefix={}",
            inner.keys.prefix
        );
        Ok(Self { inner })
    }
}

/// Fetch and decode a job hash
async fn fetch_job(
    conn: &mut ConnectionManager,
    keys: &Keyspace,
    id: JobId,
) -> Result<Option<Job>> {
    let map: HashMap<String, String> = redis::cmd("HGETALL")
        .arg(keys.job(id))
        .query_async(conn)
        .await?;
    if map.is_empty() {
        return Ok(None);
    }
    Job::from_redis_map(&map).map(Some)
}

async fn is_paused(
    conn: &mut ConnectionManager,
    keys: &Keyspace,
    job_type: &str,
) -> Result<bool> {
    let flags: i64 = redis::cmd("EXISTS")
        .arg(keys.paused(None))
        .arg(keys.paused(Some(job_type)))
        .query_async(conn)
        .await?;
    Ok(flags > 0)
}

/// Periodic tick: promote delayed jobs, claim work, recover stalled leases
async fn worker_loop(inner: Arc<RedisInner>) {
    let tick = inner.config.redis.poll_interval();
    loop {
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        if let Err(e) = run_cycle(&inner).await {
            // Transient backend trouble; the next tick retries
            error!("redis worker cycle failed: {}", e);
        }
        tokio::select! {
            _ = tokio::time::sleep(tick) => {}
            _ = inner.wake.notified() => {}
        }
    }
    debug!("redis worker loop stopped");
}

async fn run_cycle(inner: &Arc<RedisInner>) -> Result<()> {
    let mut conn = inner.pool.get().await?;
    let now = now_ms();

    let promoted: i64 = inner
        .scripts
        .promote
        .key(inner.keys.delayed())
        .key(inner.keys.job_prefix())
        .key(inner.keys.waiting_prefix())
        .key(inner.keys.seq())
        .key(inner.keys.notify_prefix())
        .arg(now)
        .arg(PROMOTE_BATCH)
        .invoke_async(&mut conn)
        .await?;
    if promoted > 0 {
        debug!("promoted {} delayed jobs", promoted);
    }

    let types: Vec<String> = inner
        .handlers
        .iter()
        .map(|entry| entry.key().clone())
        .collect();

    for job_type in types {
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        // Pause gates new claims only; expired leases are still reclaimed
        recover_stalled(inner, &mut conn, &job_type).await?;
        if is_paused(&mut conn, &inner.keys, &job_type).await? {
            continue;
        }

        claim_ready(inner, &mut conn, &job_type).await?;
    }

    Ok(())
}

/// Claim jobs for one type while worker slots are free
async fn claim_ready(
    inner: &Arc<RedisInner>,
    conn: &mut ConnectionManager,
    job_type: &str,
) -> Result<()> {
    loop {
        let Ok(permit) = Arc::clone(&inner.slots).try_acquire_owned() else {
            return Ok(());
        };
        let now = now_ms();
        let lease = now + inner.config.worker.stalled_interval_ms as i64;

        let claimed: Option<String> = inner
            .scripts
            .claim
            .key(inner.keys.waiting(job_type))
            .key(inner.keys.active(job_type))
            .key(inner.keys.job_prefix())
            .arg(now)
            .arg(lease)
            .invoke_async(conn)
            .await?;

        let Some(raw_id) = claimed else {
            return Ok(());
        };
        let id: JobId = raw_id
            .parse()
            .map_err(|_| QueueError::backend(format!("queue holds malformed job id {}", raw_id)))?;
        let Some(job) = fetch_job(conn, &inner.keys, id).await? else {
            warn!("claimed job without a record: id={}", id);
            continue;
        };
        let Some(handler) = inner.handlers.get(job_type).map(|h| Arc::clone(h.value())) else {
            return Ok(());
        };

        debug!("claimed job: id={}, type={}", id, job_type);
        inner.active.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(execute_job(inner.clone(), permit, job, handler));
    }
}

/// Run one attempt and persist the outcome
async fn execute_job(
    inner: Arc<RedisInner>,
    permit: OwnedSemaphorePermit,
    job: Job,
    handler: Arc<dyn JobHandler>,
) {
    let outcome = run_handler(handler, job.data.clone()).await;
    let now = now_ms();

    let result = match outcome {
        Ok(result) => run_complete_script(&inner, &job, now, &result).await,
        Err(error) if job.attempts >= job.max_attempts => {
            warn!(
                "job exhausted attempts: id={}, attempts={}, error={}",
                job.id, job.attempts, error.message
            );
            run_fail_script(&inner, &job, now, &error.message).await
        }
        Err(error) => {
            let policy = RetryPolicy::new(job.backoff, Duration::from_millis(job.retry_delay_ms));
            let available_at = now + policy.delay_for(job.attempts).as_millis() as i64;
            run_retry_later_script(&inner, &job, now, available_at, &error.message).await
        }
    };

    if let Err(e) = result {
        // The lease stays in place; stalled recovery will requeue the job
        error!("failed to persist job outcome: id={}, {}", job.id, e);
    }

    finish_attempt(&inner, permit);
}

fn finish_attempt(inner: &Arc<RedisInner>, permit: OwnedSemaphorePermit) {
    drop(permit);
    inner.active.fetch_sub(1, Ordering::SeqCst);
    // notify_one stores a permit, so a close() that races this decrement
    // still observes the wake-up
    inner.drained.notify_one();
    inner.wake.notify_one();
}

async fn run_complete_script(
    inner: &Arc<RedisInner>,
    job: &Job,
    now: i64,
    result: &serde_json::Value,
) -> std::result::Result<i64, redis::RedisError> {
    let mut conn = match inner.pool.get().await {
        Ok(conn) => conn,
        Err(e) => {
            error!("job finished but redis is unreachable: id={}, {}", job.id, e);
            return Ok(0);
        }
    };
    inner
        .scripts
        .complete
        .key(inner.keys.active(&job.job_type))
        .key(inner.keys.job(job.id))
        .key(inner.keys.completed(&job.job_type))
        .key(inner.keys.job_prefix())
        .arg(job.id.to_string())
        .arg(now)
        .arg(result.to_string())
        .arg(job.remove_on_complete)
        .invoke_async(&mut conn)
        .await
}

async fn run_fail_script(
    inner: &Arc<RedisInner>,
    job: &Job,
    now: i64,
    message: &str,
) -> std::result::Result<i64, redis::RedisError> {
    let mut conn = match inner.pool.get().await {
        Ok(conn) => conn,
        Err(e) => {
            error!("job failed but redis is unreachable: id={}, {}", job.id, e);
            return Ok(0);
        }
    };
    inner
        .scripts
        .fail
        .key(inner.keys.active(&job.job_type))
        .key(inner.keys.job(job.id))
        .key(inner.keys.failed(&job.job_type))
        .key(inner.keys.job_prefix())
        .arg(job.id.to_string())
        .arg(now)
        .arg(message)
        .arg(job.remove_on_fail)
        .invoke_async(&mut conn)
        .await
}

async fn run_retry_later_script(
    inner: &Arc<RedisInner>,
    job: &Job,
    now: i64,
    available_at: i64,
    message: &str,
) -> std::result::Result<i64, redis::RedisError> {
    let mut conn = match inner.pool.get().await {
        Ok(conn) => conn,
        Err(e) => {
            error!("job failed but redis is unreachable: id={}, {}", job.id, e);
            return Ok(0);
        }
    };
    inner
        .scripts
        .retry_later
        .key(inner.keys.active(&job.job_type))
        .key(inner.keys.job(job.id))
        .key(inner.keys.delayed())
        .key(inner.keys.waiting(&job.job_type))
        .key(inner.keys.seq())
        .key(inner.keys.notify(&job.job_type))
        .arg(job.id.to_string())
        .arg(now)
        .arg(message)
        .arg(available_at)
        .invoke_async(&mut conn)
        .await
}

/// Scan expired leases for one type
async fn recover_stalled(
    inner: &Arc<RedisInner>,
    conn: &mut ConnectionManager,
    job_type: &str,
) -> Result<()> {
    let counts: Vec<i64> = inner
        .scripts
        .recover
        .key(inner.keys.active(job_type))
        .key(inner.keys.job_prefix())
        .key(inner.keys.waiting(job_type))
        .key(inner.keys.failed(job_type))
        .key(inner.keys.seq())
        .arg(now_ms())
        .arg(inner.config.worker.max_stalled_count)
        .arg(inner.config.remove_on_fail)
        .invoke_async(conn)
        .await?;
    if let [requeued, failed] = counts[..] {
        if requeued > 0 || failed > 0 {
            warn!(
                "stalled recovery: type={}, requeued={}, failed={}",
                job_type, requeued, failed
            );
        }
    }
    Ok(())
}

/// Turn notify publications into wake-ups; reconnect with backoff on loss
async fn pubsub_loop(inner: Arc<RedisInner>) {
    let pattern = inner.keys.notify_pattern();
    loop {
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        match inner.pool.client().get_async_pubsub().await {
            Ok(mut pubsub) => match pubsub.psubscribe(&pattern).await {
                Ok(()) => {
                    inner.pubsub_ok.store(true, Ordering::SeqCst);
                    debug!("pub/sub subscribed: pattern={}", pattern);
                    let mut stream = pubsub.on_message();
                    while let Some(_message) = stream.next().await {
                        if inner.closed.load(Ordering::SeqCst) {
                            break;
                        }
                        inner.wake.notify_one();
                    }
                }
                Err(e) => warn!("pub/sub subscribe failed: {}", e),
            },
            Err(e) => warn!("pub/sub connection failed: {}", e),
        }
        inner.pubsub_ok.store(false, Ordering::SeqCst);
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(inner.config.redis.retry_delay()).await;
    }
}

impl RedisInner {
    /// Types to report on: the filter, or every type ever enqueued
    async fn known_types(
        &self,
        conn: &mut ConnectionManager,
        job_type: Option<&str>,
    ) -> Result<Vec<String>> {
        match job_type {
            Some(job_type) => Ok(vec![job_type.to_owned()]),
            None => Ok(redis::cmd("SMEMBERS")
                .arg(self.keys.types())
                .query_async(conn)
                .await?),
        }
    }

    async fn listed_infos(
        &self,
        conn: &mut ConnectionManager,
        ids: Vec<String>,
        override_status: Option<JobStatus>,
    ) -> Result<Vec<JobInfo>> {
        let mut infos = Vec::with_capacity(ids.len());
        for raw_id in ids {
            let Ok(id) = raw_id.parse::<JobId>() else {
                continue;
            };
            if let Some(job) = fetch_job(conn, &self.keys, id).await? {
                let mut info = job.info();
                if let Some(status) = override_status {
                    info.status = status;
                }
                infos.push(info);
            }
        }
        Ok(infos)
    }
}

#[async_trait]
impl Transport for RedisTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Redis
    }

    async fn add(&self, job: Job) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        let mut conn = self.inner.pool.get().await?;

        let delayed = job.status == JobStatus::Delayed;
        let destination = if delayed {
            self.inner.keys.delayed()
        } else {
            self.inner.keys.waiting(&job.job_type)
        };

        let mut invocation = self.inner.scripts.enqueue.prepare_invoke();
        invocation
            .key(self.inner.keys.job(job.id))
            .key(destination)
            .key(self.inner.keys.types())
            .key(self.inner.keys.seq())
            .key(self.inner.keys.notify(&job.job_type))
            .arg(if delayed { "delayed" } else { "waiting" })
            .arg(job.id.to_string())
            .arg(job.priority)
            .arg(job.available_at);
        for (field, value) in job.to_redis_fields() {
            invocation.arg(field).arg(value);
        }

        let written: redis::RedisResult<i64> = invocation.invoke_async(&mut conn).await;
        written.map_err(|e| QueueError::backend(format!("failed to add job: {}", e)))?;
        Ok(())
    }

    async fn process(&self, job_type: &str, handler: Arc<dyn JobHandler>) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        if self.inner.handlers.contains_key(job_type) {
            return Err(QueueError::conflict(format!(
                "a handler is already registered for type {}",
                job_type
            )));
        }
        self.inner.handlers.insert(job_type.to_owned(), handler);
        info!("registered handler: type={}", job_type);
        self.inner.wake.notify_one();
        Ok(())
    }

    async fn pause(&self, job_type: Option<&str>) -> Result<()> {
        let mut conn = self.inner.pool.get().await?;
        let _: () = redis::cmd("SET")
            .arg(self.inner.keys.paused(job_type))
            .arg(1)
            .query_async(&mut conn)
            .await?;
        info!("paused: scope={}", job_type.unwrap_or("*"));
        Ok(())
    }

    async fn resume(&self, job_type: Option<&str>) -> Result<()> {
        let mut conn = self.inner.pool.get().await?;
        let _: i64 = redis::cmd("DEL")
            .arg(self.inner.keys.paused(job_type))
            .query_async(&mut conn)
            .await?;
        info!("resumed: scope={}", job_type.unwrap_or("*"));
        self.inner.wake.notify_one();
        Ok(())
    }

    async fn stats(&self, job_type: Option<&str>) -> Result<QueueStats> {
        let mut conn = self.inner.pool.get().await?;
        let types = self.inner.known_types(&mut conn, job_type).await?;
        let mut stats = QueueStats::default();

        for listed_type in &types {
            let waiting: u64 = redis::cmd("ZCARD")
                .arg(self.inner.keys.waiting(listed_type))
                .query_async(&mut conn)
                .await?;
            let active: u64 = redis::cmd("ZCARD")
                .arg(self.inner.keys.active(listed_type))
                .query_async(&mut conn)
                .await?;
            let completed: u64 = redis::cmd("LLEN")
                .arg(self.inner.keys.completed(listed_type))
                .query_async(&mut conn)
                .await?;
            let failed: u64 = redis::cmd("LLEN")
                .arg(self.inner.keys.failed(listed_type))
                .query_async(&mut conn)
                .await?;

            if is_paused(&mut conn, &self.inner.keys, listed_type).await? {
                stats.paused += waiting;
            } else {
                stats.waiting += waiting;
            }
            stats.active += active;
            stats.completed += completed;
            stats.failed += failed;
        }

        match job_type {
            None => {
                stats.delayed = redis::cmd("ZCARD")
                    .arg(self.inner.keys.delayed())
                    .query_async(&mut conn)
                    .await?;
            }
            Some(job_type) => {
                // No per-type delayed index; scan a bounded window
                let ids: Vec<String> = redis::cmd("ZRANGE")
                    .arg(self.inner.keys.delayed())
                    .arg(0)
                    .arg((MAX_JOBS_PAGE - 1) as i64)
                    .query_async(&mut conn)
                    .await?;
                for raw_id in ids {
                    if let Ok(id) = raw_id.parse::<JobId>() {
                        let listed: Option<String> = redis::cmd("HGET")
                            .arg(self.inner.keys.job(id))
                            .arg("job_type")
                            .query_async(&mut conn)
                            .await?;
                        if listed.as_deref() == Some(job_type) {
                            stats.delayed += 1;
                        }
                    }
                }
            }
        }

        Ok(stats)
    }

    async fn jobs(&self, status: JobStatus, job_type: Option<&str>) -> Result<Vec<JobInfo>> {
        let mut conn = self.inner.pool.get().await?;
        let types = self.inner.known_types(&mut conn, job_type).await?;
        let mut infos = Vec::new();

        match status {
            JobStatus::Waiting | JobStatus::Paused => {
                for listed_type in &types {
                    let paused = is_paused(&mut conn, &self.inner.keys, listed_type).await?;
                    if (status == JobStatus::Paused) != paused {
                        continue;
                    }
                    let ids: Vec<String> = redis::cmd("ZRANGE")
                        .arg(self.inner.keys.waiting(listed_type))
                        .arg(0)
                        .arg((MAX_JOBS_PAGE - 1) as i64)
                        .query_async(&mut conn)
                        .await?;
                    let override_status = paused.then_some(JobStatus::Paused);
                    infos.extend(
                        self.inner
                            .listed_infos(&mut conn, ids, override_status)
                            .await?,
                    );
                }
            }
            JobStatus::Active => {
                for listed_type in &types {
                    let ids: Vec<String> = redis::cmd("ZRANGE")
                        .arg(self.inner.keys.active(listed_type))
                        .arg(0)
                        .arg((MAX_JOBS_PAGE - 1) as i64)
                        .query_async(&mut conn)
                        .await?;
                    infos.extend(self.inner.listed_infos(&mut conn, ids, None).await?);
                }
            }
            JobStatus::Delayed => {
                let ids: Vec<String> = redis::cmd("ZRANGE")
                    .arg(self.inner.keys.delayed())
                    .arg(0)
                    .arg((MAX_JOBS_PAGE - 1) as i64)
                    .query_async(&mut conn)
                    .await?;
                let all = self.inner.listed_infos(&mut conn, ids, None).await?;
                infos.extend(all.into_iter().filter(|info| {
                    job_type.map(|t| info.job_type == t).unwrap_or(true)
                }));
            }
            JobStatus::Completed | JobStatus::Failed => {
                for listed_type in &types {
                    let key = if status == JobStatus::Completed {
                        self.inner.keys.completed(listed_type)
                    } else {
                        self.inner.keys.failed(listed_type)
                    };
                    let ids: Vec<String> = redis::cmd("LRANGE")
                        .arg(key)
                        .arg(0)
                        .arg((MAX_JOBS_PAGE - 1) as i64)
                        .query_async(&mut conn)
                        .await?;
                    infos.extend(self.inner.listed_infos(&mut conn, ids, None).await?);
                }
            }
        }

        Ok(finish_listing(infos))
    }

    async fn job(&self, id: JobId) -> Result<Option<Job>> {
        let mut conn = self.inner.pool.get().await?;
        fetch_job(&mut conn, &self.inner.keys, id).await
    }

    async fn retry(&self, id: JobId) -> Result<()> {
        let mut conn = self.inner.pool.get().await?;
        let job = fetch_job(&mut conn, &self.inner.keys, id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

        let code: i64 = self
            .inner
            .scripts
            .retry
            .key(self.inner.keys.job(id))
            .key(self.inner.keys.failed(&job.job_type))
            .key(self.inner.keys.waiting(&job.job_type))
            .key(self.inner.keys.seq())
            .key(self.inner.keys.notify(&job.job_type))
            .arg(id.to_string())
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await?;

        match code {
            1 => Ok(()),
            -1 => Err(QueueError::NotFound(id.to_string())),
            _ => Err(QueueError::conflict(format!(
                "job {} is {}, only failed jobs can be retried",
                id, job.status
            ))),
        }
    }

    async fn remove(&self, id: JobId) -> Result<()> {
        let mut conn = self.inner.pool.get().await?;
        let job = fetch_job(&mut conn, &self.inner.keys, id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

        let code: i64 = self
            .inner
            .scripts
            .remove
            .key(self.inner.keys.job(id))
            .key(self.inner.keys.waiting(&job.job_type))
            .key(self.inner.keys.delayed())
            .key(self.inner.keys.completed(&job.job_type))
            .key(self.inner.keys.failed(&job.job_type))
            .arg(id.to_string())
            .invoke_async(&mut conn)
            .await?;

        match code {
            1 => Ok(()),
            -1 => Err(QueueError::NotFound(id.to_string())),
            _ => Err(QueueError::conflict(format!(
                "job {} is active and cannot be removed",
                id
            ))),
        }
    }

    async fn clean(&self, status: JobStatus, grace: Duration) -> Result<u64> {
        if !status.is_terminal() {
            return Err(QueueError::invalid(format!(
                "clean only accepts completed or failed, got {}",
                status
            )));
        }
        let mut conn = self.inner.pool.get().await?;
        let cutoff = now_ms() - grace.as_millis() as i64;
        let types = self.inner.known_types(&mut conn, None).await?;
        let timestamp_field = if status == JobStatus::Completed {
            "completed_at"
        } else {
            "failed_at"
        };
        let mut removed = 0u64;

        for listed_type in &types {
            let key = if status == JobStatus::Completed {
                self.inner.keys.completed(listed_type)
            } else {
                self.inner.keys.failed(listed_type)
            };
            let ids: Vec<String> = redis::cmd("LRANGE")
                .arg(&key)
                .arg(0)
                .arg(-1)
                .query_async(&mut conn)
                .await?;
            for raw_id in ids {
                let Ok(id) = raw_id.parse::<JobId>() else {
                    continue;
                };
                let terminal_at: Option<i64> = redis::cmd("HGET")
                    .arg(self.inner.keys.job(id))
                    .arg(timestamp_field)
                    .query_async(&mut conn)
                    .await?;
                if terminal_at.map(|at| at < cutoff).unwrap_or(false) {
                    let _: i64 = redis::cmd("LREM")
                        .arg(&key)
                        .arg(0)
                        .arg(&raw_id)
                        .query_async(&mut conn)
                        .await?;
                    let _: i64 = redis::cmd("DEL")
                        .arg(self.inner.keys.job(id))
                        .query_async(&mut conn)
                        .await?;
                    removed += 1;
                }
            }
        }

        Ok(removed)
    }

    async fn health(&self) -> Health {
        if !self.inner.pool.health_check().await {
            return Health::unhealthy(TransportKind::Redis, "redis unreachable");
        }
        if self.inner.config.worker.enabled && !self.inner.pubsub_ok.load(Ordering::SeqCst) {
            return Health::degraded(
                TransportKind::Redis,
                "pub/sub unavailable; falling back to polling",
            );
        }
        Health::healthy(TransportKind::Redis)
    }

    async fn close(&self, timeout: Duration) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("redis transport closing");
        self.inner.wake.notify_waiters();

        let deadline = tokio::time::Instant::now() + timeout;
        while self.inner.active.load(Ordering::SeqCst) > 0 {
            let drained = self.inner.drained.notified();
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                warn!(
                    "graceful shutdown timed out with {} active jobs; leases will expire",
                    self.inner.active.load(Ordering::SeqCst)
                );
                break;
            }
        }

        for task in self.inner.tasks.lock().expect("task list lock").drain(..) {
            task.abort();
        }
        self.inner.pool.close().await;
        info!("redis transport closed");
        Ok(())
    }
}
