//! SQL transport
//!
//! One `jobs` table serves PostgreSQL, MySQL and SQLite through `sqlx::Any`.
//! Workers claim batches inside a transaction using `FOR UPDATE SKIP LOCKED`
//! where the engine supports it, so concurrent processes never double-claim.
//! The table stores only the four persisted statuses; a delayed job is a
//! waiting row whose `available_at` is in the future, and pause is a
//! process-local dispatch gate.
//!
//! Timestamps are Unix milliseconds in BIGINT columns and update success is
//! always judged by affected-row counts.

use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::job::{now_ms, Job, JobId, JobInfo, JobStatus};
use crate::retry::{BackoffKind, RetryPolicy};
use crate::transport::{
    finish_listing, run_handler, Health, JobHandler, QueueStats, Transport, TransportKind,
    MAX_JOBS_PAGE,
};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

static DRIVERS: Once = Once::new();

/// SQL engine behind the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Engine {
    Postgres,
    MySql,
    Sqlite,
}

impl Engine {
    fn from_url(raw: &str) -> Result<Self> {
        let parsed = url::Url::parse(raw)
            .map_err(|e| QueueError::invalid(format!("database.url is not a valid URL: {}", e)))?;
        match parsed.scheme() {
            "postgres" | "postgresql" => Ok(Engine::Postgres),
            "mysql" => Ok(Engine::MySql),
            "sqlite" => Ok(Engine::Sqlite),
            other => Err(QueueError::invalid(format!(
                "unsupported database scheme: {}",
                other
            ))),
        }
    }

    fn supports_skip_locked(&self) -> bool {
        matches!(self, Engine::Postgres | Engine::MySql)
    }
}

/// Generates `$N` or `?` placeholders in bind order
struct Binder {
    engine: Engine,
    n: usize,
}

impl Binder {
    fn new(engine: Engine) -> Self {
        Self { engine, n: 0 }
    }

    fn next(&mut self) -> String {
        self.n += 1;
        match self.engine {
            Engine::Postgres => format!("${}", self.n),
            Engine::MySql | Engine::Sqlite => "?".to_string(),
        }
    }
}

/// Per-job options persisted in the `options` JSON column
#[derive(Debug, Serialize, Deserialize)]
struct StoredOptions {
    backoff: BackoffKind,
    retry_delay_ms: u64,
    delay_ms: u64,
    remove_on_complete: u32,
    remove_on_fail: u32,
}

struct DbInner {
    config: QueueConfig,
    pool: AnyPool,
    engine: Engine,
    table: String,
    queue_name: String,
    handlers: DashMap<String, Arc<dyn JobHandler>>,
    paused_types: std::sync::Mutex<HashSet<String>>,
    paused_all: AtomicBool,
    slots: Arc<Semaphore>,
    active: AtomicUsize,
    closed: AtomicBool,
    wake: Notify,
    drained: Notify,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// SQL-backed transport
pub struct DatabaseTransport {
    inner: Arc<DbInner>,
}

impl DatabaseTransport {
    /// Connect to the database, create the schema and start the poller
    pub async fn connect(config: QueueConfig) -> Result<Self> {
        DRIVERS.call_once(sqlx::any::install_default_drivers);

        let url = config.database.url.clone().ok_or_else(|| {
            QueueError::invalid("database.url is required for the database transport")
        })?;
        let engine = Engine::from_url(&url)?;
        let pool = AnyPoolOptions::new()
            .max_connections(config.database.max_connections)
            .connect(&url)
            .await?;

        info!("database transport connecting: engine={:?}", engine);

        let concurrency = config.concurrency;
        let worker_enabled = config.worker.enabled;
        let inner = Arc::new(DbInner {
            table: config.database.table_name.clone(),
            queue_name: config.queue_name.clone(),
            config,
            pool,
            engine,
            handlers: DashMap::new(),
            paused_types: std::sync::Mutex::new(HashSet::new()),
            paused_all: AtomicBool::new(false),
            slots: Arc::new(Semaphore::new(concurrency)),
            active: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            wake: Notify::new(),
            drained: Notify::new(),
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        inner.ensure_schema().await?;

        if worker_enabled {
            let poller = tokio::spawn(poller_loop(inner.clone()));
            inner.tasks.lock().expect("task list lock").push(poller);
        }

        info!("database transport started: table={}", inner.table);
        Ok(Self { inner })
    }
}

/// Periodic tick: claim work per type, then recover expired leases
async fn poller_loop(inner: Arc<DbInner>) {
    let tick = inner.config.database.poll_interval();
    loop {
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        if let Err(e) = run_cycle(&inner).await {
            // Transient pool trouble; the next tick retries
            error!("database worker cycle failed: {}", e);
        }
        tokio::select! {
            _ = tokio::time::sleep(tick) => {}
            _ = inner.wake.notified() => {}
        }
    }
    debug!("database poller stopped");
}

async fn run_cycle(inner: &Arc<DbInner>) -> Result<()> {
    let types: Vec<String> = inner
        .handlers
        .iter()
        .map(|entry| entry.key().clone())
        .collect();

    for job_type in types {
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        if inner.is_paused(&job_type) {
            continue;
        }

        let mut permits = Vec::new();
        for _ in 0..inner.config.database.batch_size {
            match Arc::clone(&inner.slots).try_acquire_owned() {
                Ok(permit) => permits.push(permit),
                Err(_) => break,
            }
        }
        if permits.is_empty() {
            continue;
        }

        let jobs = inner.claim_batch(&job_type, permits.len()).await?;
        for job in jobs {
            let permit = permits.pop().expect("permit per claimed job");
            let Some(handler) = inner.handlers.get(&job_type).map(|h| Arc::clone(h.value()))
            else {
                break;
            };
            debug!("claimed job: id={}, type={}", job.id, job_type);
            inner.active.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(execute_job(inner.clone(), permit, job, handler));
        }
    }

    inner.recover_stalled().await?;
    Ok(())
}

/// Run one attempt and persist the outcome
async fn execute_job(
    inner: Arc<DbInner>,
    permit: OwnedSemaphorePermit,
    job: Job,
    handler: Arc<dyn JobHandler>,
) {
    let outcome = run_handler(handler, job.data.clone()).await;
    let now = now_ms();

    let applied = match outcome {
        Ok(result) => inner.complete_job(&job, now, &result).await,
        Err(error) if job.attempts >= job.max_attempts => {
            warn!(
                "job exhausted attempts: id={}, attempts={}, error={}",
                job.id, job.attempts, error.message
            );
            inner.fail_job(&job, now, &error.message).await
        }
        Err(error) => {
            let policy = RetryPolicy::new(job.backoff, Duration::from_millis(job.retry_delay_ms));
            let available_at = now + policy.delay_for(job.attempts).as_millis() as i64;
            inner
                .retry_job_later(&job, now, available_at, &error.message)
                .await
        }
    };

    if let Err(e) = applied {
        // The row stays active; stalled recovery will reclaim it
        error!("failed to persist job outcome: id={}, {}", job.id, e);
    }

    drop(permit);
    inner.active.fetch_sub(1, Ordering::SeqCst);
    // notify_one stores a permit, so a close() that races this decrement
    // still observes the wake-up
    inner.drained.notify_one();
    inner.wake.notify_one();
}

fn row_to_job(row: &AnyRow) -> Result<Job> {
    let raw_id: String = row.try_get("id")?;
    let id: JobId = raw_id
        .parse()
        .map_err(|_| QueueError::backend(format!("jobs table holds malformed id {}", raw_id)))?;
    let data: serde_json::Value = serde_json::from_str(&row.try_get::<String, _>("data")?)?;
    let options: StoredOptions = serde_json::from_str(&row.try_get::<String, _>("options")?)?;
    let status: JobStatus = row.try_get::<String, _>("status")?.parse()?;
    let available_at: i64 = row.try_get("available_at")?;
    let result: Option<serde_json::Value> = match row.try_get::<Option<String>, _>("result")? {
        Some(raw) => Some(serde_json::from_str(&raw)?),
        None => None,
    };

    // Delayed is derived, not stored
    let status = if status == JobStatus::Waiting && available_at > now_ms() {
        JobStatus::Delayed
    } else {
        status
    };

    Ok(Job {
        id,
        job_type: row.try_get("job_type")?,
        data,
        status,
        priority: row.try_get::<i64, _>("priority")? as i32,
        attempts: row.try_get::<i64, _>("attempts")? as u32,
        max_attempts: row.try_get::<i64, _>("max_attempts")? as u32,
        backoff: options.backoff,
        retry_delay_ms: options.retry_delay_ms,
        delay_ms: options.delay_ms,
        available_at,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        failed_at: row.try_get("failed_at")?,
        last_error: row.try_get("last_error")?,
        result,
        remove_on_complete: options.remove_on_complete,
        remove_on_fail: options.remove_on_fail,
        stalled_count: row.try_get::<i64, _>("stalled_count")? as u32,
    })
}

impl DbInner {
    fn is_paused(&self, job_type: &str) -> bool {
        self.paused_all.load(Ordering::SeqCst)
            || self
                .paused_types
                .lock()
                .expect("paused set lock")
                .contains(job_type)
    }

    async fn ensure_schema(&self) -> Result<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id VARCHAR(36) PRIMARY KEY,
                queue VARCHAR(255) NOT NULL,
                job_type VARCHAR(100) NOT NULL,
                data TEXT NOT NULL,
                options TEXT NOT NULL,
                status VARCHAR(16) NOT NULL,
                priority BIGINT NOT NULL,
                attempts BIGINT NOT NULL,
                max_attempts BIGINT NOT NULL,
                stalled_count BIGINT NOT NULL,
                last_error TEXT,
                result TEXT,
                created_at BIGINT NOT NULL,
                available_at BIGINT NOT NULL,
                started_at BIGINT,
                completed_at BIGINT,
                failed_at BIGINT
            )",
            table = self.table
        );
        sqlx::query(&ddl).execute(&self.pool).await?;

        // MySQL has no CREATE INDEX IF NOT EXISTS; a duplicate is harmless
        let index = format!(
            "CREATE INDEX idx_{table}_claim ON {table} (queue, status, available_at)",
            table = self.table
        );
        if let Err(e) = sqlx::query(&index).execute(&self.pool).await {
            debug!("claim index not created (likely exists): {}", e);
        }
        Ok(())
    }

    /// Claim up to `limit` due rows for one type
    async fn claim_batch(&self, job_type: &str, limit: usize) -> Result<Vec<Job>> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;

        let lock_clause = if self.engine.supports_skip_locked() {
            " FOR UPDATE SKIP LOCKED"
        } else {
            ""
        };
        let mut binder = Binder::new(self.engine);
        let select = format!(
            "SELECT id FROM {table} WHERE queue = {q} AND job_type = {t} AND status = 'waiting' \
             AND available_at <= {a} ORDER BY priority DESC, created_at ASC, id ASC \
             LIMIT {limit}{lock}",
            table = self.table,
            q = binder.next(),
            t = binder.next(),
            a = binder.next(),
            limit = limit,
            lock = lock_clause,
        );
        let rows = sqlx::query(&select)
            .bind(&self.queue_name)
            .bind(job_type)
            .bind(now)
            .fetch_all(&mut *tx)
            .await?;
        let ids: Vec<String> = rows
            .iter()
            .map(|row| row.try_get::<String, _>("id"))
            .collect::<std::result::Result<_, _>>()?;
        if ids.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let mut binder = Binder::new(self.engine);
        let started_at = binder.next();
        let id_list: Vec<String> = ids.iter().map(|_| binder.next()).collect();
        let update = format!(
            "UPDATE {table} SET status = 'active', started_at = {started_at}, \
             attempts = attempts + 1 WHERE id IN ({ids})",
            table = self.table,
            started_at = started_at,
            ids = id_list.join(", "),
        );
        let mut query = sqlx::query(&update).bind(now);
        for id in &ids {
            query = query.bind(id);
        }
        let updated = query.execute(&mut *tx).await?;
        if updated.rows_affected() != ids.len() as u64 {
            warn!(
                "claim updated {} of {} rows",
                updated.rows_affected(),
                ids.len()
            );
        }

        let mut binder = Binder::new(self.engine);
        let id_list: Vec<String> = ids.iter().map(|_| binder.next()).collect();
        let fetch = format!(
            "SELECT * FROM {table} WHERE id IN ({ids})",
            table = self.table,
            ids = id_list.join(", "),
        );
        let mut query = sqlx::query(&fetch);
        for id in &ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&mut *tx).await?;
        tx.commit().await?;

        rows.iter().map(row_to_job).collect()
    }

    async fn complete_job(&self, job: &Job, now: i64, result: &serde_json::Value) -> Result<()> {
        let mut binder = Binder::new(self.engine);
        let sql = format!(
            "UPDATE {table} SET status = 'completed', completed_at = {c}, result = {r} \
             WHERE id = {i} AND status = 'active'",
            table = self.table,
            c = binder.next(),
            r = binder.next(),
            i = binder.next(),
        );
        let updated = sqlx::query(&sql)
            .bind(now)
            .bind(result.to_string())
            .bind(job.id.to_string())
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() == 0 {
            warn!("completion lost a race: id={}", job.id);
            return Ok(());
        }
        self.prune(&job.job_type, JobStatus::Completed, job.remove_on_complete)
            .await
    }

    async fn fail_job(&self, job: &Job, now: i64, message: &str) -> Result<()> {
        let mut binder = Binder::new(self.engine);
        let sql = format!(
            "UPDATE {table} SET status = 'failed', failed_at = {f}, last_error = {e} \
             WHERE id = {i} AND status = 'active'",
            table = self.table,
            f = binder.next(),
            e = binder.next(),
            i = binder.next(),
        );
        let updated = sqlx::query(&sql)
            .bind(now)
            .bind(message)
            .bind(job.id.to_string())
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() == 0 {
            warn!("failure update lost a race: id={}", job.id);
            return Ok(());
        }
        self.prune(&job.job_type, JobStatus::Failed, job.remove_on_fail)
            .await
    }

    async fn retry_job_later(
        &self,
        job: &Job,
        _now: i64,
        available_at: i64,
        message: &str,
    ) -> Result<()> {
        let mut binder = Binder::new(self.engine);
        let sql = format!(
            "UPDATE {table} SET status = 'waiting', available_at = {a}, last_error = {e} \
             WHERE id = {i} AND status = 'active'",
            table = self.table,
            a = binder.next(),
            e = binder.next(),
            i = binder.next(),
        );
        let updated = sqlx::query(&sql)
            .bind(available_at)
            .bind(message)
            .bind(job.id.to_string())
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() == 0 {
            warn!("retry update lost a race: id={}", job.id);
        }
        Ok(())
    }

    /// Delete terminal rows beyond the newest `bound` for a type
    async fn prune(&self, job_type: &str, status: JobStatus, bound: u32) -> Result<()> {
        let timestamp = match status {
            JobStatus::Completed => "completed_at",
            _ => "failed_at",
        };
        let mut binder = Binder::new(self.engine);
        let outer_q = binder.next();
        let outer_t = binder.next();
        let inner_q = binder.next();
        let inner_t = binder.next();
        let sql = format!(
            "DELETE FROM {table} WHERE queue = {oq} AND job_type = {ot} AND status = '{status}' \
             AND id NOT IN (SELECT id FROM (SELECT id FROM {table} WHERE queue = {iq} \
             AND job_type = {it} AND status = '{status}' ORDER BY {ts} DESC, id DESC \
             LIMIT {bound}) AS keep)",
            table = self.table,
            oq = outer_q,
            ot = outer_t,
            iq = inner_q,
            it = inner_t,
            status = status.as_str(),
            ts = timestamp,
            bound = bound,
        );
        sqlx::query(&sql)
            .bind(&self.queue_name)
            .bind(job_type)
            .bind(&self.queue_name)
            .bind(job_type)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Count waiting rows, split on `available_at` relative to `now`.
    ///
    /// `future` selects rows not yet due (the derived delayed set); otherwise
    /// rows that are due.
    async fn count_waiting(
        &self,
        job_type: Option<&str>,
        now: Option<i64>,
        future: bool,
    ) -> Result<u64> {
        let mut binder = Binder::new(self.engine);
        let queue_ph = binder.next();
        let type_clause = job_type
            .map(|_| format!(" AND job_type = {}", binder.next()))
            .unwrap_or_default();
        let available_clause = now
            .map(|_| {
                let op = if future { ">" } else { "<=" };
                format!(" AND available_at {} {}", op, binder.next())
            })
            .unwrap_or_default();
        let sql = format!(
            "SELECT COUNT(*) AS total FROM {table} WHERE queue = {q} AND status = 'waiting'{t}{a}",
            table = self.table,
            q = queue_ph,
            t = type_clause,
            a = available_clause,
        );
        let mut query = sqlx::query(&sql).bind(&self.queue_name);
        if let Some(job_type) = job_type {
            query = query.bind(job_type);
        }
        if let Some(now) = now {
            query = query.bind(now);
        }
        let row = query.fetch_one(&self.pool).await?;
        Ok(row.try_get::<i64, _>("total")? as u64)
    }

    /// Requeue or fail rows whose lease expired
    async fn recover_stalled(&self) -> Result<()> {
        let now = now_ms();
        let cutoff = now - self.config.worker.stalled_interval_ms as i64;
        let max_stalled = self.config.worker.max_stalled_count as i64;

        let mut binder = Binder::new(self.engine);
        let sql = format!(
            "UPDATE {table} SET status = 'waiting', stalled_count = stalled_count + 1 \
             WHERE queue = {q} AND status = 'active' AND started_at < {s} \
             AND stalled_count < {m}",
            table = self.table,
            q = binder.next(),
            s = binder.next(),
            m = binder.next(),
        );
        let requeued = sqlx::query(&sql)
            .bind(&self.queue_name)
            .bind(cutoff)
            .bind(max_stalled)
            .execute(&self.pool)
            .await?
            .rows_affected();

        let mut binder = Binder::new(self.engine);
        let sql = format!(
            "UPDATE {table} SET status = 'failed', failed_at = {f}, \
             last_error = 'job stalled: lease expired' \
             WHERE queue = {q} AND status = 'active' AND started_at < {s} \
             AND stalled_count >= {m}",
            table = self.table,
            f = binder.next(),
            q = binder.next(),
            s = binder.next(),
            m = binder.next(),
        );
        let failed = sqlx::query(&sql)
            .bind(now)
            .bind(&self.queue_name)
            .bind(cutoff)
            .bind(max_stalled)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if requeued > 0 || failed > 0 {
            warn!("stalled recovery: requeued={}, failed={}", requeued, failed);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for DatabaseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Database
    }

    async fn add(&self, job: Job) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }

        let options = StoredOptions {
            backoff: job.backoff,
            retry_delay_ms: job.retry_delay_ms,
            delay_ms: job.delay_ms,
            remove_on_complete: job.remove_on_complete,
            remove_on_fail: job.remove_on_fail,
        };
        let mut binder = Binder::new(self.inner.engine);
        let placeholders: Vec<String> = (0..11).map(|_| binder.next()).collect();
        let sql = format!(
            "INSERT INTO {table} (id, queue, job_type, data, options, status, priority, \
             attempts, max_attempts, stalled_count, created_at, available_at) \
             VALUES ({p0}, {p1}, {p2}, {p3}, {p4}, 'waiting', {p5}, {p6}, {p7}, {p8}, {p9}, {p10})",
            table = self.inner.table,
            p0 = placeholders[0],
            p1 = placeholders[1],
            p2 = placeholders[2],
            p3 = placeholders[3],
            p4 = placeholders[4],
            p5 = placeholders[5],
            p6 = placeholders[6],
            p7 = placeholders[7],
            p8 = placeholders[8],
            p9 = placeholders[9],
            p10 = placeholders[10],
        );
        sqlx::query(&sql)
            .bind(job.id.to_string())
            .bind(&self.inner.queue_name)
            .bind(&job.job_type)
            .bind(job.data.to_string())
            .bind(serde_json::to_string(&options)?)
            .bind(job.priority as i64)
            .bind(job.attempts as i64)
            .bind(job.max_attempts as i64)
            .bind(job.stalled_count as i64)
            .bind(job.created_at)
            .bind(job.available_at)
            .execute(&self.inner.pool)
            .await
            .map_err(|e| QueueError::backend(format!("failed to add job: {}", e)))?;

        self.inner.wake.notify_one();
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
        match job_type {
            Some(job_type) => {
                self.inner
                    .paused_types
                    .lock()
                    .expect("paused set lock")
                    .insert(job_type.to_owned());
            }
            None => self.inner.paused_all.store(true, Ordering::SeqCst),
        }
        info!("paused: scope={}", job_type.unwrap_or("*"));
        Ok(())
    }

    async fn resume(&self, job_type: Option<&str>) -> Result<()> {
        match job_type {
            Some(job_type) => {
                self.inner
                    .paused_types
                    .lock()
                    .expect("paused set lock")
                    .remove(job_type);
            }
            None => self.inner.paused_all.store(false, Ordering::SeqCst),
        }
        info!("resumed: scope={}", job_type.unwrap_or("*"));
        self.inner.wake.notify_one();
        Ok(())
    }

    async fn stats(&self, job_type: Option<&str>) -> Result<QueueStats> {
        let now = now_ms();
        let mut binder = Binder::new(self.inner.engine);
        let queue_ph = binder.next();
        let type_clause = job_type
            .map(|_| format!(" AND job_type = {}", binder.next()))
            .unwrap_or_default();
        let sql = format!(
            "SELECT status, COUNT(*) AS total FROM {table} WHERE queue = {q}{t} GROUP BY status",
            table = self.inner.table,
            q = queue_ph,
            t = type_clause,
        );
        let mut query = sqlx::query(&sql).bind(&self.inner.queue_name);
        if let Some(job_type) = job_type {
            query = query.bind(job_type);
        }
        let rows = query.fetch_all(&self.inner.pool).await?;

        let mut stats = QueueStats::default();
        for row in &rows {
            let status: JobStatus = row.try_get::<String, _>("status")?.parse()?;
            let total = row.try_get::<i64, _>("total")? as u64;
            match status {
                JobStatus::Waiting => stats.waiting += total,
                JobStatus::Active => stats.active += total,
                JobStatus::Completed => stats.completed += total,
                JobStatus::Failed => stats.failed += total,
                JobStatus::Delayed | JobStatus::Paused => {}
            }
        }

        // Delayed is derived: a waiting row whose available_at is in the future
        stats.delayed = self.inner.count_waiting(job_type, Some(now), true).await?;
        stats.waiting = stats.waiting.saturating_sub(stats.delayed);

        // Pause is a process-local gate; reclassify waiting counts
        let paused_scope = self.inner.paused_all.load(Ordering::SeqCst)
            || job_type.map(|t| self.inner.is_paused(t)).unwrap_or(false);
        if paused_scope {
            stats.paused = stats.waiting;
            stats.waiting = 0;
        } else if job_type.is_none() {
            let paused_types: Vec<String> = self
                .inner
                .paused_types
                .lock()
                .expect("paused set lock")
                .iter()
                .cloned()
                .collect();
            for paused_type in paused_types {
                let held = self
                    .inner
                    .count_waiting(Some(&paused_type), Some(now), false)
                    .await?;
                stats.waiting = stats.waiting.saturating_sub(held);
                stats.paused += held;
            }
        }

        Ok(stats)
    }

    async fn jobs(&self, status: JobStatus, job_type: Option<&str>) -> Result<Vec<JobInfo>> {
        let now = now_ms();
        let (stored_status, extra) = match status {
            JobStatus::Waiting | JobStatus::Paused => ("waiting", "available_at <= "),
            JobStatus::Delayed => ("waiting", "available_at > "),
            JobStatus::Active => ("active", ""),
            JobStatus::Completed => ("completed", ""),
            JobStatus::Failed => ("failed", ""),
        };

        let mut binder = Binder::new(self.inner.engine);
        let queue_ph = binder.next();
        let type_clause = job_type
            .map(|_| format!(" AND job_type = {}", binder.next()))
            .unwrap_or_default();
        let extra_clause = if extra.is_empty() {
            String::new()
        } else {
            format!(" AND {}{}", extra, binder.next())
        };
        let sql = format!(
            "SELECT * FROM {table} WHERE queue = {q} AND status = '{status}'{t}{extra} \
             ORDER BY created_at ASC, id ASC LIMIT {limit}",
            table = self.inner.table,
            q = queue_ph,
            status = stored_status,
            t = type_clause,
            extra = extra_clause,
            limit = MAX_JOBS_PAGE,
        );

        let mut query = sqlx::query(&sql).bind(&self.inner.queue_name);
        if let Some(job_type) = job_type {
            query = query.bind(job_type);
        }
        if !extra.is_empty() {
            query = query.bind(now);
        }
        let rows = query.fetch_all(&self.inner.pool).await?;

        let mut infos = Vec::with_capacity(rows.len());
        for row in &rows {
            let job = row_to_job(row)?;
            let paused_here = self.inner.is_paused(&job.job_type);
            // Waiting rows of paused types surface as paused, and vice versa
            if status == JobStatus::Paused && !paused_here {
                continue;
            }
            if status == JobStatus::Waiting && paused_here {
                continue;
            }
            let mut info = job.info();
            if status == JobStatus::Paused {
                info.status = JobStatus::Paused;
            }
            infos.push(info);
        }
        Ok(finish_listing(infos))
    }

    async fn job(&self, id: JobId) -> Result<Option<Job>> {
        let mut binder = Binder::new(self.inner.engine);
        let sql = format!(
            "SELECT * FROM {table} WHERE id = {i}",
            table = self.inner.table,
            i = binder.next(),
        );
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.inner.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn retry(&self, id: JobId) -> Result<()> {
        let mut binder = Binder::new(self.inner.engine);
        let sql = format!(
            "UPDATE {table} SET status = 'waiting', attempts = 0, stalled_count = 0, \
             last_error = NULL, failed_at = NULL, available_at = {a} \
             WHERE id = {i} AND status = 'failed'",
            table = self.inner.table,
            a = binder.next(),
            i = binder.next(),
        );
        let updated = sqlx::query(&sql)
            .bind(now_ms())
            .bind(id.to_string())
            .execute(&self.inner.pool)
            .await?;

        if updated.rows_affected() == 0 {
            return match self.job(id).await? {
                Some(job) => Err(QueueError::conflict(format!(
                    "job {} is {}, only failed jobs can be retried",
                    id, job.status
                ))),
                None => Err(QueueError::NotFound(id.to_string())),
            };
        }
        self.inner.wake.notify_one();
        Ok(())
    }

    async fn remove(&self, id: JobId) -> Result<()> {
        let mut binder = Binder::new(self.inner.engine);
        let sql = format!(
            "DELETE FROM {table} WHERE id = {i} AND status <> 'active'",
            table = self.inner.table,
            i = binder.next(),
        );
        let deleted = sqlx::query(&sql)
            .bind(id.to_string())
            .execute(&self.inner.pool)
            .await?;

        if deleted.rows_affected() == 0 {
            return match self.job(id).await? {
                Some(_) => Err(QueueError::conflict(format!(
                    "job {} is active and cannot be removed",
                    id
                ))),
                None => Err(QueueError::NotFound(id.to_string())),
            };
        }
        Ok(())
    }

    async fn clean(&self, status: JobStatus, grace: Duration) -> Result<u64> {
        if !status.is_terminal() {
            return Err(QueueError::invalid(format!(
                "clean only accepts completed or failed, got {}",
                status
            )));
        }
        let cutoff = now_ms() - grace.as_millis() as i64;
        let timestamp = match status {
            JobStatus::Completed => "completed_at",
            _ => "failed_at",
        };
        let mut binder = Binder::new(self.inner.engine);
        let sql = format!(
            "DELETE FROM {table} WHERE queue = {q} AND status = '{status}' AND {ts} < {c}",
            table = self.inner.table,
            q = binder.next(),
            status = status.as_str(),
            ts = timestamp,
            c = binder.next(),
        );
        let deleted = sqlx::query(&sql)
            .bind(&self.inner.queue_name)
            .bind(cutoff)
            .execute(&self.inner.pool)
            .await?;
        Ok(deleted.rows_affected())
    }

    async fn health(&self) -> Health {
        match sqlx::query("SELECT 1").fetch_one(&self.inner.pool).await {
            Ok(_) => Health::healthy(TransportKind::Database),
            Err(e) => Health::unhealthy(TransportKind::Database, format!("database: {}", e)),
        }
    }

    async fn close(&self, timeout: Duration) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("database transport closing");
        self.inner.wake.notify_waiters();

        let deadline = tokio::time::Instant::now() + timeout;
        while self.inner.active.load(Ordering::SeqCst) > 0 {
            let drained = self.inner.drained.notified();
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                warn!(
                    "graceful shutdown timed out with {} active jobs; stalled recovery will reclaim them",
                    self.inner.active.load(Ordering::SeqCst)
                );
                break;
            }
        }

        for task in self.inner.tasks.lock().expect("task list lock").drain(..) {
            task.abort();
        }
        self.inner.pool.close().await;
        info!("database transport closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::transport::FnHandler;
    use serde_json::json;

    fn sqlite_config(worker: bool) -> QueueConfig {
        let mut config = QueueConfig::default();
        config.database.url = Some("sqlite::memory:".to_string());
        // One connection keeps every query on the same in-memory database
        config.database.max_connections = 1;
        config.database.poll_interval_ms = 100;
        config.worker.enabled = worker;
        config
    }

    fn make_job(job_type: &str) -> Job {
        Job::new(JobId::new_v4(), job_type, json!({"k": "v"}))
    }

    #[test]
    fn test_engine_detection() {
        assert_eq!(
            Engine::from_url("postgres://localhost/db").unwrap(),
            Engine::Postgres
        );
        assert_eq!(
            Engine::from_url("mysql://localhost/db").unwrap(),
            Engine::MySql
        );
        assert_eq!(Engine::from_url("sqlite::memory:").unwrap(), Engine::Sqlite);
        assert!(Engine::from_url("mongodb://localhost").is_err());

        assert!(Engine::Postgres.supports_skip_locked());
        assert!(Engine::MySql.supports_skip_locked());
        assert!(!Engine::Sqlite.supports_skip_locked());
    }

    #[test]
    fn test_binder_placeholders() {
        let mut binder = Binder::new(Engine::Postgres);
        assert_eq!(binder.next(), "$1");
        assert_eq!(binder.next(), "$2");

        let mut binder = Binder::new(Engine::MySql);
        assert_eq!(binder.next(), "?");
        assert_eq!(binder.next(), "?");
    }

    #[tokio::test]
    async fn test_add_and_fetch_round_trip() {
        let transport = DatabaseTransport::connect(sqlite_config(false))
            .await
            .unwrap();

        let mut job = make_job("rt");
        job.priority = 7;
        let id = job.id;
        transport.add(job).await.unwrap();

        let fetched = transport.job(id).await.unwrap().unwrap();
        assert_eq!(fetched.id, id);
        assert_eq!(fetched.data, json!({"k": "v"}));
        assert_eq!(fetched.priority, 7);
        assert_eq!(fetched.status, JobStatus::Waiting);

        let stats = transport.stats(None).await.unwrap();
        assert_eq!(stats.waiting, 1);
        transport.close(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_delayed_is_derived_from_available_at() {
        let transport = DatabaseTransport::connect(sqlite_config(false))
            .await
            .unwrap();

        let mut job = make_job("later");
        job.available_at = now_ms() + 60_000;
        job.status = JobStatus::Delayed;
        let id = job.id;
        transport.add(job).await.unwrap();

        let fetched = transport.job(id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Delayed);

        let stats = transport.stats(None).await.unwrap();
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.waiting, 0);

        let listed = transport.jobs(JobStatus::Delayed, None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, JobStatus::Delayed);
        transport.close(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority() {
        let transport = DatabaseTransport::connect(sqlite_config(false))
            .await
            .unwrap();

        let low = make_job("ordered");
        let mut high = make_job("ordered");
        high.priority = 10;
        let high_id = high.id;
        transport.add(low).await.unwrap();
        transport.add(high).await.unwrap();

        let claimed = transport.inner.claim_batch("ordered", 1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, high_id);
        assert_eq!(claimed[0].status, JobStatus::Active);
        assert_eq!(claimed[0].attempts, 1);
        transport.close(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_completes_job() {
        let transport = DatabaseTransport::connect(sqlite_config(true))
            .await
            .unwrap();
        transport
            .process("work", Arc::new(FnHandler::new(|_| async { Ok(json!("done")) })))
            .await
            .unwrap();

        let job = make_job("work");
        let id = job.id;
        transport.add(job).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let job = transport.job(id).await.unwrap().unwrap();
            if job.status == JobStatus::Completed {
                assert_eq!(job.result, Some(json!("done")));
                assert_eq!(job.attempts, 1);
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job stuck in {}",
                job.status
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        transport.close(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_retries_then_fails() {
        let transport = DatabaseTransport::connect(sqlite_config(true))
            .await
            .unwrap();
        transport
            .process(
                "doomed",
                Arc::new(FnHandler::new(|_| async {
                    Err(HandlerError::new("always fails"))
                })),
            )
            .await
            .unwrap();

        let mut job = make_job("doomed");
        job.max_attempts = 2;
        job.retry_delay_ms = 1;
        job.backoff = BackoffKind::Fixed;
        let id = job.id;
        transport.add(job).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let job = transport.job(id).await.unwrap().unwrap();
            if job.status == JobStatus::Failed {
                assert_eq!(job.attempts, 2);
                assert_eq!(job.last_error.as_deref(), Some("always fails"));
                break;
            }
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // Retry resets the failure state
        transport.pause(Some("doomed")).await.unwrap();
        transport.retry(id).await.unwrap();
        let job = transport.job(id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 0);
        assert!(job.last_error.is_none());
        transport.close(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_and_remove_guards() {
        let transport = DatabaseTransport::connect(sqlite_config(false))
            .await
            .unwrap();

        let job = make_job("guard");
        let id = job.id;
        transport.add(job).await.unwrap();

        assert!(matches!(
            transport.retry(id).await.unwrap_err(),
            QueueError::Conflict(_)
        ));
        assert!(matches!(
            transport.retry(JobId::new_v4()).await.unwrap_err(),
            QueueError::NotFound(_)
        ));

        let claimed = transport.inner.claim_batch("guard", 1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert!(matches!(
            transport.remove(id).await.unwrap_err(),
            QueueError::Conflict(_)
        ));
        transport.close(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_clean_removes_old_terminal_rows() {
        let transport = DatabaseTransport::connect(sqlite_config(false))
            .await
            .unwrap();

        let job = make_job("old");
        let id = job.id;
        transport.add(job).await.unwrap();
        let claimed = transport.inner.claim_batch("old", 1).await.unwrap();
        transport
            .inner
            .complete_job(&claimed[0], now_ms() - 100, &json!(null))
            .await
            .unwrap();

        let removed = transport
            .clean(JobStatus::Completed, Duration::from_millis(0))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(transport.job(id).await.unwrap().is_none());

        assert!(matches!(
            transport
                .clean(JobStatus::Active, Duration::from_secs(1))
                .await
                .unwrap_err(),
            QueueError::InvalidArgument(_)
        ));
        transport.close(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stalled_recovery_requeues_then_fails() {
        let mut config = sqlite_config(false);
        config.worker.stalled_interval_ms = 50;
        config.worker.max_stalled_count = 1;
        let transport = DatabaseTransport::connect(config).await.unwrap();

        let job = make_job("stalled");
        let id = job.id;
        transport.add(job).await.unwrap();
        transport.inner.claim_batch("stalled", 1).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        transport.inner.recover_stalled().await.unwrap();
        let job = transport.job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.stalled_count, 1);
        // A stalled reclaim does not consume an attempt
        assert_eq!(job.attempts, 1);

        transport.inner.claim_batch("stalled", 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        transport.inner.recover_stalled().await.unwrap();
        let job = transport.job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.last_error.unwrap().contains("stalled"));
        transport.close(Duration::from_secs(1)).await.unwrap();
    }
}
