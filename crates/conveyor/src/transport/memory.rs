//! In-process transport
//!
//! Single-process store: ready queues ordered by (priority desc, enqueue
//! order), one cancellable timer per delayed job, and a dispatcher task that
//! is kicked whenever a job may have become runnable (enqueue, timer fire,
//! attempt finished, resume). Dispatch claims jobs while worker slots are
//! free; handlers run in their own tasks.

use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::job::{now_ms, Job, JobId, JobInfo, JobStatus};
use crate::retry::RetryPolicy;
use crate::transport::{
    finish_listing, run_handler, Health, JobHandler, QueueStats, Transport, TransportKind,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One slot in a per-type ready queue
#[derive(Debug, Clone, Copy)]
struct ReadyEntry {
    id: JobId,
    priority: i32,
    created_at: i64,
    seq: u64,
}

impl ReadyEntry {
    /// Sort key: priority desc, then FIFO
    fn key(&self) -> (i64, i64, u64) {
        (-(self.priority as i64), self.created_at, self.seq)
    }
}

/// Mutable store guarded by one lock
#[derive(Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    ready: HashMap<String, Vec<ReadyEntry>>,
    completed_log: HashMap<String, VecDeque<JobId>>,
    failed_log: HashMap<String, VecDeque<JobId>>,
    paused_types: HashSet<String>,
    paused_all: bool,
    seq: u64,
}

impl State {
    fn push_ready(&mut self, job: &Job) {
        self.seq += 1;
        let entry = ReadyEntry {
            id: job.id,
            priority: job.priority,
            created_at: job.created_at,
            seq: self.seq,
        };
        let entries = self.ready.entry(job.job_type.clone()).or_default();
        let pos = entries.partition_point(|e| e.key() <= entry.key());
        entries.insert(pos, entry);
    }

    fn is_paused(&self, job_type: &str) -> bool {
        self.paused_all || self.paused_types.contains(job_type)
    }

    /// Drop the oldest terminal records beyond `bound`
    fn enforce_retention(&mut self, job_type: &str, status: JobStatus, bound: u32) {
        let log = match status {
            JobStatus::Completed => self.completed_log.entry(job_type.to_owned()).or_default(),
            JobStatus::Failed => self.failed_log.entry(job_type.to_owned()).or_default(),
            _ => return,
        };
        while log.len() > bound as usize {
            if let Some(oldest) = log.pop_front() {
                self.jobs.remove(&oldest);
            }
        }
    }
}

struct MemoryInner {
    config: QueueConfig,
    state: Mutex<State>,
    handlers: DashMap<String, Arc<dyn JobHandler>>,
    timers: Mutex<HashMap<JobId, JoinHandle<()>>>,
    active: AtomicUsize,
    closed: AtomicBool,
    dispatch: Notify,
    drained: Notify,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl MemoryInner {
    fn kick(&self) {
        self.dispatch.notify_one();
    }
}

/// Single-process transport
pub struct MemoryTransport {
    inner: Arc<MemoryInner>,
}

impl MemoryTransport {
    /// Create the transport and start its dispatcher and sweeper
    pub fn new(config: QueueConfig) -> Self {
        let inner = Arc::new(MemoryInner {
            config,
            state: Mutex::new(State::default()),
            handlers: DashMap::new(),
            timers: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            dispatch: Notify::new(),
            drained: Notify::new(),
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        if inner.config.worker.enabled {
            let dispatcher = tokio::spawn(dispatcher_loop(inner.clone()));
            let sweeper = tokio::spawn(sweeper_loop(inner.clone()));
            inner
                .tasks
                .lock()
                .expect("task list lock")
                .extend([dispatcher, sweeper]);
        }

        info!("memory transport started");
        Self { inner }
    }
}

async fn dispatcher_loop(inner: Arc<MemoryInner>) {
    loop {
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        dispatch_once(&inner).await;
        inner.dispatch.notified().await;
    }
    debug!("memory dispatcher stopped");
}

/// Claim and launch runnable jobs until slots or work run out
async fn dispatch_once(inner: &Arc<MemoryInner>) {
    loop {
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }
        if inner.active.load(Ordering::SeqCst) >= inner.config.concurrency {
            return;
        }

        let claimed = {
            let mut guard = inner.state.lock().await;
            let state = &mut *guard;
            if state.paused_all {
                return;
            }
            let now = now_ms();
            let mut claimed = None;
            'types: for (job_type, entries) in state.ready.iter_mut() {
                if state.paused_types.contains(job_type) {
                    continue;
                }
                let handler = match inner.handlers.get(job_type) {
                    Some(entry) => Arc::clone(entry.value()),
                    None => continue,
                };
                while !entries.is_empty() {
                    let entry = entries[0];
                    let runnable = state
                        .jobs
                        .get(&entry.id)
                        .map(|job| job.status == JobStatus::Waiting && job.is_due(now))
                        .unwrap_or(false);
                    if !runnable {
                        // Stale slot: the job was removed, paused or re-delayed
                        entries.remove(0);
                        continue;
                    }
                    entries.remove(0);
                    claimed = Some((entry.id, handler));
                    break 'types;
                }
            }
            claimed.map(|(id, handler)| {
                let job = state.jobs.get_mut(&id).expect("claimed job present");
                job.mark_started(now);
                (id, handler, job.data.clone(), job.job_type.clone())
            })
        };

        let Some((id, handler, data, job_type)) = claimed else {
            return;
        };

        inner.active.fetch_add(1, Ordering::SeqCst);
        debug!("claimed job: id={}, type={}", id, job_type);
        tokio::spawn(execute_job(inner.clone(), id, handler, data));
    }
}

/// Run one attempt and apply the outcome
async fn execute_job(
    inner: Arc<MemoryInner>,
    id: JobId,
    handler: Arc<dyn JobHandler>,
    data: serde_json::Value,
) {
    let outcome = run_handler(handler, data).await;
    let now = now_ms();
    let mut retry_at = None;

    {
        let mut guard = inner.state.lock().await;
        let state = &mut *guard;
        if let Some(job) = state.jobs.get_mut(&id) {
            match outcome {
                Ok(result) => {
                    job.mark_completed(now, result);
                    let job_type = job.job_type.clone();
                    let bound = job.remove_on_complete;
                    state
                        .completed_log
                        .entry(job_type.clone())
                        .or_default()
                        .push_back(id);
                    state.enforce_retention(&job_type, JobStatus::Completed, bound);
                }
                Err(error) => {
                    if job.attempts >= job.max_attempts {
                        warn!(
                            "job exhausted attempts: id={}, attempts={}, error={}",
                            id, job.attempts, error.message
                        );
                        job.mark_failed(now, error.message);
                        let job_type = job.job_type.clone();
                        let bound = job.remove_on_fail;
                        state
                            .failed_log
                            .entry(job_type.clone())
                            .or_default()
                            .push_back(id);
                        state.enforce_retention(&job_type, JobStatus::Failed, bound);
                    } else {
                        let policy = RetryPolicy::new(
                            job.backoff,
                            Duration::from_millis(job.retry_delay_ms),
                        );
                        let delay = policy.delay_for(job.attempts);
                        let available_at = now + delay.as_millis() as i64;
                        job.mark_retrying(available_at, now, error.message);
                        if job.status == JobStatus::Delayed {
                            retry_at = Some(available_at);
                        } else {
                            let job = job.clone();
                            state.push_ready(&job);
                        }
                    }
                }
            }
        }
    }

    if let Some(available_at) = retry_at {
        arm_timer(&inner, id, available_at).await;
    }

    inner.active.fetch_sub(1, Ordering::SeqCst);
    // notify_one stores a permit, so a close() that races this decrement
    // still observes the wake-up
    inner.drained.notify_one();
    inner.kick();
}

/// Schedule promotion of a delayed job
async fn arm_timer(inner: &Arc<MemoryInner>, id: JobId, available_at: i64) {
    let wait = (available_at - now_ms()).max(0) as u64;
    let task_inner = inner.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(wait)).await;
        task_inner.timers.lock().await.remove(&id);
        promote_job(&task_inner, id).await;
    });
    if let Some(stale) = inner.timers.lock().await.insert(id, handle) {
        stale.abort();
    }
}

/// Move a due delayed job to waiting, or park it when paused
async fn promote_job(inner: &Arc<MemoryInner>, id: JobId) {
    {
        let mut guard = inner.state.lock().await;
        let state = &mut *guard;
        let (status, job_type) = match state.jobs.get(&id) {
            Some(job) => (job.status, job.job_type.clone()),
            None => return,
        };
        if status != JobStatus::Delayed {
            return;
        }
        let paused = state.is_paused(&job_type);
        let job = state.jobs.get_mut(&id).expect("job present");
        if paused {
            job.status = JobStatus::Paused;
            return;
        }
        job.status = JobStatus::Waiting;
        let job = job.clone();
        state.push_ready(&job);
    }
    inner.kick();
}

/// Periodic safety net: promote due delayed jobs whose timer was lost
async fn sweeper_loop(inner: Arc<MemoryInner>) {
    let period = inner.config.memory.cleanup_interval();
    loop {
        tokio::time::sleep(period).await;
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        let due: Vec<JobId> = {
            let timers = inner.timers.lock().await;
            let state = inner.state.lock().await;
            let now = now_ms();
            state
                .jobs
                .values()
                .filter(|job| {
                    job.status == JobStatus::Delayed
                        && job.is_due(now)
                        && !timers.contains_key(&job.id)
                })
                .map(|job| job.id)
                .collect()
        };
        for id in due {
            promote_job(&inner, id).await;
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }

    async fn add(&self, job: Job) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }

        let id = job.id;
        let delayed_until = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            if state.jobs.len() >= self.inner.config.memory.max_jobs {
                return Err(QueueError::Overflow(state.jobs.len()));
            }

            let mut job = job;
            let now = now_ms();
            let mut delayed_until = None;
            if !job.is_due(now) {
                job.status = JobStatus::Delayed;
                delayed_until = Some(job.available_at);
            } else if state.is_paused(&job.job_type) {
                job.status = JobStatus::Paused;
            } else {
                job.status = JobStatus::Waiting;
                state.push_ready(&job);
            }
            state.jobs.insert(id, job);
            delayed_until
        };

        if let Some(available_at) = delayed_until {
            arm_timer(&self.inner, id, available_at).await;
        }
        self.inner.kick();
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
        self.inner.kick();
        Ok(())
    }

    async fn pause(&self, job_type: Option<&str>) -> Result<()> {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        match job_type {
            Some(job_type) => {
                state.paused_types.insert(job_type.to_owned());
            }
            None => state.paused_all = true,
        }
        for job in state.jobs.values_mut() {
            let in_scope = job_type.map(|t| job.job_type == t).unwrap_or(true);
            if in_scope && matches!(job.status, JobStatus::Waiting | JobStatus::Delayed) {
                job.status = JobStatus::Paused;
            }
        }
        info!("paused: scope={}", job_type.unwrap_or("*"));
        Ok(())
    }

    async fn resume(&self, job_type: Option<&str>) -> Result<()> {
        let to_arm = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            match job_type {
                Some(job_type) => {
                    state.paused_types.remove(job_type);
                }
                None => state.paused_all = false,
            }

            let now = now_ms();
            let mut restored = Vec::new();
            let mut to_arm = Vec::new();
            for job in state.jobs.values_mut() {
                let in_scope = job_type.map(|t| job.job_type == t).unwrap_or(true);
                if !in_scope || job.status != JobStatus::Paused {
                    continue;
                }
                if state.paused_all || state.paused_types.contains(&job.job_type) {
                    continue;
                }
                if job.is_due(now) {
                    job.status = JobStatus::Waiting;
                    restored.push(job.clone());
                } else {
                    job.status = JobStatus::Delayed;
                    to_arm.push((job.id, job.available_at));
                }
            }
            for job in restored {
                state.push_ready(&job);
            }
            to_arm
        };

        let missing: Vec<(JobId, i64)> = {
            let timers = self.inner.timers.lock().await;
            to_arm
                .into_iter()
                .filter(|(id, _)| !timers.contains_key(id))
                .collect()
        };
        for (id, available_at) in missing {
            arm_timer(&self.inner, id, available_at).await;
        }

        info!("resumed: scope={}", job_type.unwrap_or("*"));
        self.inner.kick();
        Ok(())
    }

    async fn stats(&self, job_type: Option<&str>) -> Result<QueueStats> {
        let state = self.inner.state.lock().await;
        let mut stats = QueueStats::default();
        for job in state.jobs.values() {
            if job_type.map(|t| job.job_type == t).unwrap_or(true) {
                stats.record(job.status);
            }
        }
        Ok(stats)
    }

    async fn jobs(&self, status: JobStatus, job_type: Option<&str>) -> Result<Vec<JobInfo>> {
        let state = self.inner.state.lock().await;
        let jobs = state
            .jobs
            .values()
            .filter(|job| job.status == status)
            .filter(|job| job_type.map(|t| job.job_type == t).unwrap_or(true))
            .map(Job::info)
            .collect();
        Ok(finish_listing(jobs))
    }

    async fn job(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.inner.state.lock().await.jobs.get(&id).cloned())
    }

    async fn retry(&self, id: JobId) -> Result<()> {
        {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            let job = state
                .jobs
                .get_mut(&id)
                .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
            if job.status != JobStatus::Failed {
                return Err(QueueError::conflict(format!(
                    "job {} is {}, only failed jobs can be retried",
                    id, job.status
                )));
            }
            job.reset_for_retry(now_ms());
            let job = job.clone();
            if let Some(log) = state.failed_log.get_mut(&job.job_type) {
                log.retain(|logged| *logged != id);
            }
            state.push_ready(&job);
        }
        self.inner.kick();
        Ok(())
    }

    async fn remove(&self, id: JobId) -> Result<()> {
        {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            let status = state
                .jobs
                .get(&id)
                .map(|job| job.status)
                .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
            if status == JobStatus::Active {
                return Err(QueueError::conflict(format!(
                    "job {} is active and cannot be removed",
                    id
                )));
            }
            let job = state.jobs.remove(&id).expect("job present");
            if let Some(log) = state.completed_log.get_mut(&job.job_type) {
                log.retain(|logged| *logged != id);
            }
            if let Some(log) = state.failed_log.get_mut(&job.job_type) {
                log.retain(|logged| *logged != id);
            }
        }
        if let Some(timer) = self.inner.timers.lock().await.remove(&id) {
            timer.abort();
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
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        let expired: Vec<JobId> = state
            .jobs
            .values()
            .filter(|job| job.status == status)
            .filter(|job| {
                let terminal_at = match status {
                    JobStatus::Completed => job.completed_at,
                    _ => job.failed_at,
                };
                terminal_at.map(|at| at < cutoff).unwrap_or(false)
            })
            .map(|job| job.id)
            .collect();

        for id in &expired {
            if let Some(job) = state.jobs.remove(id) {
                let log = match status {
                    JobStatus::Completed => state.completed_log.get_mut(&job.job_type),
                    _ => state.failed_log.get_mut(&job.job_type),
                };
                if let Some(log) = log {
                    log.retain(|logged| logged != id);
                }
            }
        }

        Ok(expired.len() as u64)
    }

    async fn health(&self) -> Health {
        Health::healthy(TransportKind::Memory)
    }

    async fn close(&self, timeout: Duration) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("memory transport closing");
        self.inner.kick();

        for (_, timer) in self.inner.timers.lock().await.drain() {
            timer.abort();
        }

        let deadline = tokio::time::Instant::now() + timeout;
        while self.inner.active.load(Ordering::SeqCst) > 0 {
            let drained = self.inner.drained.notified();
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                warn!(
                    "graceful shutdown timed out with {} active jobs",
                    self.inner.active.load(Ordering::SeqCst)
                );
                break;
            }
        }

        for task in self.inner.tasks.lock().expect("task list lock").drain(..) {
            task.abort();
        }
        info!("memory transport closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::job::JobOptions;
    use crate::transport::FnHandler;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn test_config() -> QueueConfig {
        let mut config = QueueConfig::default();
        config.concurrency = 1;
        config
    }

    fn make_job(job_type: &str, options: JobOptions) -> Job {
        let mut job = Job::new(JobId::new_v4(), job_type, json!({}));
        if let Some(priority) = options.priority {
            job.priority = priority;
        }
        if let Some(max_attempts) = options.max_attempts {
            job.max_attempts = max_attempts;
        }
        if let Some(retry_delay_ms) = options.retry_delay_ms {
            job.retry_delay_ms = retry_delay_ms;
        }
        if let Some(backoff) = options.backoff {
            job.backoff = backoff;
        }
        if let Some(bound) = options.remove_on_complete {
            job.remove_on_complete = bound;
        }
        if let Some(delay_ms) = options.delay_ms {
            job.delay_ms = delay_ms;
            job.available_at = now_ms() + delay_ms as i64;
            job.status = JobStatus::Delayed;
        }
        job
    }

    async fn wait_for<F: Fn(&QueueStats) -> bool>(
        transport: &MemoryTransport,
        predicate: F,
        timeout_ms: u64,
    ) -> QueueStats {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let stats = transport.stats(None).await.unwrap();
            if predicate(&stats) || tokio::time::Instant::now() >= deadline {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_priority_ordering() {
        let transport = MemoryTransport::new(test_config());

        let first = make_job("render", JobOptions::new().with_priority(0));
        let second = make_job("render", JobOptions::new().with_priority(10));
        let low_id = first.id;
        let high_id = second.id;
        transport.add(first).await.unwrap();
        transport.add(second).await.unwrap();

        transport
            .process(
                "render",
                Arc::new(FnHandler::new(|_| async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(json!(null))
                })),
            )
            .await
            .unwrap();

        let stats = wait_for(&transport, |s| s.completed == 2, 2_000).await;
        assert_eq!(stats.completed, 2);

        // The high-priority job must have been claimed first
        let high = transport.job(high_id).await.unwrap().unwrap();
        let low = transport.job(low_id).await.unwrap().unwrap();
        assert!(high.started_at.unwrap() <= low.started_at.unwrap());
        assert!(high.completed_at.unwrap() <= low.completed_at.unwrap());
    }

    #[tokio::test]
    async fn test_retry_then_succeed() {
        let transport = MemoryTransport::new(test_config());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        transport
            .process(
                "flaky",
                Arc::new(FnHandler::new(move |_| {
                    let counter = counter.clone();
                    async move {
                        let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        if attempt < 3 {
                            Err(HandlerError::new("not yet"))
                        } else {
                            Ok(json!("done"))
                        }
                    }
                })),
            )
            .await
            .unwrap();

        let job = make_job(
            "flaky",
            JobOptions::new()
                .with_max_attempts(5)
                .with_backoff(crate::retry::BackoffKind::Fixed)
                .with_retry_delay_ms(50),
        );
        let id = job.id;
        transport.add(job).await.unwrap();

        wait_for(&transport, |s| s.completed == 1, 3_000).await;
        let job = transport.job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 3);
    }

    #[tokio::test]
    async fn test_terminal_failure_and_retry_op() {
        let transport = MemoryTransport::new(test_config());
        transport
            .process(
                "doomed",
                Arc::new(FnHandler::new(|_| async {
                    Err(HandlerError::new("always fails"))
                })),
            )
            .await
            .unwrap();

        let job = make_job(
            "doomed",
            JobOptions::new()
                .with_max_attempts(2)
                .with_backoff(crate::retry::BackoffKind::Fixed)
                .with_retry_delay_ms(20),
        );
        let id = job.id;
        transport.add(job).await.unwrap();

        wait_for(&transport, |s| s.failed == 1, 3_000).await;
        let job = transport.job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 2);
        assert!(job.last_error.is_some());

        // Pause so the retried job stays observable as waiting
        transport.pause(Some("doomed")).await.unwrap();
        transport.retry(id).await.unwrap();
        let job = transport.job(id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 0);
        assert!(job.last_error.is_none());
    }

    #[tokio::test]
    async fn test_retry_rejects_non_failed() {
        let transport = MemoryTransport::new(test_config());
        let job = make_job("idle", JobOptions::new());
        let id = job.id;
        transport.add(job).await.unwrap();

        let err = transport.retry(id).await.unwrap_err();
        assert!(matches!(err, QueueError::Conflict(_)));

        let err = transport.retry(JobId::new_v4()).await.unwrap_err();
        assert!(matches!(err, QueueError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_overflow() {
        let mut config = test_config();
        config.memory.max_jobs = 2;
        let transport = MemoryTransport::new(config);

        transport.add(make_job("a", JobOptions::new())).await.unwrap();
        transport.add(make_job("a", JobOptions::new())).await.unwrap();
        let err = transport
            .add(make_job("a", JobOptions::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Overflow(2)));
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let transport = MemoryTransport::new(test_config());
        transport.pause(Some("mail")).await.unwrap();

        let job = make_job("mail", JobOptions::new());
        let id = job.id;
        transport.add(job).await.unwrap();

        let stats = transport.stats(None).await.unwrap();
        assert_eq!(stats.paused, 1);

        // Idempotent
        transport.pause(Some("mail")).await.unwrap();
        assert_eq!(transport.stats(None).await.unwrap().paused, 1);

        transport.resume(Some("mail")).await.unwrap();
        let job = transport.job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Waiting);
    }

    #[tokio::test]
    async fn test_delayed_promotion() {
        let transport = MemoryTransport::new(test_config());
        transport
            .process("report", Arc::new(FnHandler::new(|_| async { Ok(json!("ok")) })))
            .await
            .unwrap();

        let job = make_job("report", JobOptions::new().with_delay_ms(100));
        let id = job.id;
        transport.add(job).await.unwrap();

        assert_eq!(
            transport.job(id).await.unwrap().unwrap().status,
            JobStatus::Delayed
        );
        wait_for(&transport, |s| s.completed == 1, 3_000).await;
        assert_eq!(
            transport.job(id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_retention_bound() {
        let transport = MemoryTransport::new(test_config());
        transport
            .process("burst", Arc::new(FnHandler::new(|_| async { Ok(json!(null)) })))
            .await
            .unwrap();

        for _ in 0..5 {
            let job = make_job("burst", JobOptions::new().with_remove_on_complete(2));
            transport.add(job).await.unwrap();
        }

        let stats = wait_for(&transport, |s| s.completed <= 2 && s.waiting == 0 && s.active == 0, 3_000).await;
        assert!(stats.completed <= 2, "retention kept {}", stats.completed);
    }

    #[tokio::test]
    async fn test_remove_and_clean() {
        let transport = MemoryTransport::new(test_config());

        let job = make_job("chore", JobOptions::new());
        let id = job.id;
        transport.add(job).await.unwrap();
        transport.remove(id).await.unwrap();
        assert!(transport.job(id).await.unwrap().is_none());
        assert!(matches!(
            transport.remove(id).await.unwrap_err(),
            QueueError::NotFound(_)
        ));

        // Clean with zero grace removes completed records immediately
        transport
            .process("chore", Arc::new(FnHandler::new(|_| async { Ok(json!(null)) })))
            .await
            .unwrap();
        transport.add(make_job("chore", JobOptions::new())).await.unwrap();
        wait_for(&transport, |s| s.completed == 1, 2_000).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let removed = transport
            .clean(JobStatus::Completed, Duration::from_millis(0))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let err = transport
            .clean(JobStatus::Waiting, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_close_waits_for_active_jobs() {
        let transport = MemoryTransport::new(test_config());
        transport
            .process(
                "slow",
                Arc::new(FnHandler::new(|_| async {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok(json!("done"))
                })),
            )
            .await
            .unwrap();

        let job = make_job("slow", JobOptions::new());
        let id = job.id;
        transport.add(job).await.unwrap();

        // Give the dispatcher a moment to claim it
        tokio::time::sleep(Duration::from_millis(100)).await;
        transport.close(Duration::from_secs(5)).await.unwrap();

        let job = transport.job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);

        // Intake is rejected after close; close stays idempotent
        let err = transport
            .add(make_job("slow", JobOptions::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Closed));
        transport.close(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_only_mode() {
        let mut config = test_config();
        config.worker.enabled = false;
        let transport = MemoryTransport::new(config);
        transport
            .process("idle", Arc::new(FnHandler::new(|_| async { Ok(json!(null)) })))
            .await
            .unwrap();
        transport.add(make_job("idle", JobOptions::new())).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        let stats = transport.stats(None).await.unwrap();
        assert_eq!(stats.waiting, 1);
        assert_eq!(stats.completed, 0);
    }
}
