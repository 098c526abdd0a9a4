//! Storage and dispatch backends
//!
//! Every backend implements the same capability set behind [`Transport`]; the
//! façade selects exactly one per queue instance and never changes it.

pub mod database;
pub mod memory;
pub mod redis;

use crate::error::{HandlerError, HandlerResult, Result};
use crate::job::{Job, JobId, JobInfo, JobStatus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Largest page returned by job listings
pub const MAX_JOBS_PAGE: usize = 1_000;

/// Available backend implementations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Single-process in-memory store
    Memory,

    /// Distributed store over Redis
    Redis,

    /// SQL-table-backed store
    Database,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Memory => write!(f, "memory"),
            TransportKind::Redis => write!(f, "redis"),
            TransportKind::Database => write!(f, "database"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(TransportKind::Memory),
            "redis" => Ok(TransportKind::Redis),
            "database" => Ok(TransportKind::Database),
            other => Err(format!("{} is not a valid transport", other)),
        }
    }
}

/// Counts of jobs by status
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Jobs eligible for dispatch
    pub waiting: u64,

    /// Jobs currently executing
    pub active: u64,

    /// Jobs finished successfully
    pub completed: u64,

    /// Jobs that exhausted their attempts
    pub failed: u64,

    /// Jobs waiting for their `available_at`
    pub delayed: u64,

    /// Jobs held back by a pause
    pub paused: u64,
}

impl QueueStats {
    /// Total jobs across all statuses
    pub fn total(&self) -> u64 {
        self.waiting + self.active + self.completed + self.failed + self.delayed + self.paused
    }

    /// Add a job with the given status to the counts
    pub fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Waiting => self.waiting += 1,
            JobStatus::Active => self.active += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Delayed => self.delayed += 1,
            JobStatus::Paused => self.paused += 1,
        }
    }

    /// Format as human-readable
    pub fn format(&self) -> String {
        format!(
            "waiting={}, active={}, completed={}, failed={}, delayed={}, paused={}",
            self.waiting, self.active, self.completed, self.failed, self.delayed, self.paused
        )
    }
}

/// Overall backend condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Backend reachable and fully functional
    Healthy,

    /// Partially functional (e.g. pub/sub lost, fallback in use)
    Degraded,

    /// Backend unreachable
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health report for a queue instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    /// Overall condition
    pub status: HealthStatus,

    /// Backend in use
    pub transport: TransportKind,

    /// Details when not healthy
    pub message: Option<String>,
}

impl Health {
    /// Healthy report for a transport
    pub fn healthy(transport: TransportKind) -> Self {
        Self {
            status: HealthStatus::Healthy,
            transport,
            message: None,
        }
    }

    /// Degraded report with a reason
    pub fn degraded(transport: TransportKind, message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            transport,
            message: Some(message.into()),
        }
    }

    /// Unhealthy report with a reason
    pub fn unhealthy(transport: TransportKind, message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            transport,
            message: Some(message.into()),
        }
    }

    /// Format as human-readable
    pub fn format(&self) -> String {
        match &self.message {
            Some(msg) => format!("{} ({}): {}", self.status, self.transport, msg),
            None => format!("{} ({})", self.status, self.transport),
        }
    }
}

/// User code invoked once per job attempt.
///
/// Handlers must be idempotent with respect to the job's effects: delivery is
/// at-least-once on every transport.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute one attempt against the job's payload
    async fn handle(&self, data: serde_json::Value) -> HandlerResult;
}

/// Adapter so plain async closures can be registered as handlers
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    /// Wrap a closure
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, data: serde_json::Value) -> HandlerResult {
        (self.f)(data).await
    }
}

/// Run a handler inside its own task so a panic becomes a failure instead of
/// taking the worker loop down.
pub(crate) async fn run_handler(
    handler: Arc<dyn JobHandler>,
    data: serde_json::Value,
) -> HandlerResult {
    match tokio::spawn(async move { handler.handle(data).await }).await {
        Ok(result) => result,
        Err(join_error) => Err(HandlerError::new(format!(
            "handler panicked: {}",
            join_error
        ))),
    }
}

/// Order descriptors by `created_at` ascending, ties broken by id, and cap the
/// page size.
pub(crate) fn finish_listing(mut jobs: Vec<JobInfo>) -> Vec<JobInfo> {
    jobs.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    jobs.truncate(MAX_JOBS_PAGE);
    jobs
}

/// Storage and dispatch contract implemented by every backend
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which backend this is
    fn kind(&self) -> TransportKind;

    /// Persist a new job (immediate or delayed)
    async fn add(&self, job: Job) -> Result<()>;

    /// Register the handler for a job type and start dispatching it
    async fn process(&self, job_type: &str, handler: Arc<dyn JobHandler>) -> Result<()>;

    /// Stop dispatching one type, or all types when `None`
    async fn pause(&self, job_type: Option<&str>) -> Result<()>;

    /// Undo a pause
    async fn resume(&self, job_type: Option<&str>) -> Result<()>;

    /// Counts by status, optionally filtered by type
    async fn stats(&self, job_type: Option<&str>) -> Result<QueueStats>;

    /// Descriptors of jobs in a status, capped at [`MAX_JOBS_PAGE`]
    async fn jobs(&self, status: JobStatus, job_type: Option<&str>) -> Result<Vec<JobInfo>>;

    /// Fetch a full job record
    async fn job(&self, id: JobId) -> Result<Option<Job>>;

    /// Reset a failed job back to waiting
    async fn retry(&self, id: JobId) -> Result<()>;

    /// Remove a non-active job
    async fn remove(&self, id: JobId) -> Result<()>;

    /// Delete terminal records older than `grace`; returns how many
    async fn clean(&self, status: JobStatus, grace: Duration) -> Result<u64>;

    /// Current backend condition
    async fn health(&self) -> Health;

    /// Stop dispatch, wait for in-flight handlers up to `timeout`, release
    /// resources
    async fn close(&self, timeout: Duration) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transport_kind_parsing() {
        assert_eq!("memory".parse::<TransportKind>().unwrap(), TransportKind::Memory);
        assert_eq!("Redis".parse::<TransportKind>().unwrap(), TransportKind::Redis);
        assert!("kafka".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_stats_record_and_format() {
        let mut stats = QueueStats::default();
        stats.record(JobStatus::Waiting);
        stats.record(JobStatus::Waiting);
        stats.record(JobStatus::Failed);

        assert_eq!(stats.waiting, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total(), 3);
        assert!(stats.format().contains("waiting=2"));
    }

    #[test]
    fn test_health_format() {
        let health = Health::degraded(TransportKind::Redis, "pub/sub unavailable");
        assert!(health.format().contains("degraded"));
        assert!(health.format().contains("pub/sub unavailable"));
    }

    #[tokio::test]
    async fn test_fn_handler() {
        let handler = FnHandler::new(|data: serde_json::Value| async move {
            Ok(json!({ "echo": data }))
        });
        let result = handler.handle(json!(42)).await.unwrap();
        assert_eq!(result, json!({ "echo": 42 }));
    }

    #[tokio::test]
    async fn test_run_handler_catches_panic() {
        let handler: Arc<dyn JobHandler> =
            Arc::new(FnHandler::new(|_| async { panic!("boom") }));
        let result = run_handler(handler, json!({})).await;
        assert!(result.unwrap_err().message.contains("panicked"));
    }

    #[test]
    fn test_finish_listing_orders_and_caps() {
        let mut jobs = Vec::new();
        for i in (0..5).rev() {
            let job = Job::new(JobId::new_v4(), "t", json!({}));
            let mut info = job.info();
            info.created_at = i;
            jobs.push(info);
        }

        let listed = finish_listing(jobs);
        let times: Vec<i64> = listed.iter().map(|j| j.created_at).collect();
        assert_eq!(times, vec![0, 1, 2, 3, 4]);
    }
}
