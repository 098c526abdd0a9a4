//! Job types and lifecycle

use crate::error::{QueueError, Result};
use crate::retry::BackoffKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique job identifier
pub type JobId = Uuid;

/// Current Unix time in milliseconds
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Eligible for dispatch
    Waiting,

    /// Claimed by a worker and executing
    Active,

    /// Finished successfully
    Completed,

    /// Exhausted its attempts
    Failed,

    /// Waiting for `available_at` to pass
    Delayed,

    /// Held back by a pause of its type or of the whole queue
    Paused,
}

impl Default for JobStatus {
    fn default() -> Self {
        JobStatus::Waiting
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl JobStatus {
    /// Status as its persisted string form
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Delayed => "delayed",
            JobStatus::Paused => "paused",
        }
    }

    /// Check if the status never transitions further (except via retry)
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "waiting" => Ok(JobStatus::Waiting),
            "active" => Ok(JobStatus::Active),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "delayed" => Ok(JobStatus::Delayed),
            "paused" => Ok(JobStatus::Paused),
            invalid => Err(QueueError::invalid(format!(
                "{} is not a valid job status",
                invalid
            ))),
        }
    }
}

/// Per-job options merged over the queue defaults at enqueue time
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct JobOptions {
    /// Dispatch priority (higher runs first)
    pub priority: Option<i32>,

    /// Retry ceiling
    pub max_attempts: Option<u32>,

    /// Backoff strategy
    pub backoff: Option<BackoffKind>,

    /// Base retry delay in milliseconds
    pub retry_delay_ms: Option<u64>,

    /// Delay before the job becomes eligible, in milliseconds
    pub delay_ms: Option<u64>,

    /// Retained completed jobs of this type
    pub remove_on_complete: Option<u32>,

    /// Retained failed jobs of this type
    pub remove_on_fail: Option<u32>,
}

impl JobOptions {
    /// Create empty options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set dispatch priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set retry ceiling
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set backoff strategy
    pub fn with_backoff(mut self, backoff: BackoffKind) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Set base retry delay
    pub fn with_retry_delay_ms(mut self, retry_delay_ms: u64) -> Self {
        self.retry_delay_ms = Some(retry_delay_ms);
        self
    }

    /// Set eligibility delay
    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = Some(delay_ms);
        self
    }

    /// Set completed retention bound
    pub fn with_remove_on_complete(mut self, bound: u32) -> Self {
        self.remove_on_complete = Some(bound);
        self
    }

    /// Set failed retention bound
    pub fn with_remove_on_fail(mut self, bound: u32) -> Self {
        self.remove_on_fail = Some(bound);
        self
    }
}

/// Canonical job record shared by all transports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,

    /// Job type, routes to a handler
    pub job_type: String,

    /// Opaque JSON payload
    pub data: serde_json::Value,

    /// Lifecycle status
    pub status: JobStatus,

    /// Dispatch priority (higher runs first)
    pub priority: i32,

    /// Executions started so far
    pub attempts: u32,

    /// Retry ceiling
    pub max_attempts: u32,

    /// Backoff strategy for retries
    pub backoff: BackoffKind,

    /// Base retry delay in milliseconds
    pub retry_delay_ms: u64,

    /// Enqueue delay in milliseconds (0 = immediate)
    pub delay_ms: u64,

    /// Unix ms when the job becomes eligible
    pub available_at: i64,

    /// Unix ms of enqueue
    pub created_at: i64,

    /// Unix ms when the latest attempt started
    pub started_at: Option<i64>,

    /// Unix ms of successful completion
    pub completed_at: Option<i64>,

    /// Unix ms of terminal failure
    pub failed_at: Option<i64>,

    /// Error message from the last failed attempt
    pub last_error: Option<String>,

    /// Value returned by the successful handler invocation
    pub result: Option<serde_json::Value>,

    /// Retained completed jobs of this type
    pub remove_on_complete: u32,

    /// Retained failed jobs of this type
    pub remove_on_fail: u32,

    /// Times this job was reclaimed after its lease expired
    pub stalled_count: u32,
}

impl Job {
    /// Create a job in its initial state.
    ///
    /// The façade assigns the id and merges options before handing the record
    /// to a transport; `status` and `available_at` reflect the delay.
    pub fn new(id: JobId, job_type: impl Into<String>, data: serde_json::Value) -> Self {
        let now = now_ms();
        Self {
            id,
            job_type: job_type.into(),
            data,
            status: JobStatus::Waiting,
            priority: 0,
            attempts: 0,
            max_attempts: 3,
            backoff: BackoffKind::default(),
            retry_delay_ms: 1_000,
            delay_ms: 0,
            available_at: now,
            created_at: now,
            started_at: None,
            completed_at: None,
            failed_at: None,
            last_error: None,
            result: None,
            remove_on_complete: 100,
            remove_on_fail: 100,
            stalled_count: 0,
        }
    }

    /// Check if the job is eligible for dispatch at `now`
    pub fn is_due(&self, now: i64) -> bool {
        self.available_at <= now
    }

    /// Transition to active for a new attempt
    pub fn mark_started(&mut self, now: i64) {
        self.status = JobStatus::Active;
        self.started_at = Some(now);
        self.attempts += 1;
    }

    /// Transition to completed with the handler's result
    pub fn mark_completed(&mut self, now: i64, result: serde_json::Value) {
        self.status = JobStatus::Completed;
        self.completed_at = Some(now);
        self.result = Some(result);
    }

    /// Transition to terminal failure
    pub fn mark_failed(&mut self, now: i64, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.failed_at = Some(now);
        self.last_error = Some(error.into());
    }

    /// Transition back to delayed (or waiting) for a retry
    pub fn mark_retrying(&mut self, available_at: i64, now: i64, error: impl Into<String>) {
        self.last_error = Some(error.into());
        self.available_at = available_at;
        self.status = if available_at > now {
            JobStatus::Delayed
        } else {
            JobStatus::Waiting
        };
    }

    /// Reset a failed job so it runs again from scratch
    pub fn reset_for_retry(&mut self, now: i64) {
        self.status = JobStatus::Waiting;
        self.attempts = 0;
        self.stalled_count = 0;
        self.last_error = None;
        self.failed_at = None;
        self.available_at = now;
    }

    /// Public descriptor for listings
    pub fn info(&self) -> JobInfo {
        JobInfo {
            id: self.id,
            job_type: self.job_type.clone(),
            status: self.status,
            priority: self.priority,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            created_at: self.created_at,
            available_at: self.available_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            failed_at: self.failed_at,
            last_error: self.last_error.clone(),
        }
    }

    /// Encode as Redis hash fields; `data` and `result` are JSON-encoded
    pub fn to_redis_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("id", self.id.to_string()),
            ("job_type", self.job_type.clone()),
            ("data", self.data.to_string()),
            ("status", self.status.as_str().to_owned()),
            ("priority", self.priority.to_string()),
            ("attempts", self.attempts.to_string()),
            ("max_attempts", self.max_attempts.to_string()),
            ("backoff", self.backoff.to_string()),
            ("retry_delay_ms", self.retry_delay_ms.to_string()),
            ("delay_ms", self.delay_ms.to_string()),
            ("available_at", self.available_at.to_string()),
            ("created_at", self.created_at.to_string()),
            ("remove_on_complete", self.remove_on_complete.to_string()),
            ("remove_on_fail", self.remove_on_fail.to_string()),
            ("stalled_count", self.stalled_count.to_string()),
        ];
        if let Some(started_at) = self.started_at {
            fields.push(("started_at", started_at.to_string()));
        }
        if let Some(completed_at) = self.completed_at {
            fields.push(("completed_at", completed_at.to_string()));
        }
        if let Some(failed_at) = self.failed_at {
            fields.push(("failed_at", failed_at.to_string()));
        }
        if let Some(ref last_error) = self.last_error {
            fields.push(("last_error", last_error.clone()));
        }
        if let Some(ref result) = self.result {
            fields.push(("result", result.to_string()));
        }
        fields
    }

    /// Decode from a Redis hash
    pub fn from_redis_map(map: &HashMap<String, String>) -> Result<Self> {
        fn required<'a>(map: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
            map.get(key)
                .map(|s| s.as_str())
                .ok_or_else(|| QueueError::backend(format!("job record missing field {}", key)))
        }

        fn parsed<T: FromStr>(map: &HashMap<String, String>, key: &str) -> Result<T> {
            required(map, key)?.parse::<T>().map_err(|_| {
                QueueError::backend(format!("job record has malformed field {}", key))
            })
        }

        fn optional_i64(map: &HashMap<String, String>, key: &str) -> Result<Option<i64>> {
            match map.get(key) {
                Some(raw) => raw
                    .parse::<i64>()
                    .map(Some)
                    .map_err(|_| QueueError::backend(format!("job record has malformed field {}", key))),
                None => Ok(None),
            }
        }

        let data: serde_json::Value = serde_json::from_str(required(map, "data")?)
            .map_err(|e| QueueError::backend(format!("job data is not valid JSON: {}", e)))?;
        let result = match map.get("result") {
            Some(raw) => Some(
                serde_json::from_str(raw)
                    .map_err(|e| QueueError::backend(format!("job result is not valid JSON: {}", e)))?,
            ),
            None => None,
        };
        let backoff = required(map, "backoff")?
            .parse::<BackoffKind>()
            .map_err(QueueError::backend)?;

        Ok(Self {
            id: parsed(map, "id")?,
            job_type: required(map, "job_type")?.to_owned(),
            data,
            status: required(map, "status")?.parse()?,
            priority: parsed(map, "priority")?,
            attempts: parsed(map, "attempts")?,
            max_attempts: parsed(map, "max_attempts")?,
            backoff,
            retry_delay_ms: parsed(map, "retry_delay_ms")?,
            delay_ms: parsed(map, "delay_ms")?,
            available_at: parsed(map, "available_at")?,
            created_at: parsed(map, "created_at")?,
            started_at: optional_i64(map, "started_at")?,
            completed_at: optional_i64(map, "completed_at")?,
            failed_at: optional_i64(map, "failed_at")?,
            last_error: map.get("last_error").cloned(),
            result,
            remove_on_complete: parsed(map, "remove_on_complete")?,
            remove_on_fail: parsed(map, "remove_on_fail")?,
            stalled_count: parsed(map, "stalled_count")?,
        })
    }
}

/// Job descriptor returned by listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    /// Job ID
    pub id: JobId,

    /// Job type
    pub job_type: String,

    /// Lifecycle status
    pub status: JobStatus,

    /// Dispatch priority
    pub priority: i32,

    /// Executions started so far
    pub attempts: u32,

    /// Retry ceiling
    pub max_attempts: u32,

    /// Unix ms of enqueue
    pub created_at: i64,

    /// Unix ms when the job becomes eligible
    pub available_at: i64,

    /// Unix ms when the latest attempt started
    pub started_at: Option<i64>,

    /// Unix ms of successful completion
    pub completed_at: Option<i64>,

    /// Unix ms of terminal failure
    pub failed_at: Option<i64>,

    /// Error message from the last failed attempt
    pub last_error: Option<String>,
}
