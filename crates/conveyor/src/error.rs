//! Error types for the queue

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, QueueError>;

/// Main error type for queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    /// Caller supplied a bad input (job type, payload, delay, id, status)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Transport-layer I/O failure (Redis, SQL)
    #[error("backend error: {0}")]
    Backend(String),

    /// A user handler returned an error or panicked
    #[error("handler failed: {0}")]
    HandlerFailure(String),

    /// Memory transport reached its job cap
    #[error("queue is full: memory transport holds {0} jobs")]
    Overflow(usize),

    /// Operation conflicts with the current state of a job or the queue
    #[error("conflict: {0}")]
    Conflict(String),

    /// Operation referenced an unknown job id
    #[error("job not found: {0}")]
    NotFound(String),

    /// Operation arrived after `close()` started
    #[error("queue is closed")]
    Closed,
}

impl QueueError {
    /// Create a new invalid-argument error
    pub fn invalid<T: Into<String>>(msg: T) -> Self {
        QueueError::InvalidArgument(msg.into())
    }

    /// Create a new backend error
    pub fn backend<T: Into<String>>(msg: T) -> Self {
        QueueError::Backend(msg.into())
    }

    /// Create a new conflict error
    pub fn conflict<T: Into<String>>(msg: T) -> Self {
        QueueError::Conflict(msg.into())
    }

    /// Get error category for monitoring
    pub fn category(&self) -> &'static str {
        match self {
            QueueError::InvalidArgument(_) => "invalid_argument",
            QueueError::Backend(_) => "backend",
            QueueError::HandlerFailure(_) => "handler_failure",
            QueueError::Overflow(_) => "overflow",
            QueueError::Conflict(_) => "conflict",
            QueueError::NotFound(_) => "not_found",
            QueueError::Closed => "closed",
        }
    }
}

// Conversions from external error types
impl From<sqlx::Error> for QueueError {
    fn from(error: sqlx::Error) -> Self {
        QueueError::Backend(format!("database: {}", error))
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(error: redis::RedisError) -> Self {
        QueueError::Backend(format!("redis: {}", error))
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(error: serde_json::Error) -> Self {
        QueueError::Backend(format!("serialization: {}", error))
    }
}

/// Error returned by a job handler.
///
/// Handlers report failure as a message; the transport owns the retry
/// decision, so nothing richer than a description crosses this boundary.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct HandlerError {
    /// Human-readable failure description, stored as the job's `last_error`
    pub message: String,
}

impl HandlerError {
    /// Create a new handler error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self {
            message: message.to_owned(),
        }
    }
}

/// Result type produced by job handlers
pub type HandlerResult = std::result::Result<serde_json::Value, HandlerError>;
