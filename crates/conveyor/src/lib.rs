//! Conveyor: a pluggable background job queue
//!
//! Applications enqueue typed units of work and have them executed
//! asynchronously by workers with retries, priorities, delays and persistence.
//! Three interchangeable transports sit behind one contract: an in-process
//! memory store, a Redis-backed distributed store, and a SQL-table-backed
//! store (PostgreSQL, MySQL, SQLite). The transport is auto-detected from
//! configuration and fixed for the life of a queue instance.
//!
//! ```no_run
//! use conveyor::{Queue, QueueConfig, JobOptions};
//! use serde_json::json;
//!
//! # async fn example() -> conveyor::Result<()> {
//! let queue = Queue::new(QueueConfig::from_env()?).await?;
//! queue
//!     .process_fn("email", |data| async move {
//!         // deliver the email described by `data`
//!         Ok(json!({"delivered": true}))
//!     })
//!     .await?;
//! let id = queue.add("email", json!({"to": "a@b"}), JobOptions::new()).await?;
//! println!("enqueued {}", id);
//! # Ok(())
//! # }
//! ```
//!
//! Delivery is at-least-once on every transport; handlers must be idempotent
//! with respect to the job's effects.

pub mod config;
pub mod error;
pub mod job;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod transport;

// Re-export commonly used types
pub use config::{DatabaseConfig, MemoryConfig, QueueConfig, RedisConfig, WorkerConfig};
pub use error::{HandlerError, HandlerResult, QueueError, Result};
pub use job::{Job, JobId, JobInfo, JobOptions, JobStatus};
pub use metrics::{JobMetrics, MetricsSummary};
pub use queue::Queue;
pub use retry::{BackoffKind, RetryPolicy};
pub use transport::{
    FnHandler, Health, HealthStatus, JobHandler, QueueStats, Transport, TransportKind,
};

/// Current version of conveyor
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
