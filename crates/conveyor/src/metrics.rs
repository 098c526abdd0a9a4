//! In-process job metrics
//!
//! Counters describe this process's workers only; they are not shared through
//! the backend.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Attempt counters recorded by the handler wrapper
#[derive(Debug, Default)]
pub struct JobMetrics {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl JobMetrics {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful attempt
    pub fn record_success(&self, duration: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    /// Record a failed attempt
    pub fn record_failure(&self, duration: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    /// Snapshot the counters
    pub fn summary(&self) -> MetricsSummary {
        let processed = self.processed.load(Ordering::Relaxed);
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let total_duration_ms = self.total_duration_ms.load(Ordering::Relaxed);

        MetricsSummary {
            processed,
            succeeded,
            failed,
            average_duration_ms: if processed > 0 {
                total_duration_ms / processed
            } else {
                0
            },
        }
    }
}

/// Point-in-time metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    /// Attempts executed
    pub processed: u64,

    /// Attempts that returned a result
    pub succeeded: u64,

    /// Attempts that failed
    pub failed: u64,

    /// Mean handler wall time in milliseconds
    pub average_duration_ms: u64,
}

impl MetricsSummary {
    /// Fraction of attempts that succeeded
    pub fn success_rate(&self) -> f64 {
        if self.processed == 0 {
            0.0
        } else {
            self.succeeded as f64 / self.processed as f64
        }
    }

    /// Format as human-readable
    pub fn format(&self) -> String {
        format!(
            "processed={}, succeeded={}, failed={}, success_rate={:.1}%, avg_duration={}ms",
            self.processed,
            self.succeeded,
            self.failed,
            self.success_rate() * 100.0,
            self.average_duration_ms
        )
    }
}
