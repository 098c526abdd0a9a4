//! Retry delay computation for failed jobs

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Default base delay when no policy was configured
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1_000);

/// Cap applied to exponential growth
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Backoff strategy between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Same delay after every failed attempt
    Fixed,

    /// Delay doubles with each failed attempt, capped at `max_delay`
    Exponential,
}

impl Default for BackoffKind {
    fn default() -> Self {
        BackoffKind::Exponential
    }
}

impl std::fmt::Display for BackoffKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackoffKind::Fixed => write!(f, "fixed"),
            BackoffKind::Exponential => write!(f, "exponential"),
        }
    }
}

impl FromStr for BackoffKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fixed" => Ok(BackoffKind::Fixed),
            "exponential" => Ok(BackoffKind::Exponential),
            other => Err(format!("{} is not a valid backoff kind", other)),
        }
    }
}

/// Retry policy applied when a handler fails with attempts remaining
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Backoff strategy
    pub kind: BackoffKind,

    /// Delay for the first retry (and every retry when fixed)
    pub base_delay: Duration,

    /// Upper bound on any computed delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            kind: BackoffKind::default(),
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy with the default cap
    pub fn new(kind: BackoffKind, base_delay: Duration) -> Self {
        Self {
            kind,
            base_delay,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }

    /// Override the delay cap
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay before the next attempt.
    ///
    /// `attempt` is 1-indexed and counts the attempt that just failed, so the
    /// first retry of a job sees `attempt == 1`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.kind {
            BackoffKind::Fixed => self.base_delay.min(self.max_delay),
            BackoffKind::Exponential => {
                // 2^(attempt-1) saturates well before u64 overflow
                let exponent = attempt.saturating_sub(1).min(30);
                let base_ms = self.base_delay.as_millis() as u64;
                let delay_ms = base_ms.saturating_mul(1u64 << exponent);
                Duration::from_millis(delay_ms).min(self.max_delay)
            }
        }
    }
}
