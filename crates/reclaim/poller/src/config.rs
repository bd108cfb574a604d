//! Polling cadence and deadline.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Cadence and overall deadline for one wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    /// Delay between two observations, in milliseconds.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Deadline for the whole wait, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl PollConfig {
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// 100ms cadence, one minute deadline.
    pub const fn one_minute() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(60))
    }

    /// 100ms cadence, two minute deadline.
    pub const fn two_minutes() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(120))
    }

    pub fn interval(&self) -> Duration {
        // A zero interval would spin; clamp to one millisecond.
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::one_minute()
    }
}

fn default_interval_ms() -> u64 {
    100
}

fn default_timeout_ms() -> u64 {
    60_000
}
