//! Error classification and poll failures.

use std::time::Duration;

use thiserror::Error;

/// How the poller must react to an observation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The object is not visible. Retried until it has been seen once;
    /// after that it means the object was deleted.
    Absent,

    /// The condition can never be observed: permission denial, malformed
    /// request, undecodable object. Aborts immediately.
    Structural,
}

/// Implemented by every error an observation can return.
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

/// A wait that did not observe its condition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
    /// Aborted on an unrecoverable observation error.
    #[error(
        "{condition}: aborted after {attempts} attempt(s): {reason}; last observed: {}",
        observed(.last_observed)
    )]
    Structural {
        condition: String,
        reason: String,
        last_observed: Option<String>,
        attempts: u32,
    },

    /// Deadline elapsed with the condition never observed.
    #[error(
        "{condition}: not observed within {elapsed:?} ({attempts} attempt(s)); last observed: {}",
        observed(.last_observed)
    )]
    TimedOut {
        condition: String,
        elapsed: Duration,
        last_observed: Option<String>,
        attempts: u32,
    },
}

impl PollError {
    pub fn condition(&self) -> &str {
        match self {
            PollError::Structural { condition, .. } | PollError::TimedOut { condition, .. } => {
                condition
            }
        }
    }

    pub fn last_observed(&self) -> Option<&str> {
        match self {
            PollError::Structural { last_observed, .. }
            | PollError::TimedOut { last_observed, .. } => last_observed.as_deref(),
        }
    }
}

fn observed(last: &Option<String>) -> &str {
    last.as_deref().unwrap_or("<nothing>")
}

/// Result type for waits.
pub type PollResult<T> = Result<T, PollError>;
