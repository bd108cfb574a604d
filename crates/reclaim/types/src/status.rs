//! Observed status projections for queues and jobs.
//!
//! Queue status is not a single state machine: "has running groups",
//! "has pending groups" and "accepting submissions" hold independently, so
//! each dimension is asserted on its own through [`QueueCondition`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Admission state of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueState {
    Open,
    Closed,
    Closing,
    Unknown,
}

impl QueueState {
    /// Map the scheduler's status string; anything unrecognised is `Unknown`.
    pub fn from_status(value: &str) -> Self {
        match value {
            "Open" => QueueState::Open,
            "Closed" => QueueState::Closed,
            "Closing" => QueueState::Closing,
            _ => QueueState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Open => "Open",
            QueueState::Closed => "Closed",
            QueueState::Closing => "Closing",
            QueueState::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters and admission state the harness can see on a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub state: QueueState,

    /// Job-groups currently running.
    pub running: u32,

    /// Job-groups waiting for admission.
    pub pending: u32,

    /// Job-groups admitted but not yet running.
    pub inqueue: u32,
}

impl Default for QueueStatus {
    fn default() -> Self {
        Self {
            state: QueueState::Unknown,
            running: 0,
            pending: 0,
            inqueue: 0,
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "state={} running={} pending={} inqueue={}",
            self.state, self.running, self.pending, self.inqueue
        )
    }
}

/// One asserted `(dimension, expected value)` pair on a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueCondition {
    /// Admission state equals the given state.
    Admission(QueueState),

    /// Running group count equals the given value.
    Running(u32),

    /// Pending group count equals the given value.
    Pending(u32),
}

impl QueueCondition {
    pub fn open() -> Self {
        QueueCondition::Admission(QueueState::Open)
    }

    pub fn holds(&self, status: &QueueStatus) -> bool {
        match *self {
            QueueCondition::Admission(state) => status.state == state,
            QueueCondition::Running(count) => status.running == count,
            QueueCondition::Pending(count) => status.pending == count,
        }
    }
}

impl fmt::Display for QueueCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueCondition::Admission(state) => write!(f, "state == {}", state),
            QueueCondition::Running(count) => write!(f, "running == {}", count),
            QueueCondition::Pending(count) => write!(f, "pending == {}", count),
        }
    }
}

/// Lifecycle phase reported by the job controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobPhase {
    Pending,
    Running,
    Restarting,
    Completing,
    Completed,
    Aborting,
    Aborted,
    Terminating,
    Terminated,
    Failed,
    Unknown,
}

impl JobPhase {
    pub fn from_status(value: &str) -> Self {
        match value {
            "Pending" => JobPhase::Pending,
            "Running" => JobPhase::Running,
            "Restarting" => JobPhase::Restarting,
            "Completing" => JobPhase::Completing,
            "Completed" => JobPhase::Completed,
            "Aborting" => JobPhase::Aborting,
            "Aborted" => JobPhase::Aborted,
            "Terminating" => JobPhase::Terminating,
            "Terminated" => JobPhase::Terminated,
            "Failed" => JobPhase::Failed,
            _ => JobPhase::Unknown,
        }
    }
}

/// Observed state of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub phase: JobPhase,

    /// Gang threshold declared on the job.
    pub min_available: u32,

    /// Replicas whose pods are Running or Succeeded.
    pub ready_tasks: u32,
}

impl JobStatus {
    /// Ready once at least `min_available` replicas are up.
    pub fn is_ready(&self) -> bool {
        self.ready_tasks >= self.min_available
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "phase={:?} ready={}/{}",
            self.phase, self.ready_tasks, self.min_available
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(QueueState::from_status("Open"), QueueState::Open);
        assert_eq!(QueueState::from_status("open"), QueueState::Unknown);
        assert_eq!(JobPhase::from_status("Pending"), JobPhase::Pending);
        assert_eq!(JobPhase::from_status(""), JobPhase::Unknown);
    }

    #[test]
    fn test_dimensions_hold_simultaneously() {
        let status = QueueStatus {
            state: QueueState::Open,
            running: 1,
            pending: 1,
            inqueue: 0,
        };
        assert!(QueueCondition::open().holds(&status));
        assert!(QueueCondition::Running(1).holds(&status));
        assert!(QueueCondition::Pending(1).holds(&status));
        assert!(!QueueCondition::Running(2).holds(&status));
    }

    #[test]
    fn test_job_ready_threshold() {
        let mut status = JobStatus {
            phase: JobPhase::Running,
            min_available: 2,
            ready_tasks: 1,
        };
        assert!(!status.is_ready());
        status.ready_tasks = 3;
        assert!(status.is_ready());
    }

    #[test]
    fn test_condition_display() {
        assert_eq!(QueueCondition::Pending(1).to_string(), "pending == 1");
        assert_eq!(QueueCondition::open().to_string(), "state == Open");
    }

    proptest! {
        #[test]
        fn count_conditions_are_exact(running in 0u32..16, pending in 0u32..16, want in 0u32..16) {
            let status = QueueStatus { state: QueueState::Open, running, pending, inqueue: 0 };
            prop_assert_eq!(QueueCondition::Running(want).holds(&status), running == want);
            prop_assert_eq!(QueueCondition::Pending(want).holds(&status), pending == want);
        }
    }
}
