//! Scenario failures.

use reclaim_context::ContextError;
use reclaim_poller::PollError;
use thiserror::Error;

/// Why a scenario failed.
#[derive(Debug, Error)]
pub enum ScenarioError {
    /// A wait ended without its condition holding.
    #[error("step '{step}' failed: {condition} not met ({reason}); last observed: {last_observed}")]
    ConditionUnmet {
        step: String,
        condition: String,
        reason: String,
        last_observed: String,
    },

    /// A submission that had to be rejected was accepted.
    #[error("step '{step}': job {job} was accepted by queue {queue}")]
    UnexpectedSubmission {
        step: String,
        job: String,
        queue: String,
    },

    /// Not enough capacity to derive a meaningful reclaim target.
    #[error("cluster too small: {slots} slots give a per-queue share of {share}")]
    ClusterTooSmall { slots: u32, share: u32 },

    #[error("step '{step}' failed: {source}")]
    Context {
        step: String,
        #[source]
        source: ContextError,
    },
}

impl ScenarioError {
    /// Attribute a context error to the step it broke.
    pub fn at_step(step: impl Into<String>, err: ContextError) -> Self {
        let step = step.into();
        match err {
            ContextError::Wait(poll) => {
                let condition = poll.condition().to_string();
                let last_observed = poll
                    .last_observed()
                    .unwrap_or("<nothing>")
                    .to_string();
                let reason = match &poll {
                    PollError::Structural { reason, .. } => reason.clone(),
                    PollError::TimedOut {
                        elapsed, attempts, ..
                    } => format!("timed out after {:?} and {} attempts", elapsed, attempts),
                };
                ScenarioError::ConditionUnmet {
                    step,
                    condition,
                    reason,
                    last_observed,
                }
            }
            source => ScenarioError::Context { step, source },
        }
    }
}

/// Result type for scenarios.
pub type ScenarioResult<T> = Result<T, ScenarioError>;

#[cfg(test)]
mod tests {
    use super::*;
    use reclaim_context::ClusterError;
    use std::time::Duration;

    #[test]
    fn test_timeout_becomes_condition_unmet() {
        let poll = PollError::TimedOut {
            condition: "queue q3 pending == 1".into(),
            elapsed: Duration::from_secs(60),
            last_observed: Some("QueueStatus { pending: 0 }".into()),
            attempts: 600,
        };
        let err = ScenarioError::at_step("q3 pending", ContextError::Wait(poll));
        let text = err.to_string();
        assert!(text.contains("queue q3 pending == 1"), "{}", text);
        assert!(text.contains("last observed: QueueStatus { pending: 0 }"), "{}", text);
        assert!(matches!(err, ScenarioError::ConditionUnmet { .. }));
    }

    #[test]
    fn test_other_errors_keep_their_source() {
        let err = ScenarioError::at_step(
            "submit",
            ContextError::Cluster(ClusterError::Forbidden("rbac".into())),
        );
        assert!(matches!(err, ScenarioError::Context { .. }));
        assert!(err.to_string().contains("forbidden: rbac"));
    }
}
