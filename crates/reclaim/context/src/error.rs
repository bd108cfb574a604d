//! Error types for cluster access and context lifecycle.

use reclaim_poller::{Classify, ErrorClass, PollError};
use reclaim_types::SpecError;
use thiserror::Error;

/// Errors returned by a [`ClusterApi`](crate::ClusterApi) implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterError {
    /// Object is not (or not yet) visible.
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    /// Submission referenced a queue that does not exist.
    #[error("queue {0} does not exist")]
    QueueNotFound(String),

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Request rejected as malformed or failing validation.
    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("cannot decode {kind} {name}: {reason}")]
    Decode {
        kind: &'static str,
        name: String,
        reason: String,
    },
}

impl ClusterError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        ClusterError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }
}

impl Classify for ClusterError {
    fn class(&self) -> ErrorClass {
        match self {
            ClusterError::NotFound { .. } => ErrorClass::Absent,
            _ => ErrorClass::Structural,
        }
    }
}

/// Result type for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors surfaced by a [`TestContext`](crate::TestContext).
#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error(transparent)]
    Wait(#[from] PollError),

    /// Fewer schedulable nodes than the configured node-count ceiling.
    #[error("need {required} schedulable nodes, cluster has {available}")]
    InsufficientNodes { required: u32, available: u32 },

    /// Operation attempted after teardown.
    #[error("context {0} has already been torn down")]
    TornDown(String),
}

impl ContextError {
    /// Whether this is the expected-negative "queue does not exist" outcome.
    pub fn is_queue_not_found(&self) -> bool {
        matches!(self, ContextError::Cluster(ClusterError::QueueNotFound(_)))
    }
}

/// Result type for context operations.
pub type ContextResult<T> = Result<T, ContextError>;
