//! Validation errors for the resource spec model.

use thiserror::Error;

/// Errors raised while validating a job or resource description.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecError {
    /// Job or queue name is not a valid DNS-1123 label.
    #[error("invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    /// Job declares no tasks.
    #[error("job {0} has no tasks")]
    NoTasks(String),

    /// A task violates `replicas >= min_available >= 1`.
    #[error("job {job} task {index}: {reason}")]
    InvalidTask {
        job: String,
        index: usize,
        reason: String,
    },

    /// Resource quantity string could not be parsed.
    #[error("invalid quantity {value:?}: {reason}")]
    InvalidQuantity { value: String, reason: String },
}

/// Result type for spec model operations.
pub type SpecResult<T> = Result<T, SpecError>;
