//! # Reclaim Types - Resource Spec Model
//!
//! Inert descriptions of the workloads a reclaim scenario submits and the
//! status projections it observes:
//!
//! - [`JobSpec`] / [`TaskSpec`]: job-groups, their task groups and gang
//!   thresholds
//! - [`ResourceList`]: CPU/memory requests and capacities
//! - [`QueueStatus`] / [`QueueCondition`]: per-dimension queue assertions
//! - [`JobStatus`]: job phase and ready replica count
//! - [`PriorityClass`]: named claim weights
//!
//! Nothing in this crate talks to a cluster.

pub mod error;
pub mod job;
pub mod priority;
pub mod resources;
pub mod status;

pub use error::{SpecError, SpecResult};
pub use job::{validate_name, JobSpec, TaskSpec};
pub use priority::{PriorityClass, HIGH_PRIORITY, LOW_PRIORITY};
pub use resources::{parse_quantity, ResourceList};
pub use status::{JobPhase, JobStatus, QueueCondition, QueueState, QueueStatus};

/// Image used for scenario tasks unless configured otherwise.
pub const DEFAULT_IMAGE: &str = "nginx:1.14";

/// Queue every cluster provides; never created or deleted by a context.
pub const DEFAULT_QUEUE: &str = "default";

/// Pod label carrying the owning job's name.
pub const JOB_NAME_LABEL: &str = "volcano.sh/job-name";
