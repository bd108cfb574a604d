//! The cluster surface consumed by the harness.
//!
//! Everything the scenarios need from the orchestration platform goes
//! through [`ClusterApi`]; [`KubeCluster`](crate::KubeCluster) talks to a
//! live API server and `InMemoryCluster` backs the unit tests.

use async_trait::async_trait;
use reclaim_types::{JobStatus, PriorityClass, QueueStatus, ResourceList, TaskSpec};
use serde::{Deserialize, Serialize};

use crate::error::ClusterResult;

/// Label put on every placeholder pod.
pub const PLACEHOLDER_LABEL: &str = "reclaim.harness/placeholder";

/// Label put on every cluster-scoped object a context creates.
pub const RUN_ID_LABEL: &str = "reclaim.harness/run-id";

/// A job with every logical name resolved, ready to be created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSubmission {
    pub name: String,

    /// Physical queue name.
    pub queue: String,

    /// Physical priority class name.
    pub priority_class: Option<String>,

    pub tasks: Vec<TaskSpec>,

    /// Sum of task minimums.
    pub min_available: u32,
}

/// Reference to a created job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub namespace: String,
    pub name: String,
    pub queue: String,
    pub min_available: u32,
}

/// Capacity of one schedulable node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCapacity {
    pub name: String,
    pub allocatable: ResourceList,

    /// Sum of requests of non-terminal pods bound to the node.
    pub requested: ResourceList,
}

impl NodeCapacity {
    pub fn free(&self) -> ResourceList {
        self.allocatable.saturating_sub(&self.requested)
    }
}

/// Read/write access to the orchestration platform.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn create_namespace(&self, name: &str, run_id: &str) -> ClusterResult<()>;

    async fn delete_namespace(&self, name: &str) -> ClusterResult<()>;

    async fn namespace_exists(&self, name: &str) -> ClusterResult<bool>;

    async fn create_queue(&self, name: &str, weight: u32, run_id: &str) -> ClusterResult<()>;

    async fn get_queue(&self, name: &str) -> ClusterResult<QueueStatus>;

    /// Move the queue to the Closed state so it can be deleted.
    async fn close_queue(&self, name: &str) -> ClusterResult<()>;

    async fn delete_queue(&self, name: &str) -> ClusterResult<()>;

    async fn create_priority_class(
        &self,
        class: &PriorityClass,
        run_id: &str,
    ) -> ClusterResult<()>;

    async fn delete_priority_class(&self, name: &str) -> ClusterResult<()>;

    /// Create a job. Fails with `QueueNotFound` when the queue is missing.
    async fn submit_job(&self, namespace: &str, job: &JobSubmission) -> ClusterResult<JobHandle>;

    async fn get_job(&self, namespace: &str, name: &str) -> ClusterResult<JobStatus>;

    /// Names of the pods carrying the job-name label.
    async fn list_job_pods(&self, namespace: &str, job: &str) -> ClusterResult<Vec<String>>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> ClusterResult<()>;

    async fn schedulable_nodes(&self) -> ClusterResult<Vec<NodeCapacity>>;

    /// Pin a pod requesting `request` to `node`, bypassing the scheduler.
    async fn create_placeholder(
        &self,
        namespace: &str,
        node: &str,
        request: &ResourceList,
    ) -> ClusterResult<()>;
}
