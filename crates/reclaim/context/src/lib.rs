//! # Reclaim Context - Scoped Cluster Access
//!
//! Cluster access and per-scenario lifecycle for the reclaim harness.
//!
//! - [`ClusterApi`]: the operations the harness needs from the platform,
//!   implemented by [`KubeCluster`] for live clusters and by
//!   `InMemoryCluster` (feature `test-utils`) for tests
//! - [`TestContext`]: owns the namespace, queues, priority classes and
//!   capacity placeholders of one scenario, and resolves logical names to
//!   unique physical ones
//! - [`waits`]: condition waits over queue, job and namespace state
//!
//! ## Lifecycle
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use reclaim_context::{ContextConfig, KubeCluster, TestContext};
//! use reclaim_types::{JobSpec, ResourceList, TaskSpec};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cluster = Arc::new(KubeCluster::try_default().await?);
//! let mut ctx = TestContext::initialize(cluster, ContextConfig::new().with_queue("q2")).await?;
//!
//! let job = JobSpec::new("j1", "q2").with_task(TaskSpec::new("nginx:1.14", ResourceList::CPU1_MEM1));
//! let handle = ctx.instantiate(&job).await?;
//! ctx.wait_job_ready(&handle, Default::default()).await?;
//!
//! let report = ctx.teardown().await;
//! println!("{}", report);
//! # Ok(())
//! # }
//! ```

pub mod cluster;
pub mod context;
pub mod error;
pub mod kube_cluster;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod waits;

pub use cluster::{
    ClusterApi, JobHandle, JobSubmission, NodeCapacity, PLACEHOLDER_LABEL, RUN_ID_LABEL,
};
pub use context::{with_context, ContextConfig, TeardownReport, TestContext};
pub use error::{ClusterError, ClusterResult, ContextError, ContextResult};
pub use kube_cluster::KubeCluster;
#[cfg(any(test, feature = "test-utils"))]
pub use memory::{ClusterOp, ClusterState, InMemoryCluster, JournalEntry, PodPhase, StatusDriver};
