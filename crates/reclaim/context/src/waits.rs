//! Condition waits over cluster state.
//!
//! Each wait wraps one [`StateSource`] in a [`ConditionPoller`] and turns
//! a failed outcome into a [`PollError`] naming the condition and the last
//! state seen.

use async_trait::async_trait;
use reclaim_poller::{ConditionPoller, PollConfig, PollResult, StateSource};
use reclaim_types::{JobPhase, JobStatus, QueueCondition, QueueState, QueueStatus};
use tracing::instrument;

use crate::cluster::{ClusterApi, JobHandle};
use crate::error::ClusterError;

/// Observes the status of one queue.
pub struct QueueObserver<'a> {
    cluster: &'a dyn ClusterApi,
    queue: String,
}

impl<'a> QueueObserver<'a> {
    pub fn new(cluster: &'a dyn ClusterApi, queue: impl Into<String>) -> Self {
        Self {
            cluster,
            queue: queue.into(),
        }
    }
}

#[async_trait]
impl StateSource for QueueObserver<'_> {
    type State = QueueStatus;
    type Error = ClusterError;

    async fn observe(&self) -> Result<QueueStatus, ClusterError> {
        self.cluster.get_queue(&self.queue).await
    }
}

/// Observes the status of one job.
pub struct JobObserver<'a> {
    cluster: &'a dyn ClusterApi,
    namespace: String,
    job: String,
}

impl<'a> JobObserver<'a> {
    pub fn new(cluster: &'a dyn ClusterApi, handle: &JobHandle) -> Self {
        Self {
            cluster,
            namespace: handle.namespace.clone(),
            job: handle.name.clone(),
        }
    }
}

#[async_trait]
impl StateSource for JobObserver<'_> {
    type State = JobStatus;
    type Error = ClusterError;

    async fn observe(&self) -> Result<JobStatus, ClusterError> {
        self.cluster.get_job(&self.namespace, &self.job).await
    }
}

/// Wait until `condition` holds on the queue's status.
#[instrument(skip(cluster, condition, config), fields(condition = %condition))]
pub async fn wait_queue(
    cluster: &dyn ClusterApi,
    queue: &str,
    condition: QueueCondition,
    config: PollConfig,
) -> PollResult<QueueStatus> {
    let observer = QueueObserver::new(cluster, queue);
    ConditionPoller::new(config)
        .poll_source(&observer, |status| condition.holds(status))
        .await
        .into_result(format!("queue {} {}", queue, condition))
}

/// Wait until the queue reports Closed.
pub async fn wait_queue_closed(
    cluster: &dyn ClusterApi,
    queue: &str,
    config: PollConfig,
) -> PollResult<QueueStatus> {
    wait_queue(
        cluster,
        queue,
        QueueCondition::Admission(QueueState::Closed),
        config,
    )
    .await
}

/// Wait until at least `count` replicas of the job are ready.
#[instrument(skip(cluster, handle, config), fields(job = %handle.name))]
pub async fn wait_tasks_ready(
    cluster: &dyn ClusterApi,
    handle: &JobHandle,
    count: u32,
    config: PollConfig,
) -> PollResult<JobStatus> {
    let observer = JobObserver::new(cluster, handle);
    ConditionPoller::new(config)
        .poll_source(&observer, |status| status.ready_tasks >= count)
        .await
        .into_result(format!("job {} ready tasks >= {}", handle.name, count))
}

/// Wait until the job's gang minimum is met.
#[instrument(skip(cluster, handle, config), fields(job = %handle.name))]
pub async fn wait_job_ready(
    cluster: &dyn ClusterApi,
    handle: &JobHandle,
    config: PollConfig,
) -> PollResult<JobStatus> {
    let observer = JobObserver::new(cluster, handle);
    ConditionPoller::new(config)
        .poll_source(&observer, JobStatus::is_ready)
        .await
        .into_result(format!(
            "job {} ready tasks >= {}",
            handle.name, handle.min_available
        ))
}

/// Wait until the job is in the Pending phase.
#[instrument(skip(cluster, handle, config), fields(job = %handle.name))]
pub async fn wait_job_pending(
    cluster: &dyn ClusterApi,
    handle: &JobHandle,
    config: PollConfig,
) -> PollResult<JobStatus> {
    let observer = JobObserver::new(cluster, handle);
    ConditionPoller::new(config)
        .poll_source(&observer, |status| status.phase == JobPhase::Pending)
        .await
        .into_result(format!("job {} phase == Pending", handle.name))
}

/// Wait until the namespace no longer exists.
pub async fn wait_namespace_gone(
    cluster: &dyn ClusterApi,
    namespace: &str,
    config: PollConfig,
) -> PollResult<bool> {
    ConditionPoller::new(config)
        .poll_until(|| cluster.namespace_exists(namespace), |exists| !exists)
        .await
        .into_result(format!("namespace {} removed", namespace))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ClusterOp, InMemoryCluster};
    use crate::cluster::JobSubmission;
    use reclaim_poller::PollError;
    use reclaim_types::{ResourceList, TaskSpec, DEFAULT_QUEUE};
    use std::time::Duration;

    fn quick() -> PollConfig {
        PollConfig::new(Duration::from_millis(100), Duration::from_secs(5))
    }

    async fn submitted(cluster: &InMemoryCluster, replicas: u32) -> JobHandle {
        cluster.create_namespace("ns", "r").await.unwrap();
        let job = JobSubmission {
            name: "j".into(),
            queue: DEFAULT_QUEUE.into(),
            priority_class: None,
            tasks: vec![TaskSpec::new("nginx:1.14", ResourceList::ONE_CPU).with_replicas(2, replicas)],
            min_available: 2,
        };
        cluster.submit_job("ns", &job).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_tasks_ready_converges() {
        let cluster = InMemoryCluster::new();
        let handle = submitted(&cluster, 3).await;
        cluster
            .set_driver(|s| {
                let up = s.ready_tasks("j") + 1;
                s.set_running("j", up);
            })
            .await;

        let status = wait_tasks_ready(&cluster, &handle, 3, quick()).await.unwrap();
        assert_eq!(status.ready_tasks, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_job_ready_times_out_with_last_state() {
        let cluster = InMemoryCluster::new();
        let handle = submitted(&cluster, 3).await;
        cluster.set_driver(|s| s.set_running("j", 1)).await;

        let err = wait_job_ready(&cluster, &handle, quick()).await.unwrap_err();
        match err {
            PollError::TimedOut { last_observed, .. } => {
                let last = last_observed.unwrap();
                assert!(last.contains("ready_tasks: 1"), "{}", last);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_queue_tolerates_late_creation() {
        let cluster = InMemoryCluster::new();
        let creator = cluster.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(350)).await;
            creator.create_queue("late", 1, "r").await.unwrap();
        });

        let status = wait_queue(&cluster, "late", QueueCondition::open(), quick())
            .await
            .unwrap();
        assert_eq!(status.state, QueueState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_queue_aborts_on_forbidden() {
        let cluster = InMemoryCluster::new();
        cluster
            .fail_next(ClusterOp::GetQueue, ClusterError::Forbidden("rbac".into()))
            .await;

        let err = wait_queue(&cluster, DEFAULT_QUEUE, QueueCondition::Running(1), quick())
            .await
            .unwrap_err();
        assert!(matches!(err, PollError::Structural { attempts: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_job_pending_fails_when_job_vanishes() {
        let cluster = InMemoryCluster::new();
        let handle = submitted(&cluster, 2).await;
        cluster.set_driver(|s| s.set_running("j", 2)).await;

        let remover = cluster.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            remover.delete_namespace("ns").await.unwrap();
        });

        let err = wait_job_pending(&cluster, &handle, quick()).await.unwrap_err();
        match err {
            PollError::Structural { reason, .. } => assert!(reason.contains("disappeared")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_namespace_gone() {
        let cluster = InMemoryCluster::new();
        cluster.create_namespace("ns", "r").await.unwrap();
        cluster.delete_namespace("ns").await.unwrap();
        assert!(wait_namespace_gone(&cluster, "ns", quick()).await.is_ok());
    }
}
