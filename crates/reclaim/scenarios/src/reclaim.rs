//! The reclaim scenarios.
//!
//! Each scenario runs in its own [`TestContext`] and asserts one necessary
//! condition of reclaim: the scheduler may only take capacity back from a
//! queue when the claimant's queue exists, the claimant is schedulable and
//! at least as important, the donor is above its share and the freed
//! capacity covers the claimant's minimum.

use std::fmt;
use std::sync::Arc;

use clap::ValueEnum;
use futures::FutureExt;
use reclaim_context::{with_context, ClusterApi, ContextConfig, JobHandle, TestContext};
use reclaim_types::{
    JobSpec, QueueCondition, ResourceList, TaskSpec, DEFAULT_QUEUE, HIGH_PRIORITY, LOW_PRIORITY,
};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, info, instrument};

use crate::config::ScenarioConfig;
use crate::error::{ScenarioError, ScenarioResult};
use crate::report::{ScenarioReport, Steps};

const Q1: &str = "q1";
const Q2: &str = "q2";
const Q3: &str = "q3";

/// The reclaim scenarios, by stable name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ReclaimCase {
    /// Enough capacity for every queue: all run, nothing is reclaimed.
    ResourcesSuffice,
    /// A claimant whose pods were deleted stays pending and reclaims nothing.
    ClaimantPending,
    /// Submitting to a queue that was never created fails.
    MissingQueue,
    /// A low-priority claimant never displaces high-priority incumbents.
    LowPriorityClaimant,
    /// A queue already using its share is not reclaimed from.
    DonorOverused,
    /// A claimant larger than anything reclaim could free stays pending.
    ClaimantExceedsReclaimable,
    /// A high-priority claimant takes half the cluster from a low-priority one.
    PriorityReclaim,
}

impl ReclaimCase {
    pub const ALL: [ReclaimCase; 7] = [
        ReclaimCase::ResourcesSuffice,
        ReclaimCase::ClaimantPending,
        ReclaimCase::MissingQueue,
        ReclaimCase::LowPriorityClaimant,
        ReclaimCase::DonorOverused,
        ReclaimCase::ClaimantExceedsReclaimable,
        ReclaimCase::PriorityReclaim,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ReclaimCase::ResourcesSuffice => "resources-suffice",
            ReclaimCase::ClaimantPending => "claimant-pending",
            ReclaimCase::MissingQueue => "missing-queue",
            ReclaimCase::LowPriorityClaimant => "low-priority-claimant",
            ReclaimCase::DonorOverused => "donor-overused",
            ReclaimCase::ClaimantExceedsReclaimable => "claimant-exceeds-reclaimable",
            ReclaimCase::PriorityReclaim => "priority-reclaim",
        }
    }

    /// What the context provisions before the scenario body runs.
    pub fn context_config(&self, config: &ScenarioConfig) -> ContextConfig {
        let three_slots = |base: ContextConfig| base.with_node_ceiling(3, ResourceList::CPU1_MEM1);
        match self {
            ReclaimCase::ResourcesSuffice => config
                .context()
                .with_queue(Q2)
                .with_node_ceiling(4, ResourceList::CPU1_MEM1),
            ReclaimCase::ClaimantPending
            | ReclaimCase::MissingQueue
            | ReclaimCase::LowPriorityClaimant
            | ReclaimCase::ClaimantExceedsReclaimable => {
                three_slots(config.context_with_priorities().with_queue(Q2))
            }
            ReclaimCase::DonorOverused => {
                three_slots(config.context_with_priorities().with_queues([Q2, Q3]))
            }
            ReclaimCase::PriorityReclaim => config.context_with_priorities().with_queues([Q1, Q2]),
        }
    }
}

impl fmt::Display for ReclaimCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Run one scenario in a fresh context, tearing it down afterwards.
#[instrument(skip(case, cluster, config), fields(case = %case))]
pub async fn run_case(
    case: ReclaimCase,
    cluster: Arc<dyn ClusterApi>,
    config: &ScenarioConfig,
) -> ScenarioResult<ScenarioReport> {
    info!("Scenario started");
    let owned = config.clone();
    let ((outcome, steps, namespace), teardown) =
        with_context(cluster, case.context_config(config), move |ctx| {
            async move {
                let mut steps = Steps::new();
                let outcome = execute(case, ctx, &owned, &mut steps).await;
                (outcome, steps.into_inner(), ctx.namespace().to_string())
            }
            .boxed()
        })
        .await
        .map_err(|e| ScenarioError::at_step("initialize context", e))?;

    match outcome {
        Ok(()) => {
            info!(steps = steps.len(), namespace = %namespace, "Scenario passed");
            Ok(ScenarioReport {
                scenario: case.name().to_string(),
                namespace,
                steps,
                teardown,
            })
        }
        Err(err) => {
            error!(
                error = %err,
                completed_steps = steps.len(),
                namespace = %namespace,
                "Scenario failed"
            );
            Err(err)
        }
    }
}

async fn execute(
    case: ReclaimCase,
    ctx: &mut TestContext,
    config: &ScenarioConfig,
    steps: &mut Steps,
) -> ScenarioResult<()> {
    match case {
        ReclaimCase::ResourcesSuffice => resources_suffice(ctx, config, steps).await,
        ReclaimCase::ClaimantPending => claimant_pending(ctx, config, steps).await,
        ReclaimCase::MissingQueue => missing_queue(ctx, config, steps).await,
        ReclaimCase::LowPriorityClaimant => low_priority_claimant(ctx, config, steps).await,
        ReclaimCase::DonorOverused => donor_overused(ctx, config, steps).await,
        ReclaimCase::ClaimantExceedsReclaimable => {
            claimant_exceeds_reclaimable(ctx, config, steps).await
        }
        ReclaimCase::PriorityReclaim => priority_reclaim(ctx, config, steps).await,
    }
}

pub async fn no_reclaim_when_resources_suffice(
    cluster: Arc<dyn ClusterApi>,
    config: &ScenarioConfig,
) -> ScenarioResult<ScenarioReport> {
    run_case(ReclaimCase::ResourcesSuffice, cluster, config).await
}

pub async fn no_reclaim_for_pending_claimant(
    cluster: Arc<dyn ClusterApi>,
    config: &ScenarioConfig,
) -> ScenarioResult<ScenarioReport> {
    run_case(ReclaimCase::ClaimantPending, cluster, config).await
}

pub async fn no_reclaim_for_missing_queue(
    cluster: Arc<dyn ClusterApi>,
    config: &ScenarioConfig,
) -> ScenarioResult<ScenarioReport> {
    run_case(ReclaimCase::MissingQueue, cluster, config).await
}

pub async fn no_reclaim_for_low_priority_claimant(
    cluster: Arc<dyn ClusterApi>,
    config: &ScenarioConfig,
) -> ScenarioResult<ScenarioReport> {
    run_case(ReclaimCase::LowPriorityClaimant, cluster, config).await
}

pub async fn no_reclaim_from_overused_donor(
    cluster: Arc<dyn ClusterApi>,
    config: &ScenarioConfig,
) -> ScenarioResult<ScenarioReport> {
    run_case(ReclaimCase::DonorOverused, cluster, config).await
}

pub async fn no_reclaim_when_claimant_exceeds_reclaimable(
    cluster: Arc<dyn ClusterApi>,
    config: &ScenarioConfig,
) -> ScenarioResult<ScenarioReport> {
    run_case(ReclaimCase::ClaimantExceedsReclaimable, cluster, config).await
}

pub async fn reclaim_by_priority(
    cluster: Arc<dyn ClusterApi>,
    config: &ScenarioConfig,
) -> ScenarioResult<ScenarioReport> {
    run_case(ReclaimCase::PriorityReclaim, cluster, config).await
}

/// Ready replicas each queue must reach when two queues split `slots`
/// identical slots; one replica is held back for rounding.
pub fn reclaim_target(slots: u32) -> ScenarioResult<u32> {
    let share = slots / 2;
    if share > 1 {
        Ok(share - 1)
    } else {
        Err(ScenarioError::ClusterTooSmall { slots, share })
    }
}

fn single_task_job(
    config: &ScenarioConfig,
    name: &str,
    queue: &str,
    resources: ResourceList,
    priority: Option<&str>,
) -> JobSpec {
    JobSpec::new(name, queue)
        .with_optional_priority(priority)
        .with_task(TaskSpec::new(&config.image, resources))
}

async fn submit(ctx: &TestContext, steps: &mut Steps, job: &JobSpec) -> ScenarioResult<JobHandle> {
    steps
        .run(format!("submit {} to {}", job.name, job.queue), ctx.instantiate(job))
        .await
}

/// Submit a one-replica job and wait for its task to run.
async fn create_running_job(
    ctx: &TestContext,
    config: &ScenarioConfig,
    steps: &mut Steps,
    name: &str,
    queue: &str,
    priority: Option<&str>,
) -> ScenarioResult<JobHandle> {
    let job = single_task_job(config, name, queue, ResourceList::CPU1_MEM1, priority);
    let handle = submit(ctx, steps, &job).await?;
    steps
        .run(
            format!("{} has 1 ready task", name),
            ctx.wait_tasks_ready(&handle, 1, config.task_poll),
        )
        .await?;
    Ok(handle)
}

/// The submission must fail because its queue does not exist.
async fn expect_rejected(ctx: &TestContext, steps: &mut Steps, job: &JobSpec) -> ScenarioResult<()> {
    let step = format!("{} is rejected by missing queue {}", job.name, job.queue);
    let started = Instant::now();
    match ctx.instantiate(job).await {
        Ok(handle) => Err(ScenarioError::UnexpectedSubmission {
            step,
            job: handle.name,
            queue: handle.queue,
        }),
        Err(err) if err.is_queue_not_found() => {
            steps.record(step, started.elapsed());
            Ok(())
        }
        Err(err) => Err(ScenarioError::at_step(step, err)),
    }
}

async fn expect_queue(
    ctx: &TestContext,
    config: &ScenarioConfig,
    steps: &mut Steps,
    queue: &str,
    condition: QueueCondition,
) -> ScenarioResult<()> {
    steps
        .run(
            format!("queue {} {}", queue, condition),
            ctx.wait_queue(queue, condition, config.queue_poll),
        )
        .await?;
    Ok(())
}

async fn resources_suffice(
    ctx: &mut TestContext,
    config: &ScenarioConfig,
    steps: &mut Steps,
) -> ScenarioResult<()> {
    create_running_job(ctx, config, steps, "reclaim-j1", DEFAULT_QUEUE, None).await?;
    create_running_job(ctx, config, steps, "reclaim-j2", Q2, None).await?;

    steps.run(format!("create queue {}", Q3), ctx.add_queue(Q3)).await?;
    expect_queue(ctx, config, steps, DEFAULT_QUEUE, QueueCondition::open()).await?;
    create_running_job(ctx, config, steps, "reclaim-j3", Q3, None).await?;

    for queue in [DEFAULT_QUEUE, Q2, Q3] {
        expect_queue(ctx, config, steps, queue, QueueCondition::Running(1)).await?;
    }
    Ok(())
}

async fn claimant_pending(
    ctx: &mut TestContext,
    config: &ScenarioConfig,
    steps: &mut Steps,
) -> ScenarioResult<()> {
    create_running_job(ctx, config, steps, "reclaim-j1", DEFAULT_QUEUE, None).await?;
    create_running_job(ctx, config, steps, "reclaim-j2", Q2, None).await?;

    steps.run(format!("create queue {}", Q3), ctx.add_queue(Q3)).await?;
    expect_queue(ctx, config, steps, DEFAULT_QUEUE, QueueCondition::open()).await?;
    let j3 = create_running_job(ctx, config, steps, "reclaim-j3", Q3, None).await?;

    // Without pods the job-group falls back to pending.
    steps
        .run("delete pods of reclaim-j3", ctx.delete_job_pods(&j3))
        .await?;

    expect_queue(ctx, config, steps, DEFAULT_QUEUE, QueueCondition::Running(1)).await?;
    expect_queue(ctx, config, steps, Q2, QueueCondition::Running(1)).await?;
    expect_queue(ctx, config, steps, Q3, QueueCondition::Pending(1)).await
}

async fn missing_queue(
    ctx: &mut TestContext,
    config: &ScenarioConfig,
    steps: &mut Steps,
) -> ScenarioResult<()> {
    create_running_job(ctx, config, steps, "reclaim-j1", DEFAULT_QUEUE, None).await?;
    create_running_job(ctx, config, steps, "reclaim-j2", Q2, None).await?;

    let j3 = single_task_job(config, "reclaim-j3", Q3, ResourceList::CPU1_MEM1, None);
    expect_rejected(ctx, steps, &j3).await?;

    expect_queue(ctx, config, steps, DEFAULT_QUEUE, QueueCondition::Running(1)).await?;
    expect_queue(ctx, config, steps, Q2, QueueCondition::Running(1)).await
}

async fn low_priority_claimant(
    ctx: &mut TestContext,
    config: &ScenarioConfig,
    steps: &mut Steps,
) -> ScenarioResult<()> {
    let high = Some(HIGH_PRIORITY);
    create_running_job(ctx, config, steps, "reclaim-j1", DEFAULT_QUEUE, high).await?;
    create_running_job(ctx, config, steps, "reclaim-j2", Q2, high).await?;

    expect_queue(ctx, config, steps, DEFAULT_QUEUE, QueueCondition::open()).await?;
    let j3 = single_task_job(
        config,
        "reclaim-j3",
        Q3,
        ResourceList::CPU1_MEM1,
        Some(LOW_PRIORITY),
    );
    expect_rejected(ctx, steps, &j3).await?;

    expect_queue(ctx, config, steps, DEFAULT_QUEUE, QueueCondition::Running(1)).await?;
    expect_queue(ctx, config, steps, Q2, QueueCondition::Running(1)).await
}

async fn donor_overused(
    ctx: &mut TestContext,
    config: &ScenarioConfig,
    steps: &mut Steps,
) -> ScenarioResult<()> {
    create_running_job(ctx, config, steps, "reclaim-j1", DEFAULT_QUEUE, None).await?;
    create_running_job(ctx, config, steps, "reclaim-j2", Q2, None).await?;
    create_running_job(ctx, config, steps, "reclaim-j3", Q3, None).await?;

    let j4 = single_task_job(config, "reclaim-j4", Q3, ResourceList::CPU1_MEM1, None);
    submit(ctx, steps, &j4).await?;

    for queue in [DEFAULT_QUEUE, Q2, Q3] {
        expect_queue(ctx, config, steps, queue, QueueCondition::Running(1)).await?;
    }
    expect_queue(ctx, config, steps, Q3, QueueCondition::Pending(1)).await
}

async fn claimant_exceeds_reclaimable(
    ctx: &mut TestContext,
    config: &ScenarioConfig,
    steps: &mut Steps,
) -> ScenarioResult<()> {
    create_running_job(ctx, config, steps, "reclaim-j1", DEFAULT_QUEUE, None).await?;
    create_running_job(ctx, config, steps, "reclaim-j2", Q2, None).await?;

    steps.run(format!("create queue {}", Q3), ctx.add_queue(Q3)).await?;
    expect_queue(ctx, config, steps, DEFAULT_QUEUE, QueueCondition::open()).await?;

    let j4 = single_task_job(config, "reclaim-j4", Q3, ResourceList::CPU4_MEM4, None);
    submit(ctx, steps, &j4).await?;

    expect_queue(ctx, config, steps, DEFAULT_QUEUE, QueueCondition::Running(1)).await?;
    expect_queue(ctx, config, steps, Q2, QueueCondition::Running(1)).await?;
    expect_queue(ctx, config, steps, Q3, QueueCondition::Pending(1)).await
}

async fn priority_reclaim(
    ctx: &mut TestContext,
    config: &ScenarioConfig,
    steps: &mut Steps,
) -> ScenarioResult<()> {
    let slot = ResourceList::ONE_CPU;
    let rep = steps
        .run("measure cluster size", ctx.cluster_size(&slot))
        .await?;
    let expected = reclaim_target(rep)?;
    info!(slots = rep, expected, "Cluster measured");

    let task = TaskSpec::new(&config.image, slot).with_replicas(1, rep);
    let q1_job = JobSpec::new("q1-qj-1", Q1)
        .with_priority(LOW_PRIORITY)
        .with_task(task.clone());
    let job1 = submit(ctx, steps, &q1_job).await?;
    steps
        .run("q1-qj-1 is ready", ctx.wait_job_ready(&job1, config.task_poll))
        .await?;
    expect_queue(ctx, config, steps, Q1, QueueCondition::Running(1)).await?;

    let q2_job = JobSpec::new("q2-qj-2", Q2)
        .with_priority(HIGH_PRIORITY)
        .with_task(task);
    let job2 = submit(ctx, steps, &q2_job).await?;
    steps
        .run(
            format!("q2-qj-2 has {} ready tasks", expected),
            ctx.wait_tasks_ready(&job2, expected, config.task_poll),
        )
        .await?;
    steps
        .run(
            format!("q1-qj-1 keeps {} ready tasks", expected),
            ctx.wait_tasks_ready(&job1, expected, config.task_poll),
        )
        .await?;

    let oversized = rep.saturating_mul(2);
    let q1_overflow = JobSpec::new("q1-qj-2", Q1)
        .with_task(TaskSpec::new(&config.image, slot).with_replicas(oversized, oversized));
    let job3 = submit(ctx, steps, &q1_overflow).await?;
    steps
        .run("q1-qj-2 is pending", ctx.wait_job_pending(&job3, config.task_poll))
        .await?;
    expect_queue(ctx, config, steps, Q1, QueueCondition::Pending(1)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use reclaim_context::{ClusterError, ContextError, InMemoryCluster};

    #[test]
    fn test_reclaim_target() {
        assert_eq!(reclaim_target(10).unwrap(), 4);
        assert_eq!(reclaim_target(7).unwrap(), 2);
        assert_eq!(reclaim_target(6).unwrap(), 2);
        assert!(matches!(
            reclaim_target(3),
            Err(ScenarioError::ClusterTooSmall { slots: 3, share: 1 })
        ));
        assert!(reclaim_target(0).is_err());
    }

    #[test]
    fn test_case_names_parse() {
        for case in ReclaimCase::ALL {
            assert_eq!(ReclaimCase::from_str(case.name(), false), Ok(case));
        }
        assert!(ReclaimCase::from_str("nope", false).is_err());
    }

    #[test]
    fn test_context_configs() {
        let config = ScenarioConfig::default();

        let first = ReclaimCase::ResourcesSuffice.context_config(&config);
        assert_eq!(first.queues, vec![Q2.to_string()]);
        assert_eq!(first.node_count_ceiling, Some(4));
        assert!(first.priority_classes.is_empty());

        let overused = ReclaimCase::DonorOverused.context_config(&config);
        assert_eq!(overused.queues, vec![Q2.to_string(), Q3.to_string()]);
        assert_eq!(overused.node_count_ceiling, Some(3));
        assert_eq!(overused.priority_classes.len(), 2);

        let reclaim = ReclaimCase::PriorityReclaim.context_config(&config);
        assert_eq!(reclaim.queues, vec![Q1.to_string(), Q2.to_string()]);
        assert_eq!(reclaim.node_count_ceiling, None);
        assert_eq!(reclaim.per_node_resource_ceiling, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_submission_is_flagged() {
        let cluster = InMemoryCluster::new();
        let config = ScenarioConfig::default();
        let mut ctx = TestContext::initialize(Arc::new(cluster), config.context().with_queue(Q3))
            .await
            .unwrap();
        let mut steps = Steps::new();

        let job = single_task_job(&config, "reclaim-j3", Q3, ResourceList::CPU1_MEM1, None);
        let err = expect_rejected(&ctx, &mut steps, &job).await.unwrap_err();
        assert!(matches!(err, ScenarioError::UnexpectedSubmission { .. }));
        assert!(steps.is_empty());
        ctx.teardown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_other_than_missing_queue_fails() {
        let cluster = InMemoryCluster::new();
        let config = ScenarioConfig::default();
        let mut ctx = TestContext::initialize(Arc::new(cluster), config.context())
            .await
            .unwrap();
        let mut steps = Steps::new();

        // Valid queue, unknown priority class: rejected, but not for the
        // expected reason.
        let job = single_task_job(
            &config,
            "reclaim-j3",
            DEFAULT_QUEUE,
            ResourceList::CPU1_MEM1,
            Some(LOW_PRIORITY),
        );
        let err = expect_rejected(&ctx, &mut steps, &job).await.unwrap_err();
        assert!(matches!(
            err,
            ScenarioError::Context {
                source: ContextError::Cluster(ClusterError::Invalid(_)),
                ..
            }
        ));
        ctx.teardown().await;
    }
}
