//! Scoped test context.
//!
//! A [`TestContext`] owns everything one scenario creates: a namespace,
//! queues, priority classes and the placeholder pods that shape node
//! capacity. Names are made unique with a per-context run id, so two
//! contexts never collide without needing a lock.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use reclaim_poller::PollConfig;
use reclaim_types::{
    validate_name, JobSpec, JobStatus, PriorityClass, QueueCondition, QueueStatus, ResourceList,
    DEFAULT_QUEUE,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cluster::{ClusterApi, JobHandle, JobSubmission, NodeCapacity};
use crate::error::{ClusterError, ContextError, ContextResult};
use crate::waits;

/// What a context provisions at initialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Logical names of queues to create.
    pub queues: Vec<String>,

    /// Only this many schedulable nodes keep free capacity.
    pub node_count_ceiling: Option<u32>,

    /// Free capacity left on each remaining node.
    pub per_node_resource_ceiling: Option<ResourceList>,

    /// Logical priority class name to value.
    pub priority_classes: BTreeMap<String, i32>,

    /// Queues owned by the cluster; used by name, never created or deleted.
    pub external_queues: Vec<String>,

    pub namespace_prefix: String,

    /// Bound on waiting for namespace and queue removal.
    pub teardown_poll: PollConfig,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            queues: Vec::new(),
            node_count_ceiling: None,
            per_node_resource_ceiling: None,
            priority_classes: BTreeMap::new(),
            external_queues: vec![DEFAULT_QUEUE.to_string()],
            namespace_prefix: "reclaim".to_string(),
            teardown_poll: PollConfig::two_minutes(),
        }
    }
}

impl ContextConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue(mut self, name: impl Into<String>) -> Self {
        self.queues.push(name.into());
        self
    }

    pub fn with_queues<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues.extend(names.into_iter().map(Into::into));
        self
    }

    /// Keep `count` nodes, each with at most `per_node` free.
    pub fn with_node_ceiling(mut self, count: u32, per_node: ResourceList) -> Self {
        self.node_count_ceiling = Some(count);
        self.per_node_resource_ceiling = Some(per_node);
        self
    }

    pub fn with_priority_class(mut self, name: impl Into<String>, value: i32) -> Self {
        self.priority_classes.insert(name.into(), value);
        self
    }

    pub fn with_namespace_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.namespace_prefix = prefix.into();
        self
    }

    pub fn with_teardown_poll(mut self, poll: PollConfig) -> Self {
        self.teardown_poll = poll;
        self
    }
}

/// What teardown removed and what it could not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownReport {
    pub namespace: String,
    pub removed: Vec<String>,
    pub failures: Vec<String>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn removed(&mut self, kind: &str, name: &str) {
        self.removed.push(format!("{}/{}", kind, name));
    }

    fn failed(&mut self, kind: &str, name: &str, reason: impl fmt::Display) {
        warn!(kind, name, error = %reason, "Teardown step failed");
        self.failures.push(format!("{}/{}: {}", kind, name, reason));
    }
}

impl fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} removed, {} failed",
            self.namespace,
            self.removed.len(),
            self.failures.len()
        )
    }
}

/// Exclusive handle on the objects of one scenario.
pub struct TestContext {
    cluster: Arc<dyn ClusterApi>,
    config: ContextConfig,
    run_id: String,
    namespace: String,
    namespace_created: bool,
    queues: Vec<String>,
    priority_classes: Vec<String>,
    placeholders: usize,
    torn_down: bool,
}

impl TestContext {
    /// Provision a namespace, queues, priority classes and node ceilings.
    ///
    /// When a step fails, whatever was already created is torn down before
    /// the error is returned.
    #[instrument(skip(cluster, config), fields(prefix = %config.namespace_prefix))]
    pub async fn initialize(
        cluster: Arc<dyn ClusterApi>,
        config: ContextConfig,
    ) -> ContextResult<Self> {
        let simple = Uuid::new_v4().simple().to_string();
        let run_id = simple[..8].to_string();
        let namespace = format!("{}-{}", config.namespace_prefix, run_id);
        validate_name(&namespace)?;

        let mut ctx = Self {
            cluster,
            config,
            run_id,
            namespace,
            namespace_created: false,
            queues: Vec::new(),
            priority_classes: Vec::new(),
            placeholders: 0,
            torn_down: false,
        };

        match ctx.provision().await {
            Ok(()) => {
                info!(
                    namespace = %ctx.namespace,
                    queues = ctx.queues.len(),
                    priority_classes = ctx.priority_classes.len(),
                    placeholders = ctx.placeholders,
                    "Test context ready"
                );
                Ok(ctx)
            }
            Err(err) => {
                warn!(namespace = %ctx.namespace, error = %err, "Context provisioning failed");
                ctx.teardown().await;
                Err(err)
            }
        }
    }

    async fn provision(&mut self) -> ContextResult<()> {
        self.cluster
            .create_namespace(&self.namespace, &self.run_id)
            .await?;
        self.namespace_created = true;

        let classes: Vec<(String, i32)> = self
            .config
            .priority_classes
            .iter()
            .map(|(name, value)| (name.clone(), *value))
            .collect();
        for (logical, value) in classes {
            let class = PriorityClass::new(self.priority_class_name(&logical), value);
            validate_name(&class.name)?;
            self.cluster.create_priority_class(&class, &self.run_id).await?;
            self.priority_classes.push(logical);
        }

        let queues = self.config.queues.clone();
        for logical in queues {
            self.add_queue(&logical).await?;
        }

        self.constrain_nodes().await
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn cluster(&self) -> &dyn ClusterApi {
        self.cluster.as_ref()
    }

    /// Number of placeholder pods created to shape capacity.
    pub fn placeholders(&self) -> usize {
        self.placeholders
    }

    /// Physical name of a logical queue.
    ///
    /// External queues keep their name. Every other name gets the run id
    /// suffix, so a queue this context never created resolves to a name
    /// that does not exist.
    pub fn queue_name(&self, logical: &str) -> String {
        if self.config.external_queues.iter().any(|q| q == logical) {
            logical.to_string()
        } else {
            format!("{}-{}", logical, self.run_id)
        }
    }

    pub fn priority_class_name(&self, logical: &str) -> String {
        format!("{}-{}", logical, self.run_id)
    }

    fn ensure_live(&self) -> ContextResult<()> {
        if self.torn_down {
            return Err(ContextError::TornDown(self.namespace.clone()));
        }
        Ok(())
    }

    /// Create another queue (weight 1, reclaimable) owned by this context.
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn add_queue(&mut self, logical: &str) -> ContextResult<()> {
        self.ensure_live()?;
        let physical = self.queue_name(logical);
        if self.config.external_queues.iter().any(|q| q == logical)
            || self.queues.iter().any(|q| q == logical)
        {
            return Err(ClusterError::AlreadyExists {
                kind: "queue",
                name: physical,
            }
            .into());
        }
        validate_name(&physical)?;

        self.cluster.create_queue(&physical, 1, &self.run_id).await?;
        self.queues.push(logical.to_string());
        Ok(())
    }

    /// Validate `job`, resolve its names and submit it.
    ///
    /// Fails with `QueueNotFound` when the queue does not exist.
    #[instrument(skip(self, job), fields(job = %job.name, queue = %job.queue))]
    pub async fn instantiate(&self, job: &JobSpec) -> ContextResult<JobHandle> {
        self.ensure_live()?;
        job.validate()?;

        let queue = self.queue_name(&job.queue);
        match self.cluster.get_queue(&queue).await {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {
                debug!(queue = %queue, "Submission target queue is missing");
                return Err(ClusterError::QueueNotFound(queue).into());
            }
            Err(err) => return Err(err.into()),
        }

        let submission = JobSubmission {
            name: job.name.clone(),
            queue,
            priority_class: job
                .priority_class
                .as_deref()
                .map(|pc| self.priority_class_name(pc)),
            tasks: job.tasks.clone(),
            min_available: job.min_available(),
        };
        Ok(self
            .cluster
            .submit_job(&self.namespace, &submission)
            .await?)
    }

    pub async fn job_pods(&self, handle: &JobHandle) -> ContextResult<Vec<String>> {
        self.ensure_live()?;
        Ok(self
            .cluster
            .list_job_pods(&handle.namespace, &handle.name)
            .await?)
    }

    /// Delete every pod of the job; returns how many were deleted.
    #[instrument(skip(self, handle), fields(job = %handle.name))]
    pub async fn delete_job_pods(&self, handle: &JobHandle) -> ContextResult<usize> {
        let pods = self.job_pods(handle).await?;
        let mut deleted = 0;
        for pod in &pods {
            match self.cluster.delete_pod(&handle.namespace, pod).await {
                Ok(()) => deleted += 1,
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.into()),
            }
        }
        info!(deleted, "Deleted job pods");
        Ok(deleted)
    }

    /// How many copies of `slot` fit into the free capacity of all
    /// schedulable nodes.
    pub async fn cluster_size(&self, slot: &ResourceList) -> ContextResult<u32> {
        self.ensure_live()?;
        let nodes = self.cluster.schedulable_nodes().await?;
        let total: u64 = nodes.iter().map(|n| slot.slots_in(&n.free())).sum();
        Ok(u32::try_from(total).unwrap_or(u32::MAX))
    }

    pub async fn wait_queue(
        &self,
        logical: &str,
        condition: QueueCondition,
        config: PollConfig,
    ) -> ContextResult<QueueStatus> {
        self.ensure_live()?;
        let queue = self.queue_name(logical);
        Ok(waits::wait_queue(self.cluster(), &queue, condition, config).await?)
    }

    pub async fn wait_tasks_ready(
        &self,
        handle: &JobHandle,
        count: u32,
        config: PollConfig,
    ) -> ContextResult<JobStatus> {
        self.ensure_live()?;
        Ok(waits::wait_tasks_ready(self.cluster(), handle, count, config).await?)
    }

    pub async fn wait_job_ready(
        &self,
        handle: &JobHandle,
        config: PollConfig,
    ) -> ContextResult<JobStatus> {
        self.ensure_live()?;
        Ok(waits::wait_job_ready(self.cluster(), handle, config).await?)
    }

    pub async fn wait_job_pending(
        &self,
        handle: &JobHandle,
        config: PollConfig,
    ) -> ContextResult<JobStatus> {
        self.ensure_live()?;
        Ok(waits::wait_job_pending(self.cluster(), handle, config).await?)
    }

    /// Pin placeholder pods so only the configured capacity stays free.
    async fn constrain_nodes(&mut self) -> ContextResult<()> {
        let count = self.config.node_count_ceiling;
        let per_node = self.config.per_node_resource_ceiling;
        if count.is_none() && per_node.is_none() {
            return Ok(());
        }

        let mut nodes = self.cluster.schedulable_nodes().await?;
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        if let Some(required) = count {
            if nodes.len() < required as usize {
                return Err(ContextError::InsufficientNodes {
                    required,
                    available: nodes.len() as u32,
                });
            }
        }

        for (index, node) in nodes.iter().enumerate() {
            let consume = placeholder_request(index, node, count, per_node.as_ref());
            if consume.is_empty() {
                continue;
            }
            self.cluster
                .create_placeholder(&self.namespace, &node.name, &consume)
                .await?;
            self.placeholders += 1;
        }
        Ok(())
    }

    /// Remove everything this context created. Failures are logged and
    /// recorded; calling it again does nothing.
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport {
            namespace: self.namespace.clone(),
            ..Default::default()
        };
        if self.torn_down {
            debug!("Context already torn down");
            return report;
        }
        self.torn_down = true;
        let poll = self.config.teardown_poll;

        if self.namespace_created {
            let requested = match self.cluster.delete_namespace(&self.namespace).await {
                Ok(()) => true,
                Err(err) if err.is_not_found() => true,
                Err(err) => {
                    report.failed("namespace", &self.namespace, err);
                    false
                }
            };
            if requested {
                match waits::wait_namespace_gone(self.cluster(), &self.namespace, poll).await {
                    Ok(_) => report.removed("namespace", &self.namespace),
                    Err(err) => report.failed("namespace", &self.namespace, err),
                }
            }
        }

        for logical in std::mem::take(&mut self.queues) {
            let queue = self.queue_name(&logical);
            if let Err(err) = self.remove_queue(&queue, poll).await {
                report.failed("queue", &queue, err);
                continue;
            }
            report.removed("queue", &queue);
        }

        for logical in std::mem::take(&mut self.priority_classes) {
            let name = self.priority_class_name(&logical);
            match self.cluster.delete_priority_class(&name).await {
                Ok(()) => report.removed("priorityclass", &name),
                Err(err) if err.is_not_found() => {}
                Err(err) => report.failed("priorityclass", &name, err),
            }
        }

        info!(
            removed = report.removed.len(),
            failures = report.failures.len(),
            "Test context torn down"
        );
        report
    }

    async fn remove_queue(&self, queue: &str, poll: PollConfig) -> ContextResult<()> {
        match self.cluster.close_queue(queue).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        waits::wait_queue_closed(self.cluster(), queue, poll).await?;
        match self.cluster.delete_queue(queue).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl fmt::Debug for TestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestContext")
            .field("namespace", &self.namespace)
            .field("queues", &self.queues)
            .field("priority_classes", &self.priority_classes)
            .field("torn_down", &self.torn_down)
            .finish()
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        if !self.torn_down {
            warn!(
                namespace = %self.namespace,
                "Test context dropped without teardown; cluster objects leak"
            );
        }
    }
}

/// Capacity a placeholder on the `index`-th node (by name) must consume.
fn placeholder_request(
    index: usize,
    node: &NodeCapacity,
    count: Option<u32>,
    per_node: Option<&ResourceList>,
) -> ResourceList {
    let free = node.free();
    if count.is_some_and(|c| index >= c as usize) {
        return free;
    }
    match per_node {
        Some(ceiling) => surplus_over(&free, ceiling),
        None => ResourceList::default(),
    }
}

/// Free capacity above `ceiling`; a zero ceiling dimension is unconstrained.
fn surplus_over(free: &ResourceList, ceiling: &ResourceList) -> ResourceList {
    let cpu = if ceiling.cpu_millis == 0 {
        0
    } else {
        free.cpu_millis.saturating_sub(ceiling.cpu_millis)
    };
    let memory = if ceiling.memory_bytes == 0 {
        0
    } else {
        free.memory_bytes.saturating_sub(ceiling.memory_bytes)
    };
    ResourceList::new(cpu, memory)
}

/// Run `body` inside a fresh context and always tear it down afterwards,
/// even if the body panics.
pub async fn with_context<T, F>(
    cluster: Arc<dyn ClusterApi>,
    config: ContextConfig,
    body: F,
) -> ContextResult<(T, TeardownReport)>
where
    F: for<'a> FnOnce(&'a mut TestContext) -> BoxFuture<'a, T>,
{
    let mut ctx = TestContext::initialize(cluster, config).await?;
    let outcome = AssertUnwindSafe(body(&mut ctx)).catch_unwind().await;
    let report = ctx.teardown().await;
    match outcome {
        Ok(value) => Ok((value, report)),
        Err(panic) => std::panic::resume_unwind(panic),
    }
}
