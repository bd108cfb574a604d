//! In-memory cluster for tests.
//!
//! Stores the objects the harness touches and answers reads from them.
//! It implements no scheduling policy: a test installs a
//! [`StatusDriver`] that plays the external scheduler by moving pods
//! between phases, and [`ClusterState::settle`] derives job phases and
//! queue counters from those pods the way the job and queue controllers
//! would.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use reclaim_types::{
    JobPhase, JobStatus, PriorityClass, QueueState, QueueStatus, ResourceList, DEFAULT_QUEUE,
};
use tokio::sync::RwLock;

use crate::cluster::{ClusterApi, JobHandle, JobSubmission, NodeCapacity};
use crate::error::{ClusterError, ClusterResult};

/// Callback run before every read, with exclusive access to the state.
pub type StatusDriver = Box<dyn Fn(&mut ClusterState) + Send + Sync>;

/// Cluster operations, for fault injection and the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterOp {
    CreateNamespace,
    DeleteNamespace,
    NamespaceExists,
    CreateQueue,
    GetQueue,
    CloseQueue,
    DeleteQueue,
    CreatePriorityClass,
    DeletePriorityClass,
    SubmitJob,
    GetJob,
    ListJobPods,
    DeletePod,
    SchedulableNodes,
    CreatePlaceholder,
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub op: ClusterOp,
    pub target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl PodPhase {
    fn is_ready(self) -> bool {
        matches!(self, PodPhase::Running | PodPhase::Succeeded)
    }

    fn is_terminal(self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRecord {
    pub weight: u32,
    pub status: QueueStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub namespace: String,
    pub submission: JobSubmission,
    pub phase: JobPhase,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRecord {
    pub namespace: String,
    pub name: String,

    /// Owning job; `None` for placeholders.
    pub job: Option<String>,
    pub node: Option<String>,
    pub request: ResourceList,
    pub phase: PodPhase,
}

/// Everything the in-memory cluster knows.
#[derive(Debug, Clone, Default)]
pub struct ClusterState {
    pub namespaces: BTreeSet<String>,
    pub queues: BTreeMap<String, QueueRecord>,
    pub priority_classes: BTreeMap<String, i32>,

    /// Keyed by (namespace, name), in submission order per key.
    pub jobs: BTreeMap<(String, String), JobRecord>,
    pub pods: Vec<PodRecord>,

    /// Node capacity with requests of pods the harness does not own.
    pub nodes: Vec<NodeCapacity>,
    pod_serial: u64,
}

impl ClusterState {
    /// A cluster with only the scheduler's default queue.
    pub fn new() -> Self {
        let mut state = Self::default();
        state.queues.insert(
            DEFAULT_QUEUE.to_string(),
            QueueRecord {
                weight: 1,
                status: open_queue(),
            },
        );
        state
    }

    pub fn job(&self, name: &str) -> Option<&JobRecord> {
        self.jobs.values().find(|j| j.submission.name == name)
    }

    pub fn job_pods<'a>(&'a self, job: &'a str) -> impl Iterator<Item = &'a PodRecord> + 'a {
        self.pods.iter().filter(move |p| p.job.as_deref() == Some(job))
    }

    pub fn ready_tasks(&self, job: &str) -> u32 {
        self.job_pods(job).filter(|p| p.phase.is_ready()).count() as u32
    }

    /// Run the first `n` pods of `job` and leave the rest pending.
    pub fn set_running(&mut self, job: &str, n: u32) {
        let mut remaining = n;
        for pod in self.pods.iter_mut().filter(|p| p.job.as_deref() == Some(job)) {
            if pod.phase.is_terminal() {
                continue;
            }
            if remaining > 0 {
                pod.phase = PodPhase::Running;
                remaining -= 1;
            } else {
                pod.phase = PodPhase::Pending;
            }
        }
    }

    /// Run every pod of every job.
    pub fn run_all(&mut self) {
        for pod in self.pods.iter_mut().filter(|p| p.job.is_some()) {
            if pod.phase == PodPhase::Pending {
                pod.phase = PodPhase::Running;
            }
        }
    }

    /// Derive job phases and queue counters from pod phases.
    pub fn settle(&mut self) {
        let ready: HashMap<String, u32> = self
            .jobs
            .values()
            .map(|j| {
                let name = j.submission.name.clone();
                let count = self.ready_tasks(&name);
                (name, count)
            })
            .collect();

        for job in self.jobs.values_mut() {
            let up = ready.get(&job.submission.name).copied().unwrap_or(0);
            job.phase = if up >= job.submission.min_available {
                JobPhase::Running
            } else {
                JobPhase::Pending
            };
        }

        for (name, queue) in self.queues.iter_mut() {
            let mut running = 0;
            let mut pending = 0;
            for job in self.jobs.values().filter(|j| &j.submission.queue == name) {
                match job.phase {
                    JobPhase::Running => running += 1,
                    JobPhase::Pending => pending += 1,
                    _ => {}
                }
            }
            queue.status.running = running;
            queue.status.pending = pending;
        }
    }

    fn requested_on(&self, node: &str) -> ResourceList {
        self.pods
            .iter()
            .filter(|p| p.node.as_deref() == Some(node) && !p.phase.is_terminal())
            .fold(ResourceList::default(), |acc, p| acc + p.request)
    }

    fn next_serial(&mut self) -> u64 {
        self.pod_serial += 1;
        self.pod_serial
    }
}

fn open_queue() -> QueueStatus {
    QueueStatus {
        state: QueueState::Open,
        ..QueueStatus::default()
    }
}

/// [`ClusterApi`] over a [`ClusterState`] held in memory.
#[derive(Clone)]
pub struct InMemoryCluster {
    state: Arc<RwLock<ClusterState>>,
    driver: Arc<RwLock<Option<StatusDriver>>>,
    faults: Arc<RwLock<HashMap<ClusterOp, VecDeque<ClusterError>>>>,
    journal: Arc<RwLock<Vec<JournalEntry>>>,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::from_state(ClusterState::new())
    }

    pub fn from_state(state: ClusterState) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
            driver: Arc::new(RwLock::new(None)),
            faults: Arc::new(RwLock::new(HashMap::new())),
            journal: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// A cluster with `count` idle nodes of identical capacity.
    pub fn with_nodes(count: usize, allocatable: ResourceList) -> Self {
        let mut state = ClusterState::new();
        state.nodes = (0..count)
            .map(|i| NodeCapacity {
                name: format!("node-{}", i),
                allocatable,
                requested: ResourceList::default(),
            })
            .collect();
        Self::from_state(state)
    }

    /// Install the callback that plays the scheduler.
    pub async fn set_driver(&self, driver: impl Fn(&mut ClusterState) + Send + Sync + 'static) {
        *self.driver.write().await = Some(Box::new(driver));
    }

    /// Make the next call of `op` fail with `err`. Calls queue up.
    pub async fn fail_next(&self, op: ClusterOp, err: ClusterError) {
        self.faults
            .write()
            .await
            .entry(op)
            .or_default()
            .push_back(err);
    }

    pub async fn journal(&self) -> Vec<JournalEntry> {
        self.journal.read().await.clone()
    }

    /// Snapshot of the state, after settling.
    pub async fn snapshot(&self) -> ClusterState {
        let mut state = self.state.write().await;
        state.settle();
        state.clone()
    }

    /// Mutate the state directly.
    pub async fn update<R>(&self, f: impl FnOnce(&mut ClusterState) -> R) -> R {
        let mut state = self.state.write().await;
        let out = f(&mut state);
        state.settle();
        out
    }

    async fn enter(&self, op: ClusterOp, target: &str) -> ClusterResult<()> {
        self.journal.write().await.push(JournalEntry {
            op,
            target: target.to_string(),
        });
        let injected = self
            .faults
            .write()
            .await
            .get_mut(&op)
            .and_then(VecDeque::pop_front);
        match injected {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Lock the state for a read, letting the driver act first.
    async fn observed(&self) -> tokio::sync::RwLockWriteGuard<'_, ClusterState> {
        let mut state = self.state.write().await;
        if let Some(driver) = self.driver.read().await.as_ref() {
            driver(&mut state);
        }
        state.settle();
        state
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn create_namespace(&self, name: &str, _run_id: &str) -> ClusterResult<()> {
        self.enter(ClusterOp::CreateNamespace, name).await?;
        let mut state = self.state.write().await;
        if !state.namespaces.insert(name.to_string()) {
            return Err(ClusterError::AlreadyExists {
                kind: "namespace",
                name: name.to_string(),
            });
        }
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> ClusterResult<()> {
        self.enter(ClusterOp::DeleteNamespace, name).await?;
        let mut state = self.state.write().await;
        if !state.namespaces.remove(name) {
            return Err(ClusterError::not_found("namespace", name));
        }
        state.jobs.retain(|(ns, _), _| ns != name);
        state.pods.retain(|p| p.namespace != name);
        state.settle();
        Ok(())
    }

    async fn namespace_exists(&self, name: &str) -> ClusterResult<bool> {
        self.enter(ClusterOp::NamespaceExists, name).await?;
        Ok(self.state.read().await.namespaces.contains(name))
    }

    async fn create_queue(&self, name: &str, weight: u32, _run_id: &str) -> ClusterResult<()> {
        self.enter(ClusterOp::CreateQueue, name).await?;
        let mut state = self.state.write().await;
        if state.queues.contains_key(name) {
            return Err(ClusterError::AlreadyExists {
                kind: "queue",
                name: name.to_string(),
            });
        }
        state.queues.insert(
            name.to_string(),
            QueueRecord {
                weight,
                status: open_queue(),
            },
        );
        Ok(())
    }

    async fn get_queue(&self, name: &str) -> ClusterResult<QueueStatus> {
        self.enter(ClusterOp::GetQueue, name).await?;
        let state = self.observed().await;
        state
            .queues
            .get(name)
            .map(|q| q.status)
            .ok_or_else(|| ClusterError::not_found("queue", name))
    }

    async fn close_queue(&self, name: &str) -> ClusterResult<()> {
        self.enter(ClusterOp::CloseQueue, name).await?;
        let mut state = self.state.write().await;
        let queue = state
            .queues
            .get_mut(name)
            .ok_or_else(|| ClusterError::not_found("queue", name))?;
        queue.status.state = QueueState::Closed;
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> ClusterResult<()> {
        self.enter(ClusterOp::DeleteQueue, name).await?;
        let mut state = self.state.write().await;
        match state.queues.get(name) {
            None => Err(ClusterError::not_found("queue", name)),
            Some(q) if q.status.state != QueueState::Closed => Err(ClusterError::Invalid(
                format!("queue {} must be Closed before deletion", name),
            )),
            Some(_) => {
                state.queues.remove(name);
                Ok(())
            }
        }
    }

    async fn create_priority_class(
        &self,
        class: &PriorityClass,
        _run_id: &str,
    ) -> ClusterResult<()> {
        self.enter(ClusterOp::CreatePriorityClass, &class.name).await?;
        let mut state = self.state.write().await;
        if state.priority_classes.contains_key(&class.name) {
            return Err(ClusterError::AlreadyExists {
                kind: "priorityclass",
                name: class.name.clone(),
            });
        }
        state
            .priority_classes
            .insert(class.name.clone(), class.value);
        Ok(())
    }

    async fn delete_priority_class(&self, name: &str) -> ClusterResult<()> {
        self.enter(ClusterOp::DeletePriorityClass, name).await?;
        let mut state = self.state.write().await;
        state
            .priority_classes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ClusterError::not_found("priorityclass", name))
    }

    async fn submit_job(&self, namespace: &str, job: &JobSubmission) -> ClusterResult<JobHandle> {
        self.enter(ClusterOp::SubmitJob, &job.name).await?;
        let mut state = self.state.write().await;

        if !state.namespaces.contains(namespace) {
            return Err(ClusterError::not_found("namespace", namespace));
        }
        if !state.queues.contains_key(&job.queue) {
            return Err(ClusterError::QueueNotFound(job.queue.clone()));
        }
        if let Some(pc) = &job.priority_class {
            if !state.priority_classes.contains_key(pc) {
                return Err(ClusterError::Invalid(format!(
                    "priority class {} not found",
                    pc
                )));
            }
        }
        let key = (namespace.to_string(), job.name.clone());
        if state.jobs.contains_key(&key) {
            return Err(ClusterError::AlreadyExists {
                kind: "job",
                name: job.name.clone(),
            });
        }

        for (index, task) in job.tasks.iter().enumerate() {
            for replica in 0..task.replicas {
                let pod = PodRecord {
                    namespace: namespace.to_string(),
                    name: format!("{}-t{}-{}", job.name, index, replica),
                    job: Some(job.name.clone()),
                    node: None,
                    request: task.resources,
                    phase: PodPhase::Pending,
                };
                state.pods.push(pod);
            }
        }
        state.jobs.insert(
            key,
            JobRecord {
                namespace: namespace.to_string(),
                submission: job.clone(),
                phase: JobPhase::Pending,
            },
        );
        state.settle();

        Ok(JobHandle {
            namespace: namespace.to_string(),
            name: job.name.clone(),
            queue: job.queue.clone(),
            min_available: job.min_available,
        })
    }

    async fn get_job(&self, namespace: &str, name: &str) -> ClusterResult<JobStatus> {
        self.enter(ClusterOp::GetJob, name).await?;
        let state = self.observed().await;
        let job = state
            .jobs
            .get(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| ClusterError::not_found("job", name))?;
        Ok(JobStatus {
            phase: job.phase,
            min_available: job.submission.min_available,
            ready_tasks: state.ready_tasks(name),
        })
    }

    async fn list_job_pods(&self, namespace: &str, job: &str) -> ClusterResult<Vec<String>> {
        self.enter(ClusterOp::ListJobPods, job).await?;
        let state = self.observed().await;
        Ok(state
            .job_pods(job)
            .filter(|p| p.namespace == namespace)
            .map(|p| p.name.clone())
            .collect())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        self.enter(ClusterOp::DeletePod, name).await?;
        let mut state = self.state.write().await;
        let before = state.pods.len();
        state
            .pods
            .retain(|p| !(p.namespace == namespace && p.name == name));
        if state.pods.len() == before {
            return Err(ClusterError::not_found("pod", name));
        }
        state.settle();
        Ok(())
    }

    async fn schedulable_nodes(&self) -> ClusterResult<Vec<NodeCapacity>> {
        self.enter(ClusterOp::SchedulableNodes, "*").await?;
        let state = self.observed().await;
        Ok(state
            .nodes
            .iter()
            .map(|node| NodeCapacity {
                name: node.name.clone(),
                allocatable: node.allocatable,
                requested: node.requested + state.requested_on(&node.name),
            })
            .collect())
    }

    async fn create_placeholder(
        &self,
        namespace: &str,
        node: &str,
        request: &ResourceList,
    ) -> ClusterResult<()> {
        self.enter(ClusterOp::CreatePlaceholder, node).await?;
        let mut state = self.state.write().await;
        if !state.namespaces.contains(namespace) {
            return Err(ClusterError::not_found("namespace", namespace));
        }
        if !state.nodes.iter().any(|n| n.name == node) {
            return Err(ClusterError::not_found("node", node));
        }
        let serial = state.next_serial();
        state.pods.push(PodRecord {
            namespace: namespace.to_string(),
            name: format!("placeholder-{}", serial),
            job: None,
            node: Some(node.to_string()),
            request: *request,
            phase: PodPhase::Running,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reclaim_types::TaskSpec;

    fn submission(name: &str, queue: &str, replicas: u32) -> JobSubmission {
        JobSubmission {
            name: name.to_string(),
            queue: queue.to_string(),
            priority_class: None,
            tasks: vec![TaskSpec::new("nginx:1.14", ResourceList::ONE_CPU).with_replicas(1, replicas)],
            min_available: 1,
        }
    }

    #[tokio::test]
    async fn test_submit_requires_existing_queue() {
        let cluster = InMemoryCluster::new();
        cluster.create_namespace("ns", "r").await.unwrap();

        let err = cluster
            .submit_job("ns", &submission("j", "missing", 1))
            .await
            .unwrap_err();
        assert_eq!(err, ClusterError::QueueNotFound("missing".to_string()));

        let handle = cluster
            .submit_job("ns", &submission("j", DEFAULT_QUEUE, 2))
            .await
            .unwrap();
        assert_eq!(handle.min_available, 1);
        assert_eq!(cluster.list_job_pods("ns", "j").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_driver_moves_status() {
        let cluster = InMemoryCluster::new();
        cluster.create_namespace("ns", "r").await.unwrap();
        cluster
            .submit_job("ns", &submission("j", DEFAULT_QUEUE, 3))
            .await
            .unwrap();

        let status = cluster.get_job("ns", "j").await.unwrap();
        assert_eq!(status.phase, JobPhase::Pending);
        assert_eq!(cluster.get_queue(DEFAULT_QUEUE).await.unwrap().pending, 1);

        cluster.set_driver(|s| s.set_running("j", 2)).await;
        let status = cluster.get_job("ns", "j").await.unwrap();
        assert_eq!(status.ready_tasks, 2);
        assert!(status.is_ready());

        let queue = cluster.get_queue(DEFAULT_QUEUE).await.unwrap();
        assert_eq!((queue.running, queue.pending), (1, 0));
    }

    #[tokio::test]
    async fn test_deleted_pods_leave_job_pending() {
        let cluster = InMemoryCluster::new();
        cluster.create_namespace("ns", "r").await.unwrap();
        cluster
            .submit_job("ns", &submission("j", DEFAULT_QUEUE, 1))
            .await
            .unwrap();
        cluster.set_driver(ClusterState::run_all).await;
        assert!(cluster.get_job("ns", "j").await.unwrap().is_ready());

        for pod in cluster.list_job_pods("ns", "j").await.unwrap() {
            cluster.delete_pod("ns", &pod).await.unwrap();
        }
        let status = cluster.get_job("ns", "j").await.unwrap();
        assert_eq!(status.phase, JobPhase::Pending);
        assert_eq!(status.ready_tasks, 0);
    }

    #[tokio::test]
    async fn test_queue_must_close_before_delete() {
        let cluster = InMemoryCluster::new();
        cluster.create_queue("q", 1, "r").await.unwrap();
        assert!(matches!(
            cluster.delete_queue("q").await,
            Err(ClusterError::Invalid(_))
        ));
        cluster.close_queue("q").await.unwrap();
        cluster.delete_queue("q").await.unwrap();
        assert!(cluster.get_queue("q").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_fault_injection_is_one_shot() {
        let cluster = InMemoryCluster::new();
        cluster
            .fail_next(ClusterOp::GetQueue, ClusterError::Forbidden("rbac".into()))
            .await;
        assert_eq!(
            cluster.get_queue(DEFAULT_QUEUE).await,
            Err(ClusterError::Forbidden("rbac".into()))
        );
        assert!(cluster.get_queue(DEFAULT_QUEUE).await.is_ok());

        let ops: Vec<ClusterOp> = cluster.journal().await.iter().map(|e| e.op).collect();
        assert_eq!(ops, vec![ClusterOp::GetQueue, ClusterOp::GetQueue]);
    }

    #[tokio::test]
    async fn test_placeholders_count_against_nodes() {
        let cluster = InMemoryCluster::with_nodes(2, ResourceList::CPU4_MEM4);
        cluster.create_namespace("ns", "r").await.unwrap();
        cluster
            .create_placeholder("ns", "node-0", &ResourceList::new(3000, 0))
            .await
            .unwrap();

        let nodes = cluster.schedulable_nodes().await.unwrap();
        assert_eq!(nodes[0].free(), ResourceList::new(1000, 4096 * 1024 * 1024));
        assert_eq!(nodes[1].free(), ResourceList::CPU4_MEM4);

        cluster.delete_namespace("ns").await.unwrap();
        let nodes = cluster.schedulable_nodes().await.unwrap();
        assert_eq!(nodes[0].free(), ResourceList::CPU4_MEM4);
    }

    #[tokio::test]
    async fn test_unknown_priority_class_rejected() {
        let cluster = InMemoryCluster::new();
        cluster.create_namespace("ns", "r").await.unwrap();
        let mut job = submission("j", DEFAULT_QUEUE, 1);
        job.priority_class = Some("high-priority-x".into());
        assert!(matches!(
            cluster.submit_job("ns", &job).await,
            Err(ClusterError::Invalid(_))
        ));
    }
}
