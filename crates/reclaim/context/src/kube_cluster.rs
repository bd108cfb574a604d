//! [`ClusterApi`] backed by a live Kubernetes API server running the
//! Volcano scheduler.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, Namespace, Node, Pod, PodSpec, ResourceRequirements};
use k8s_openapi::api::scheduling::v1::PriorityClass as KubePriorityClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{
    Api, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams,
    PostParams,
};
use kube::discovery::ApiResource;
use kube::Client;
use reclaim_types::{
    JobPhase, JobStatus, PriorityClass, QueueState, QueueStatus, ResourceList, JOB_NAME_LABEL,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, instrument};

use crate::cluster::{
    ClusterApi, JobHandle, JobSubmission, NodeCapacity, PLACEHOLDER_LABEL, RUN_ID_LABEL,
};
use crate::error::{ClusterError, ClusterResult};

const SCHEDULER_NAME: &str = "volcano";
const PAUSE_IMAGE: &str = "registry.k8s.io/pause:3.9";
const MANAGED_BY: &str = "reclaim-harness";

/// Live cluster access through `kube`.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    queue_resource: ApiResource,
    job_resource: ApiResource,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            queue_resource: ApiResource::from_gvk(&GroupVersionKind::gvk(
                "scheduling.volcano.sh",
                "v1beta1",
                "Queue",
            )),
            job_resource: ApiResource::from_gvk(&GroupVersionKind::gvk(
                "batch.volcano.sh",
                "v1alpha1",
                "Job",
            )),
        }
    }

    /// Connect using the ambient kubeconfig or in-cluster configuration.
    pub async fn try_default() -> ClusterResult<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))?;
        Ok(Self::new(client))
    }

    fn queues(&self) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), &self.queue_resource)
    }

    fn jobs(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.job_resource)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    #[instrument(skip(self))]
    async fn create_namespace(&self, name: &str, run_id: &str) -> ClusterResult<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(harness_labels(run_id)),
                ..Default::default()
            },
            ..Default::default()
        };
        api.create(&PostParams::default(), &ns)
            .await
            .map_err(|e| map_kube_error(e, "namespace", name))?;
        info!(namespace = %name, "Namespace created");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_namespace(&self, name: &str) -> ClusterResult<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::foreground())
            .await
            .map_err(|e| map_kube_error(e, "namespace", name))?;
        Ok(())
    }

    async fn namespace_exists(&self, name: &str) -> ClusterResult<bool> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = api
            .get_opt(name)
            .await
            .map_err(|e| map_kube_error(e, "namespace", name))?;
        Ok(ns.is_some())
    }

    #[instrument(skip(self))]
    async fn create_queue(&self, name: &str, weight: u32, run_id: &str) -> ClusterResult<()> {
        let mut queue = DynamicObject::new(name, &self.queue_resource).data(json!({
            "spec": { "weight": weight, "reclaimable": true }
        }));
        queue.metadata.labels = Some(harness_labels(run_id));

        self.queues()
            .create(&PostParams::default(), &queue)
            .await
            .map_err(|e| map_kube_error(e, "queue", name))?;
        info!(queue = %name, weight, "Queue created");
        Ok(())
    }

    async fn get_queue(&self, name: &str) -> ClusterResult<QueueStatus> {
        let queue = self
            .queues()
            .get(name)
            .await
            .map_err(|e| map_kube_error(e, "queue", name))?;
        decode_queue_status(name, &queue.data)
    }

    async fn close_queue(&self, name: &str) -> ClusterResult<()> {
        let patch = json!({ "status": { "state": QueueState::Closed.as_str() } });
        self.queues()
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_kube_error(e, "queue", name))?;
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> ClusterResult<()> {
        self.queues()
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_kube_error(e, "queue", name))?;
        Ok(())
    }

    async fn create_priority_class(
        &self,
        class: &PriorityClass,
        run_id: &str,
    ) -> ClusterResult<()> {
        let api: Api<KubePriorityClass> = Api::all(self.client.clone());
        let pc = KubePriorityClass {
            metadata: ObjectMeta {
                name: Some(class.name.clone()),
                labels: Some(harness_labels(run_id)),
                ..Default::default()
            },
            value: class.value,
            global_default: Some(false),
            description: Some("reclaim scenario priority".to_string()),
            ..Default::default()
        };
        api.create(&PostParams::default(), &pc)
            .await
            .map_err(|e| map_kube_error(e, "priorityclass", &class.name))?;
        info!(priority_class = %class.name, value = class.value, "Priority class created");
        Ok(())
    }

    async fn delete_priority_class(&self, name: &str) -> ClusterResult<()> {
        let api: Api<KubePriorityClass> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_kube_error(e, "priorityclass", name))?;
        Ok(())
    }

    #[instrument(skip(self, job), fields(job = %job.name, queue = %job.queue))]
    async fn submit_job(&self, namespace: &str, job: &JobSubmission) -> ClusterResult<JobHandle> {
        let obj = DynamicObject::new(&job.name, &self.job_resource)
            .within(namespace)
            .data(job_manifest(job));

        match self.jobs(namespace).create(&PostParams::default(), &obj).await {
            Ok(_) => {
                info!(min_available = job.min_available, "Job submitted");
                Ok(JobHandle {
                    namespace: namespace.to_string(),
                    name: job.name.clone(),
                    queue: job.queue.clone(),
                    min_available: job.min_available,
                })
            }
            Err(kube::Error::Api(resp)) if mentions_missing_queue(&resp.message) => {
                debug!(message = %resp.message, "Submission rejected for missing queue");
                Err(ClusterError::QueueNotFound(job.queue.clone()))
            }
            Err(e) => Err(map_kube_error(e, "job", &job.name)),
        }
    }

    async fn get_job(&self, namespace: &str, name: &str) -> ClusterResult<JobStatus> {
        let job = self
            .jobs(namespace)
            .get(name)
            .await
            .map_err(|e| map_kube_error(e, "job", name))?;
        let (phase, min_available) = decode_job(name, &job.data)?;

        let pods = self
            .pods(namespace)
            .list(&job_selector(name))
            .await
            .map_err(|e| map_kube_error(e, "pod", name))?;
        let ready_tasks = pods
            .items
            .iter()
            .filter(|pod| {
                matches!(
                    pod.status.as_ref().and_then(|s| s.phase.as_deref()),
                    Some("Running") | Some("Succeeded")
                )
            })
            .count() as u32;

        Ok(JobStatus {
            phase,
            min_available,
            ready_tasks,
        })
    }

    async fn list_job_pods(&self, namespace: &str, job: &str) -> ClusterResult<Vec<String>> {
        let pods = self
            .pods(namespace)
            .list(&job_selector(job))
            .await
            .map_err(|e| map_kube_error(e, "pod", job))?;
        Ok(pods
            .items
            .into_iter()
            .filter_map(|pod| pod.metadata.name)
            .collect())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        self.pods(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_kube_error(e, "pod", name))?;
        Ok(())
    }

    async fn schedulable_nodes(&self) -> ClusterResult<Vec<NodeCapacity>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let pods: Api<Pod> = Api::all(self.client.clone());

        let node_list = nodes
            .list(&ListParams::default())
            .await
            .map_err(|e| map_kube_error(e, "node", "*"))?;
        let pod_list = pods
            .list(&ListParams::default().fields("status.phase!=Succeeded,status.phase!=Failed"))
            .await
            .map_err(|e| map_kube_error(e, "pod", "*"))?;

        let requested = requested_by_node(&pod_list.items)?;

        let mut capacities = Vec::new();
        for node in &node_list.items {
            if !is_schedulable(node) {
                continue;
            }
            let name = node.metadata.name.clone().unwrap_or_default();
            let allocatable = node_allocatable(node)?;
            let used = requested.get(&name).copied().unwrap_or_default();
            capacities.push(NodeCapacity {
                name,
                allocatable,
                requested: used,
            });
        }

        debug!(nodes = capacities.len(), "Listed schedulable nodes");
        Ok(capacities)
    }

    async fn create_placeholder(
        &self,
        namespace: &str,
        node: &str,
        request: &ResourceList,
    ) -> ClusterResult<()> {
        let quantities: BTreeMap<String, Quantity> = request
            .to_quantity_map()
            .into_iter()
            .map(|(k, v)| (k, Quantity(v)))
            .collect();

        let pod = Pod {
            metadata: ObjectMeta {
                generate_name: Some("placeholder-".to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([(
                    PLACEHOLDER_LABEL.to_string(),
                    "true".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node.to_string()),
                restart_policy: Some("Never".to_string()),
                containers: vec![Container {
                    name: "placeholder".to_string(),
                    image: Some(PAUSE_IMAGE.to_string()),
                    resources: Some(ResourceRequirements {
                        requests: Some(quantities.clone()),
                        limits: Some(quantities),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        };

        self.pods(namespace)
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|e| map_kube_error(e, "pod", "placeholder"))?;
        info!(node = %node, request = %request, "Placeholder pinned");
        Ok(())
    }
}

fn harness_labels(run_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/managed-by".to_string(),
            MANAGED_BY.to_string(),
        ),
        (RUN_ID_LABEL.to_string(), run_id.to_string()),
    ])
}

fn job_selector(job: &str) -> ListParams {
    ListParams::default().labels(&format!("{}={}", JOB_NAME_LABEL, job))
}

/// Translate a `kube` error into the harness taxonomy.
fn map_kube_error(err: kube::Error, kind: &'static str, name: &str) -> ClusterError {
    match err {
        kube::Error::Api(resp) => match resp.code {
            404 => ClusterError::not_found(kind, name),
            409 => ClusterError::AlreadyExists {
                kind,
                name: name.to_string(),
            },
            401 | 403 => ClusterError::Forbidden(resp.message),
            400 | 422 => ClusterError::Invalid(resp.message),
            code => ClusterError::Api {
                code,
                message: resp.message,
            },
        },
        kube::Error::SerdeError(e) => ClusterError::Decode {
            kind,
            name: name.to_string(),
            reason: e.to_string(),
        },
        other => ClusterError::Transport(other.to_string()),
    }
}

/// The admission webhook rejects jobs for unknown queues with a message
/// naming the queue; no dedicated status reason exists.
fn mentions_missing_queue(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("queue")
        && (lower.contains("not found")
            || lower.contains("unable to find")
            || lower.contains("not exist"))
}

/// Build the `batch.volcano.sh/v1alpha1` Job body (everything but
/// metadata).
fn job_manifest(job: &JobSubmission) -> Value {
    let tasks: Vec<Value> = job
        .tasks
        .iter()
        .enumerate()
        .map(|(index, task)| {
            let task_name = format!("t{}", index);
            let resources = task.resources.to_quantity_map();
            let mut pod_spec = json!({
                "schedulerName": SCHEDULER_NAME,
                "restartPolicy": "Never",
                "containers": [{
                    "name": task_name,
                    "image": task.image,
                    "imagePullPolicy": "IfNotPresent",
                    "resources": { "requests": resources, "limits": resources },
                }],
            });
            if let Some(pc) = &job.priority_class {
                pod_spec["priorityClassName"] = json!(pc);
            }
            json!({
                "name": task_name,
                "replicas": task.replicas,
                "minAvailable": task.min_available,
                "template": {
                    "metadata": { "name": task_name },
                    "spec": pod_spec,
                },
            })
        })
        .collect();

    let mut spec = json!({
        "schedulerName": SCHEDULER_NAME,
        "minAvailable": job.min_available,
        "queue": job.queue,
        "tasks": tasks,
    });
    if let Some(pc) = &job.priority_class {
        spec["priorityClassName"] = json!(pc);
    }
    json!({ "spec": spec })
}

#[derive(Debug, Default, Deserialize)]
struct RawQueueStatus {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    running: u32,
    #[serde(default)]
    pending: u32,
    #[serde(default)]
    inqueue: u32,
}

fn decode_queue_status(name: &str, data: &Value) -> ClusterResult<QueueStatus> {
    let raw: RawQueueStatus = match data.get("status") {
        None | Some(Value::Null) => RawQueueStatus::default(),
        Some(status) => {
            serde_json::from_value(status.clone()).map_err(|e| ClusterError::Decode {
                kind: "queue",
                name: name.to_string(),
                reason: e.to_string(),
            })?
        }
    };

    Ok(QueueStatus {
        state: raw
            .state
            .as_deref()
            .map(QueueState::from_status)
            .unwrap_or(QueueState::Unknown),
        running: raw.running,
        pending: raw.pending,
        inqueue: raw.inqueue,
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawJob {
    #[serde(default)]
    spec: RawJobSpec,
    #[serde(default)]
    status: Option<RawJobStatus>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawJobSpec {
    #[serde(default)]
    min_available: u32,
}

#[derive(Debug, Default, Deserialize)]
struct RawJobStatus {
    #[serde(default)]
    state: Option<RawJobState>,
}

#[derive(Debug, Default, Deserialize)]
struct RawJobState {
    #[serde(default)]
    phase: Option<String>,
}

/// Phase and gang threshold of a job; a job without status is `Unknown`.
fn decode_job(name: &str, data: &Value) -> ClusterResult<(JobPhase, u32)> {
    let raw: RawJob = serde_json::from_value(data.clone()).map_err(|e| ClusterError::Decode {
        kind: "job",
        name: name.to_string(),
        reason: e.to_string(),
    })?;
    let phase = raw
        .status
        .and_then(|s| s.state)
        .and_then(|s| s.phase)
        .map(|p| JobPhase::from_status(&p))
        .unwrap_or(JobPhase::Unknown);
    Ok((phase, raw.spec.min_available))
}

fn quantity_pair(
    map: Option<&BTreeMap<String, Quantity>>,
    kind: &'static str,
    name: &str,
) -> ClusterResult<ResourceList> {
    let cpu = map.and_then(|m| m.get("cpu")).map(|q| q.0.as_str());
    let memory = map.and_then(|m| m.get("memory")).map(|q| q.0.as_str());
    ResourceList::from_quantities(cpu, memory).map_err(|e| ClusterError::Decode {
        kind,
        name: name.to_string(),
        reason: e.to_string(),
    })
}

/// Requests of bound, non-terminating pods summed per node.
fn requested_by_node(pods: &[Pod]) -> ClusterResult<HashMap<String, ResourceList>> {
    let mut requested: HashMap<String, ResourceList> = HashMap::new();
    for pod in pods {
        if pod.metadata.deletion_timestamp.is_some() {
            continue;
        }
        let Some(node) = pod.spec.as_ref().and_then(|s| s.node_name.clone()) else {
            continue;
        };
        let request = pod_requests(pod)?;
        let entry = requested.entry(node).or_default();
        *entry = *entry + request;
    }
    Ok(requested)
}

fn pod_requests(pod: &Pod) -> ClusterResult<ResourceList> {
    let name = pod.metadata.name.as_deref().unwrap_or_default();
    let mut total = ResourceList::default();
    if let Some(spec) = &pod.spec {
        for container in &spec.containers {
            let requests = container.resources.as_ref().and_then(|r| r.requests.as_ref());
            total = total + quantity_pair(requests, "pod", name)?;
        }
    }
    Ok(total)
}

fn node_allocatable(node: &Node) -> ClusterResult<ResourceList> {
    let name = node.metadata.name.as_deref().unwrap_or_default();
    let allocatable = node.status.as_ref().and_then(|s| s.allocatable.as_ref());
    quantity_pair(allocatable, "node", name)
}

/// Ready, not cordoned, and free of NoSchedule/NoExecute taints.
fn is_schedulable(node: &Node) -> bool {
    let Some(spec) = &node.spec else {
        return false;
    };
    if spec.unschedulable == Some(true) {
        return false;
    }
    let tainted = spec.taints.as_ref().is_some_and(|taints| {
        taints
            .iter()
            .any(|t| t.effect == "NoSchedule" || t.effect == "NoExecute")
    });
    if tainted {
        return false;
    }
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reclaim_types::TaskSpec;

    fn submission(priority: Option<&str>) -> JobSubmission {
        JobSubmission {
            name: "q1-qj-1".to_string(),
            queue: "reclaim-q1-abcd1234".to_string(),
            priority_class: priority.map(str::to_string),
            tasks: vec![TaskSpec::new("nginx:1.14", ResourceList::ONE_CPU).with_replicas(1, 4)],
            min_available: 1,
        }
    }

    #[test]
    fn test_job_manifest_shape() {
        let manifest = job_manifest(&submission(Some("low-priority-abcd1234")));
        let spec = &manifest["spec"];
        assert_eq!(spec["schedulerName"], "volcano");
        assert_eq!(spec["queue"], "reclaim-q1-abcd1234");
        assert_eq!(spec["minAvailable"], 1);
        assert_eq!(spec["priorityClassName"], "low-priority-abcd1234");

        let task = &spec["tasks"][0];
        assert_eq!(task["replicas"], 4);
        assert_eq!(task["minAvailable"], 1);
        let container = &task["template"]["spec"]["containers"][0];
        assert_eq!(container["image"], "nginx:1.14");
        assert_eq!(container["resources"]["requests"]["cpu"], "1000m");
        assert!(container["resources"]["requests"].get("memory").is_none());
        assert_eq!(
            task["template"]["spec"]["priorityClassName"],
            "low-priority-abcd1234"
        );
    }

    #[test]
    fn test_job_manifest_without_priority() {
        let manifest = job_manifest(&submission(None));
        assert!(manifest["spec"].get("priorityClassName").is_none());
    }

    #[test]
    fn test_decode_queue_status() {
        let data = json!({
            "spec": { "weight": 1 },
            "status": { "state": "Open", "running": 1, "pending": 2, "reservation": {} }
        });
        let status = decode_queue_status("q1", &data).unwrap();
        assert_eq!(status.state, QueueState::Open);
        assert_eq!(status.running, 1);
        assert_eq!(status.pending, 2);
        assert_eq!(status.inqueue, 0);
    }

    #[test]
    fn test_decode_queue_without_status() {
        let status = decode_queue_status("q1", &json!({ "spec": {} })).unwrap();
        assert_eq!(status, QueueStatus::default());
    }

    #[test]
    fn test_decode_queue_malformed_status() {
        let err = decode_queue_status("q1", &json!({ "status": { "running": "many" } }));
        assert!(matches!(err, Err(ClusterError::Decode { kind: "queue", .. })));
    }

    #[test]
    fn test_decode_job() {
        let data = json!({
            "spec": { "minAvailable": 3, "queue": "q1" },
            "status": { "state": { "phase": "Pending" } }
        });
        assert_eq!(decode_job("j", &data).unwrap(), (JobPhase::Pending, 3));
        let fresh = json!({ "spec": { "minAvailable": 1 } });
        assert_eq!(decode_job("j", &fresh).unwrap(), (JobPhase::Unknown, 1));
    }

    #[test]
    fn test_missing_queue_messages() {
        assert!(mentions_missing_queue(
            "admission webhook \"validatejob.volcano.sh\" denied the request: unable to find job queue: reclaim-q3"
        ));
        assert!(mentions_missing_queue("queue reclaim-q3 not found"));
        assert!(!mentions_missing_queue("priority class not found"));
    }

    #[test]
    fn test_schedulable_node_filter() {
        let ready: Node = serde_json::from_value(json!({
            "metadata": { "name": "n1" },
            "spec": {},
            "status": {
                "allocatable": { "cpu": "4", "memory": "8Gi" },
                "conditions": [{ "type": "Ready", "status": "True" }]
            }
        }))
        .unwrap();
        assert!(is_schedulable(&ready));
        assert_eq!(
            node_allocatable(&ready).unwrap(),
            ResourceList::new(4000, 8 * 1024 * 1024 * 1024)
        );

        let mut tainted = ready.clone();
        tainted.spec = serde_json::from_value(json!({
            "taints": [{ "key": "node-role.kubernetes.io/control-plane", "effect": "NoSchedule" }]
        }))
        .unwrap();
        assert!(!is_schedulable(&tainted));

        let mut cordoned = ready.clone();
        cordoned.spec = serde_json::from_value(json!({ "unschedulable": true })).unwrap();
        assert!(!is_schedulable(&cordoned));
    }

    #[test]
    fn test_pod_requests_sum_containers() {
        let pod: Pod = serde_json::from_value(json!({
            "metadata": { "name": "p" },
            "spec": {
                "containers": [
                    { "name": "a", "resources": { "requests": { "cpu": "250m", "memory": "64Mi" } } },
                    { "name": "b", "resources": { "requests": { "cpu": "750m" } } },
                    { "name": "c" }
                ]
            }
        }))
        .unwrap();
        assert_eq!(
            pod_requests(&pod).unwrap(),
            ResourceList::new(1000, 64 * 1024 * 1024)
        );
    }

    #[test]
    fn test_requested_by_node_skips_terminating_pods() {
        let pod = |name: &str, node: Option<&str>, deleting: bool| -> Pod {
            let mut metadata = json!({ "name": name });
            if deleting {
                metadata["deletionTimestamp"] = json!("2024-01-01T00:00:00Z");
            }
            let mut spec = json!({
                "containers": [
                    { "name": "c", "resources": { "requests": { "cpu": "1", "memory": "1Gi" } } }
                ]
            });
            if let Some(node) = node {
                spec["nodeName"] = json!(node);
            }
            serde_json::from_value(json!({ "metadata": metadata, "spec": spec })).unwrap()
        };

        let requested = requested_by_node(&[
            pod("running", Some("node-0"), false),
            pod("deleted-job-pod", Some("node-0"), true),
            pod("unbound", None, false),
            pod("other", Some("node-1"), false),
        ])
        .unwrap();

        assert_eq!(requested.len(), 2);
        assert_eq!(requested["node-0"], ResourceList::CPU1_MEM1);
        assert_eq!(requested["node-1"], ResourceList::CPU1_MEM1);
    }
}
