use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Node, NodeSpec, ObjectReference, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use kube::runtime::events::EventType;
use kube::runtime::reflector::ObjectRef;

use crate::cluster::ClusterApi;
use crate::error_codes::api_error;
use crate::labels_and_annotations::finalizers_without_termination;

type PodKey = (String, String);

/// In-memory cluster with just enough apiserver behavior for termination:
/// eviction admission against budgets, deletion timestamps, and finalizer-gated node removal.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    resource_version: u64,
    nodes: BTreeMap<String, Node>,
    pods: BTreeMap<PodKey, Pod>,
    budgets: Vec<Budget>,
    eviction_errors: HashMap<PodKey, VecDeque<kube::Error>>,
    list_errors: VecDeque<kube::Error>,
    finalizer_conflicts: usize,
    cordon_errors: VecDeque<kube::Error>,
    node_reads: usize,
    eviction_latency: Duration,
    eviction_attempts: HashMap<PodKey, usize>,
    evictions_in_flight: HashMap<PodKey, usize>,
    max_evictions_in_flight_per_pod: usize,
    max_evictions_in_flight: usize,
    events: Vec<RecordedEvent>,
}

/// `minAvailable` budget over pods carrying `app=<app>` in a namespace.
struct Budget {
    namespace: String,
    app: String,
    min_available: usize,
}

#[derive(Clone, Debug)]
pub struct RecordedEvent {
    pub kind: Option<String>,
    pub name: Option<String>,
    pub type_: EventType,
    pub action: String,
    pub reason: String,
    pub note: String,
}

fn pod_key(namespace: Option<&str>, name: &str) -> PodKey {
    (namespace.unwrap_or_default().to_owned(), name.to_owned())
}

impl FakeState {
    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn is_disruption_allowed(&self, pod: &Pod) -> bool {
        let namespace = pod.namespace().unwrap_or_default();
        let app = pod.labels().get("app");

        self.budgets
            .iter()
            .filter(|budget| budget.namespace == namespace && Some(&budget.app) == app)
            .all(|budget| {
                let healthy = self
                    .pods
                    .values()
                    .filter(|other| other.namespace().unwrap_or_default() == budget.namespace)
                    .filter(|other| other.labels().get("app") == Some(&budget.app))
                    .filter(|other| other.metadata.deletion_timestamp.is_none())
                    .count();
                healthy > budget.min_available
            })
    }
}

impl FakeCluster {
    pub fn add_node(&self, mut node: Node) {
        let mut state = self.state.lock().unwrap();
        node.metadata.resource_version = Some(state.next_resource_version());
        state.nodes.insert(node.name_any(), node);
    }

    pub fn add_pod(&self, pod: Pod) {
        let mut state = self.state.lock().unwrap();
        let key = pod_key(pod.metadata.namespace.as_deref(), &pod.name_any());
        state.pods.insert(key, pod);
    }

    pub fn add_budget(&self, namespace: &str, app: &str, min_available: usize) {
        self.state.lock().unwrap().budgets.push(Budget {
            namespace: namespace.to_owned(),
            app: app.to_owned(),
            min_available,
        });
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.state.lock().unwrap().nodes.get(name).cloned()
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        let key = pod_key(Some(namespace), name);
        self.state.lock().unwrap().pods.get(&key).cloned()
    }

    /// Deletes the pod right away, as a user or kubelet would.
    pub fn remove_pod(&self, namespace: &str, name: &str) {
        let key = pod_key(Some(namespace), name);
        self.state.lock().unwrap().pods.remove(&key);
    }

    /// Kubelet confirms the termination of every evicted pod.
    pub fn finish_terminating_pods(&self) {
        self.state
            .lock()
            .unwrap()
            .pods
            .retain(|_, pod| pod.metadata.deletion_timestamp.is_none());
    }

    pub fn inject_eviction_error(&self, namespace: &str, name: &str, err: kube::Error) {
        let key = pod_key(Some(namespace), name);
        let mut state = self.state.lock().unwrap();
        state.eviction_errors.entry(key).or_default().push_back(err);
    }

    pub fn inject_list_error(&self, err: kube::Error) {
        self.state.lock().unwrap().list_errors.push_back(err);
    }

    /// The node vanishes, or the apiserver fails, right after it was read.
    pub fn inject_cordon_error(&self, err: kube::Error) {
        self.state.lock().unwrap().cordon_errors.push_back(err);
    }

    /// Every eviction call takes this long, so that calls can overlap.
    pub fn set_eviction_latency(&self, latency: Duration) {
        self.state.lock().unwrap().eviction_latency = latency;
    }

    pub fn inject_finalizer_conflict(&self) {
        self.state.lock().unwrap().finalizer_conflicts += 1;
    }

    pub fn eviction_attempts(&self, namespace: &str, name: &str) -> usize {
        let key = pod_key(Some(namespace), name);
        let state = self.state.lock().unwrap();
        state.eviction_attempts.get(&key).copied().unwrap_or_default()
    }

    pub fn node_reads(&self) -> usize {
        self.state.lock().unwrap().node_reads
    }

    /// Highest number of concurrent eviction calls for a single pod.
    pub fn max_evictions_in_flight_per_pod(&self) -> usize {
        self.state.lock().unwrap().max_evictions_in_flight_per_pod
    }

    pub fn max_evictions_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_evictions_in_flight
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn has_event(&self, action: &str, reason: &str) -> bool {
        self.events()
            .iter()
            .any(|event| event.action == action && event.reason == reason)
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get_node(&self, name: &str) -> kube::Result<Option<Node>> {
        let mut state = self.state.lock().unwrap();
        state.node_reads += 1;
        Ok(state.nodes.get(name).cloned())
    }

    async fn cordon_node(&self, name: &str) -> kube::Result<Node> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.cordon_errors.pop_front() {
            return Err(err);
        }

        let resource_version = state.next_resource_version();
        let Some(node) = state.nodes.get_mut(name) else {
            return Err(api_error(404, "NotFound", "node not found"));
        };

        node.spec.get_or_insert_with(NodeSpec::default).unschedulable = Some(true);
        node.metadata.resource_version = Some(resource_version);
        Ok(node.clone())
    }

    async fn remove_termination_finalizer(&self, node: &Node) -> kube::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.finalizer_conflicts > 0 {
            state.finalizer_conflicts -= 1;
            return Err(api_error(409, "Conflict", "the object has been modified"));
        }

        let resource_version = state.next_resource_version();
        let name = node.name_any();
        let Some(stored) = state.nodes.get_mut(&name) else {
            return Err(api_error(404, "NotFound", "node not found"));
        };

        if stored.metadata.resource_version != node.metadata.resource_version {
            return Err(api_error(409, "Conflict", "the object has been modified"));
        }

        stored.metadata.finalizers = Some(finalizers_without_termination(node));
        stored.metadata.resource_version = Some(resource_version);

        let released = stored.metadata.deletion_timestamp.is_some() && stored.finalizers().is_empty();
        if released {
            state.nodes.remove(&name);
        }

        Ok(())
    }

    async fn list_pods_on_node(&self, node_name: &str) -> kube::Result<Vec<Pod>> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.list_errors.pop_front() {
            return Err(err);
        }

        let pods = state
            .pods
            .values()
            .filter(|pod| {
                pod.spec.as_ref().and_then(|spec| spec.node_name.as_deref()) == Some(node_name)
            })
            .cloned()
            .collect();
        Ok(pods)
    }

    async fn evict_pod(&self, pod: &ObjectRef<Pod>) -> kube::Result<()> {
        let key = pod_key(pod.namespace.as_deref(), &pod.name);
        let latency = {
            let mut state = self.state.lock().unwrap();
            *state.eviction_attempts.entry(key.clone()).or_default() += 1;

            let in_flight = state.evictions_in_flight.entry(key.clone()).or_default();
            *in_flight += 1;
            let in_flight = *in_flight;
            let total: usize = state.evictions_in_flight.values().sum();
            state.max_evictions_in_flight_per_pod =
                state.max_evictions_in_flight_per_pod.max(in_flight);
            state.max_evictions_in_flight = state.max_evictions_in_flight.max(total);
            state.eviction_latency
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(in_flight) = state.evictions_in_flight.get_mut(&key) {
            *in_flight -= 1;
        }

        if let Some(err) = state
            .eviction_errors
            .get_mut(&key)
            .and_then(|errors| errors.pop_front())
        {
            return Err(err);
        }

        let Some(stored) = state.pods.get(&key) else {
            return Err(api_error(404, "NotFound", "pod not found"));
        };

        if pod.extra.uid.is_some() && pod.extra.uid != stored.metadata.uid {
            return Err(api_error(
                409,
                "Conflict",
                "Precondition failed: UID in precondition does not match UID in object",
            ));
        }

        if stored.metadata.deletion_timestamp.is_some() {
            return Ok(());
        }

        if !state.is_disruption_allowed(stored) {
            return Err(api_error(
                429,
                "TooManyRequests",
                "Cannot evict pod as it would violate the pod's disruption budget.",
            ));
        }

        if let Some(stored) = state.pods.get_mut(&key) {
            stored.metadata.deletion_timestamp = Some(Time(Utc::now()));
        }
        Ok(())
    }

    async fn publish_event(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        action: &str,
        reason: &str,
        note: String,
    ) {
        self.state.lock().unwrap().events.push(RecordedEvent {
            kind: reference.kind.clone(),
            name: reference.name.clone(),
            type_,
            action: action.to_owned(),
            reason: reason.to_owned(),
            note,
        });
    }
}
