use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, ObjectReference, Pod};
use kube::api::{DeleteParams, EvictParams, ListParams, Patch, PatchParams, Preconditions};
use kube::runtime::events::{EventType, Recorder};
use kube::runtime::reflector::ObjectRef;
use kube::{Api, ResourceExt};
use serde_json::json;
use tracing::trace;

use crate::api_resolver::ApiResolver;
use crate::labels_and_annotations::finalizers_without_termination;
use crate::report::report;

/// Operations against the cluster that node termination depends on.
///
/// Errors keep the apiserver status so callers can tell "gone", "rejected by admission" and
/// "throttled" apart with [`crate::error_codes`].
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// `Ok(None)` when the node doesn't exist.
    async fn get_node(&self, name: &str) -> kube::Result<Option<Node>>;

    /// Returns the cordoned node.
    async fn cordon_node(&self, name: &str) -> kube::Result<Node>;

    /// Drops the termination finalizer. Fails with a conflict if the node changed since it was read.
    async fn remove_termination_finalizer(&self, node: &Node) -> kube::Result<()>;

    async fn list_pods_on_node(&self, node_name: &str) -> kube::Result<Vec<Pod>>;

    /// Creates an Eviction, which is subject to PodDisruptionBudget admission.
    ///
    /// When the reference carries a UID, it is sent as a precondition. A pod recreated under the
    /// same name is answered with a conflict instead of being evicted.
    async fn evict_pod(&self, pod: &ObjectRef<Pod>) -> kube::Result<()>;

    /// Best effort. Failures are not reported back.
    async fn publish_event(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        action: &str,
        reason: &str,
        note: String,
    );
}

pub struct KubeClusterApi {
    api_resolver: ApiResolver,
    recorder: Recorder,
}

impl KubeClusterApi {
    pub fn new(api_resolver: ApiResolver, recorder: Recorder) -> Self {
        Self {
            api_resolver,
            recorder,
        }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_node(&self, name: &str) -> kube::Result<Option<Node>> {
        let api: Api<Node> = self.api_resolver.cluster();
        api.get_opt(name).await
    }

    async fn cordon_node(&self, name: &str) -> kube::Result<Node> {
        let api: Api<Node> = self.api_resolver.cluster();
        api.cordon(name).await
    }

    async fn remove_termination_finalizer(&self, node: &Node) -> kube::Result<()> {
        let api: Api<Node> = self.api_resolver.cluster();
        // resourceVersion makes the merge patch fail with 409 when someone else touched finalizers.
        let patch = json!({
            "metadata": {
                "finalizers": finalizers_without_termination(node),
                "resourceVersion": node.resource_version(),
            }
        });

        trace!(?patch, "removing finalizer");
        api.patch(&node.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn list_pods_on_node(&self, node_name: &str) -> kube::Result<Vec<Pod>> {
        let api: Api<Pod> = self.api_resolver.all();
        let params = ListParams::default().fields(&format!("spec.nodeName={node_name}"));
        let pods = api.list(&params).await?;
        Ok(pods.items)
    }

    async fn evict_pod(&self, pod: &ObjectRef<Pod>) -> kube::Result<()> {
        let api = self.api_resolver.api_for_ref(pod);
        let params = EvictParams {
            delete_options: Some(DeleteParams {
                preconditions: pod.extra.uid.as_ref().map(|uid| Preconditions {
                    uid: Some(uid.clone()),
                    resource_version: None,
                }),
                ..DeleteParams::default()
            }),
            ..EvictParams::default()
        };

        api.evict(&pod.name, &params).await?;
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
        report(&self.recorder, reference, type_, action, reason, note).await;
    }
}
