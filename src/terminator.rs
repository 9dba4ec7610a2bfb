use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;
use kube::runtime::reflector::ObjectRef;
use tracing::{debug, info, trace};

use crate::clock::Clock;
use crate::cluster::ClusterApi;
use crate::error_codes::is_gone_error;
use crate::eviction_queue::EvictionQueue;
use crate::labels_and_annotations::{has_do_not_evict_annotation, is_node_unschedulable};
use crate::pod_state::{
    is_owned_by_node, is_pod_finished, is_pod_stuck_terminating, tolerates_unschedulable,
};

/// Cordons a node and feeds its pods into the [`EvictionQueue`].
///
/// Keeps nothing between calls. Every drain lists the pods again, so concurrent changes to the
/// node's pods are never missed.
pub struct Terminator {
    cluster: Arc<dyn ClusterApi>,
    eviction_queue: EvictionQueue,
    clock: Clock,
    stuck_terminating_after: Duration,
}

#[derive(Debug, Eq, PartialEq)]
enum PodDisposition {
    /// Doesn't hold the node.
    Ignore,
    /// Holds the node, and nothing is evicted while it's there.
    Block,
    Evict,
}

impl Terminator {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        eviction_queue: EvictionQueue,
        clock: Clock,
        stuck_terminating_after: Duration,
    ) -> Self {
        Self {
            cluster,
            eviction_queue,
            clock,
            stuck_terminating_after,
        }
    }

    /// Returns the node as it is after cordoning, or `None` if it is gone.
    pub async fn cordon(&self, node: Node) -> kube::Result<Option<Node>> {
        if is_node_unschedulable(&node) {
            return Ok(Some(node));
        }

        match self.cluster.cordon_node(&node.name_any()).await {
            Ok(cordoned) => {
                info!("node is cordoned");
                Ok(Some(cordoned))
            }
            Err(err) if is_gone_error(&err) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Returns `true` once no pod that has to be evicted is left on the node.
    ///
    /// Being enqueued isn't enough. The pod has to actually leave the node.
    pub async fn drain(&self, node: &Node) -> kube::Result<bool> {
        let pods = self.cluster.list_pods_on_node(&node.name_any()).await?;
        let now = self.clock.now();

        let mut evictable = Vec::new();
        for pod in pods.iter() {
            match self.disposition(pod, now) {
                PodDisposition::Ignore => {}
                PodDisposition::Block => {
                    let pod = ObjectRef::from_obj(pod);
                    debug!(%pod, "pod has do-not-evict annotation, unable to drain");
                    return Ok(false);
                }
                PodDisposition::Evict => evictable.push(pod),
            }
        }

        if evictable.is_empty() {
            return Ok(true);
        }

        for pod in evictable {
            let pod = ObjectRef::from_obj(pod);
            if self.eviction_queue.add(pod.clone()) {
                debug!(%pod, "pod is enqueued for eviction");
            } else {
                trace!(%pod, "pod is already enqueued");
            }
        }

        Ok(false)
    }

    fn disposition(&self, pod: &Pod, now: DateTime<Utc>) -> PodDisposition {
        if is_pod_finished(pod) || is_pod_stuck_terminating(pod, now, self.stuck_terminating_after)
        {
            return PodDisposition::Ignore;
        }

        if has_do_not_evict_annotation(pod) {
            return PodDisposition::Block;
        }

        if is_owned_by_node(pod) || tolerates_unschedulable(pod) {
            return PodDisposition::Ignore;
        }

        PodDisposition::Evict
    }
}
