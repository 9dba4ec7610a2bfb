use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;

pub const CONTROLLER_NAME: &str = "node-graceful-drain";

/// Blocks the node object from being removed until it is drained.
pub const TERMINATION_FINALIZER: &str = "node-graceful-drain/termination";

/// A pod annotated with `"true"` holds the whole drain of its node.
pub const DO_NOT_EVICT_ANNOTATION_KEY: &str = "node-graceful-drain/do-not-evict";

pub fn has_termination_finalizer(node: &Node) -> bool {
    node.finalizers().iter().any(|x| x == TERMINATION_FINALIZER)
}

pub fn is_deletion_requested(node: &Node) -> bool {
    node.metadata.deletion_timestamp.is_some()
}

pub fn is_node_unschedulable(node: &Node) -> bool {
    matches!(node.spec.as_ref().and_then(|spec| spec.unschedulable), Some(true))
}

pub fn has_do_not_evict_annotation(pod: &Pod) -> bool {
    matches!(
        pod.annotations().get(DO_NOT_EVICT_ANNOTATION_KEY).map(|x| x.as_str()),
        Some("true")
    )
}

/// Finalizers that should remain after ours is removed.
pub fn finalizers_without_termination(node: &Node) -> Vec<String> {
    node.finalizers()
        .iter()
        .filter(|x| x.as_str() != TERMINATION_FINALIZER)
        .cloned()
        .collect()
}
