use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Pod, Toleration};
use kube::ResourceExt;

const UNSCHEDULABLE_TAINT_KEY: &str = "node.kubernetes.io/unschedulable";
const UNSCHEDULABLE_TAINT_EFFECT: &str = "NoSchedule";

/// Static and mirror pods are owned by the node itself, and kubelet will bring them back.
pub fn is_owned_by_node(pod: &Pod) -> bool {
    pod.owner_references().iter().any(|owner| owner.kind == "Node")
}

/// Such pods would be rescheduled onto the cordoned node anyway.
pub fn tolerates_unschedulable(pod: &Pod) -> bool {
    let Some(tolerations) = pod.spec.as_ref().and_then(|spec| spec.tolerations.as_ref()) else {
        return false;
    };

    tolerations.iter().any(|toleration| {
        tolerates_taint(
            toleration,
            UNSCHEDULABLE_TAINT_KEY,
            "",
            UNSCHEDULABLE_TAINT_EFFECT,
        )
    })
}

/// roughly follows `k8s.io/api/core/v1/toleration.go:ToleratesTaint`
fn tolerates_taint(toleration: &Toleration, key: &str, value: &str, effect: &str) -> bool {
    let toleration_effect = toleration.effect.as_deref().unwrap_or_default();
    if !toleration_effect.is_empty() && toleration_effect != effect {
        return false;
    }

    let toleration_key = toleration.key.as_deref().unwrap_or_default();
    if !toleration_key.is_empty() && toleration_key != key {
        return false;
    }

    match toleration.operator.as_deref() {
        None | Some("") | Some("Equal") => toleration.value.as_deref().unwrap_or_default() == value,
        Some("Exists") => true,
        Some(_) => false,
    }
}

pub fn is_pod_finished(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|status| status.phase.as_deref()),
        Some("Succeeded" | "Failed")
    )
}

/// A partitioned kubelet never confirms the deletion, so we stop waiting for it after a while.
pub fn is_pod_stuck_terminating(pod: &Pod, now: DateTime<Utc>, stuck_after: Duration) -> bool {
    let Some(deletion_timestamp) = pod.metadata.deletion_timestamp.as_ref() else {
        return false;
    };

    match (now - deletion_timestamp.0).to_std() {
        Ok(elapsed) => elapsed > stuck_after,
        Err(_) => false, // deletion timestamp is in the future
    }
}
