use std::fmt::Debug;

use k8s_openapi::api::core::v1::Node;
use kube::api::DynamicObject;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{controller, watcher};
use tracing::{debug, error, trace};

use crate::error_codes::{
    is_409_conflict_error, is_410_expired_error_response, is_gone_error, is_transient_error,
};

pub fn log_reconcile_result_common<E>(
    result: Result<(ObjectRef<Node>, Action), controller::Error<E, watcher::Error>>,
    reconciler_failed_handler: impl Fn(E, ObjectRef<DynamicObject>),
) where
    E: Debug,
{
    match result {
        Ok((object_ref, action)) => {
            trace!(%object_ref, ?action, "apply");
        }
        Err(controller::Error::ReconcilerFailed(reconciler_err, object_ref)) => {
            reconciler_failed_handler(reconciler_err, object_ref);
        }
        Err(controller::Error::QueueError(queue_err)) => {
            match queue_err {
                watcher::Error::WatchFailed(err) => {
                    // restarting
                    trace!(?err, "watch fail on queue");
                }
                watcher::Error::WatchError(resp) if is_410_expired_error_response(&resp) => {
                    // reconciler is late
                    trace!(?resp, "expired on queue");
                }
                _ => error!(?queue_err, "error on queue"),
            }
        }
        Err(controller::Error::ObjectNotFound(object_ref)) => {
            // reconciler is late
            trace!(%object_ref, "not found");
        }
        Err(err) => {
            error!(?err, "error on controller");
        }
    }
}

pub fn log_reconcile_kube_err_common(err: &kube::Error) {
    if is_409_conflict_error(err) {
        debug!(%err, "conflict on reconcile");
    } else if is_gone_error(err) {
        // reconcile function is late
        debug!(%err, "expired on reconcile");
    } else if is_transient_error(err) {
        debug!(%err, "transient error");
    } else {
        error!(%err, "error on reconcile")
    }
}
