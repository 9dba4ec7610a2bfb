use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{Controller, controller, watcher};
use kube::{Api, Resource, ResourceExt};
use thiserror::Error;
use tracing::{Level, debug, info, span, trace, warn};

use crate::api_resolver::ApiResolver;
use crate::clock::Clock;
use crate::cluster::ClusterApi;
use crate::config::Config;
use crate::controllers::utils::{log_reconcile_kube_err_common, log_reconcile_result_common};
use crate::error_codes::{is_409_conflict_error, is_gone_error, is_transient_error};
use crate::eviction_queue::EvictionQueue;
use crate::instrumented;
use crate::labels_and_annotations::{
    has_termination_finalizer, is_deletion_requested, is_node_unschedulable,
};
use crate::shutdown::Shutdown;
use crate::spawn_service::spawn_service;
use crate::terminator::Terminator;

const CONFLICT_RECONCILE: Duration = Duration::from_secs(1);
const DEFAULT_ERROR_RECONCILE: Duration = Duration::from_secs(10);
const DEFAULT_TRANSIENT_ERROR_RECONCILE: Duration = Duration::from_secs(5);

/// Where a node stands in its termination.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TerminationState {
    /// Deletion isn't requested.
    Active,
    /// Deletion is requested, but our finalizer is not there (anymore).
    Finalized,
    Cordoning,
    Draining,
    /// Every evictable pod has left, and the finalizer is removed.
    Drained,
    /// The grace period has passed, and the finalizer is removed regardless of the pods.
    ForceDrained,
}

impl TerminationState {
    /// The state as stored in the node object.
    pub fn of(node: &Node) -> Self {
        if !is_deletion_requested(node) {
            TerminationState::Active
        } else if !has_termination_finalizer(node) {
            TerminationState::Finalized
        } else if !is_node_unschedulable(node) {
            TerminationState::Cordoning
        } else {
            TerminationState::Draining
        }
    }
}

#[derive(Error, Debug)]
pub enum TerminationError {
    #[error("failed to get node: {0}")]
    GetNode(#[source] kube::Error),
    #[error("failed to cordon node: {0}")]
    Cordon(#[source] kube::Error),
    #[error("failed to drain node: {0}")]
    Drain(#[source] kube::Error),
    #[error("failed to remove finalizer: {0}")]
    RemoveFinalizer(#[source] kube::Error),
}

impl TerminationError {
    pub fn kube_error(&self) -> &kube::Error {
        match self {
            TerminationError::GetNode(err)
            | TerminationError::Cordon(err)
            | TerminationError::Drain(err)
            | TerminationError::RemoveFinalizer(err) => err,
        }
    }
}

/// Drives a node from deletion request to the removal of its termination finalizer.
///
/// Calls for the same node must not overlap. The dispatcher guarantees that.
pub struct TerminationReconciler {
    cluster: Arc<dyn ClusterApi>,
    terminator: Terminator,
    clock: Clock,
    termination_grace_period: Duration,
    drain_requeue_interval: Duration,
}

impl TerminationReconciler {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        eviction_queue: EvictionQueue,
        clock: Clock,
        config: &Config,
    ) -> Self {
        let terminator = Terminator::new(
            Arc::clone(&cluster),
            eviction_queue,
            clock.clone(),
            config.stuck_terminating_after,
        );

        Self {
            cluster,
            terminator,
            clock,
            termination_grace_period: config.termination_grace_period,
            drain_requeue_interval: config.drain_requeue_interval,
        }
    }

    /// Starts from the controller's cached copy. The live node is read only when it is terminating.
    pub async fn reconcile_observed(
        &self,
        observed: &Node,
    ) -> Result<(TerminationState, Action), TerminationError> {
        let state = TerminationState::of(observed);
        if matches!(state, TerminationState::Active | TerminationState::Finalized) {
            trace!(?state, "not terminating");
            return Ok((state, Action::await_change()));
        }

        self.reconcile(&observed.name_any()).await
    }

    pub async fn reconcile(
        &self,
        node_name: &str,
    ) -> Result<(TerminationState, Action), TerminationError> {
        let node = match self.cluster.get_node(node_name).await {
            Ok(Some(node)) => node,
            Ok(None) => {
                debug!("node is gone anyway");
                return Ok((TerminationState::Finalized, Action::await_change()));
            }
            Err(err) => return Err(TerminationError::GetNode(err)),
        };

        let state = TerminationState::of(&node);
        if matches!(state, TerminationState::Active | TerminationState::Finalized) {
            return Ok((state, Action::await_change()));
        }

        debug!(?state, "terminating");
        let cordoned = self
            .terminator
            .cordon(node)
            .await
            .map_err(TerminationError::Cordon)?;
        let Some(node) = cordoned else {
            debug!("node is gone anyway");
            return Ok((TerminationState::Finalized, Action::await_change()));
        };
        let drained = self
            .terminator
            .drain(&node)
            .await
            .map_err(TerminationError::Drain)?;

        let grace_period = self.grace_period_of(&node);
        let elapsed = self.elapsed_since_deletion_request(&node);
        if elapsed > grace_period {
            self.remove_finalizer(&node).await?;
            warn!(?elapsed, ?grace_period, drained, "grace period exceeded, node is released");
            self.cluster
                .publish_event(
                    &node.object_ref(&()),
                    EventType::Warning,
                    "Terminate",
                    "GracePeriodExceeded",
                    format!(
                        "Released without confirming the drain after {}",
                        humantime::format_duration(grace_period)
                    ),
                )
                .await;
            return Ok((TerminationState::ForceDrained, Action::await_change()));
        }

        if drained {
            self.remove_finalizer(&node).await?;
            info!("node is drained");
            self.cluster
                .publish_event(
                    &node.object_ref(&()),
                    EventType::Normal,
                    "Terminate",
                    "Drained",
                    String::from("Every evictable pod has left the node"),
                )
                .await;
            return Ok((TerminationState::Drained, Action::await_change()));
        }

        // Pod events wake us up earlier. This is for the grace period, and the pods that never go.
        let requeue = self.drain_requeue_interval.min(grace_period - elapsed);
        Ok((TerminationState::Draining, Action::requeue(requeue)))
    }

    fn grace_period_of(&self, node: &Node) -> Duration {
        match node.metadata.deletion_grace_period_seconds {
            Some(seconds) if seconds > 0 => Duration::from_secs(seconds as u64),
            _ => self.termination_grace_period,
        }
    }

    fn elapsed_since_deletion_request(&self, node: &Node) -> Duration {
        let Some(deletion_timestamp) = node.metadata.deletion_timestamp.as_ref() else {
            return Duration::ZERO;
        };

        (self.clock.now() - deletion_timestamp.0)
            .to_std()
            .unwrap_or_default()
    }

    async fn remove_finalizer(&self, node: &Node) -> Result<(), TerminationError> {
        match self.cluster.remove_termination_finalizer(node).await {
            Ok(()) => Ok(()),
            Err(err) if is_gone_error(&err) => {
                debug!("node is gone anyway");
                Ok(())
            }
            Err(err) => Err(TerminationError::RemoveFinalizer(err)),
        }
    }
}

pub fn start_termination_controller(
    api_resolver: &ApiResolver,
    cluster: Arc<dyn ClusterApi>,
    eviction_queue: &EvictionQueue,
    config: &Config,
    shutdown: &Shutdown,
) -> Result<()> {
    let reconciler = Arc::new(TerminationReconciler::new(
        cluster,
        eviction_queue.clone(),
        Clock::system(),
        config,
    ));

    let nodes: Api<Node> = api_resolver.cluster();
    let pods: Api<Pod> = api_resolver.all();
    let controller = Controller::new(nodes, watcher::Config::default())
        .watches(pods, watcher::Config::default(), |pod: Pod| {
            let node_name = pod.spec.as_ref()?.node_name.as_ref()?;
            Some(ObjectRef::<Node>::new(node_name))
        })
        .graceful_shutdown_on(shutdown.wait_shutdown_triggered());

    spawn_service(
        shutdown,
        span!(Level::INFO, "controller:termination"),
        async move {
            controller
                .run(reconcile, error_policy, reconciler)
                .for_each(|result| async move {
                    log_reconcile_result(result);
                })
                .await
        },
    )?;

    Ok(())
}

async fn reconcile(
    node: Arc<Node>,
    reconciler: Arc<TerminationReconciler>,
) -> Result<Action, TerminationError> {
    instrumented!(span!(Level::ERROR, "reconciler", node = %node.name_any()), async move {
        let (_state, action) = reconciler.reconcile_observed(&node).await?;
        Ok(action)
    })
    .await
}

fn error_policy(
    _node: Arc<Node>,
    err: &TerminationError,
    _reconciler: Arc<TerminationReconciler>,
) -> Action {
    let err = err.kube_error();
    if is_409_conflict_error(err) {
        return Action::requeue(CONFLICT_RECONCILE);
    }

    if is_transient_error(err) {
        return Action::requeue(DEFAULT_TRANSIENT_ERROR_RECONCILE);
    }

    Action::requeue(DEFAULT_ERROR_RECONCILE)
}

fn log_reconcile_result(
    result: Result<(ObjectRef<Node>, Action), controller::Error<TerminationError, watcher::Error>>,
) {
    let span = span!(Level::INFO, "log");
    let _entered = span.enter();

    log_reconcile_result_common(result, |reconciler_err, object_ref| {
        let span = span!(Level::ERROR, "error", %object_ref);
        let _entered = span.enter();

        log_reconcile_kube_err_common(reconciler_err.kube_error());
    });
}
