use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use eyre::Result;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ObjectReference, Pod};
use kube::runtime::events::EventType;
use kube::runtime::reflector::ObjectRef;
use tokio::select;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio_util::time::DelayQueue;
use tracing::{Level, debug, error, info, span, trace, warn};

use crate::cluster::ClusterApi;
use crate::config::EvictionQueueConfig;
use crate::error_codes::{
    is_409_conflict_error, is_429_too_many_requests_error, is_gone_error, is_transient_error,
};
use crate::instrumented;
use crate::shutdown::Shutdown;
use crate::spawn_service::spawn_service;

/// Deduplicating, retrying queue of pod evictions.
///
/// A pod is tracked from [`EvictionQueue::add`] until its eviction is accepted, it turns out to be
/// gone already, or it failed too many times for an unexpected reason. While tracked, a pod is in
/// exactly one place: the ready channel, the delay queue, or the hands of a single worker.
/// Only `add` and the worker holding the pod schedule it, so no two workers see it at once.
#[derive(Clone)]
pub struct EvictionQueue {
    inner: Arc<EvictionQueueInner>,
}

struct EvictionQueueInner {
    tracked: Mutex<HashMap<ObjectRef<Pod>, RetryState>>,
    schedule: UnboundedSender<Schedule>,
    config: EvictionQueueConfig,
}

struct RetryState {
    backoff: ExponentialBackoff,
    unexpected_failures: u32,
}

impl RetryState {
    fn new(config: &EvictionQueueConfig) -> Self {
        Self {
            backoff: ExponentialBackoff {
                current_interval: config.initial_backoff,
                initial_interval: config.initial_backoff,
                max_interval: config.max_backoff,
                // PodDisruptionBudget can hold a pod for as long as it wants.
                max_elapsed_time: None,
                ..ExponentialBackoff::default()
            },
            unexpected_failures: 0,
        }
    }
}

enum Schedule {
    Now(ObjectRef<Pod>),
    After(ObjectRef<Pod>, Duration),
}

enum Retry {
    After(Duration),
    GiveUp { attempts: u32 },
    Untracked,
}

pub fn start_eviction_queue(
    cluster: Arc<dyn ClusterApi>,
    config: &EvictionQueueConfig,
    shutdown: &Shutdown,
) -> Result<EvictionQueue> {
    let (schedule_tx, schedule_rx) = unbounded_channel();
    let (ready_tx, ready_rx) = unbounded_channel();

    let queue = EvictionQueue {
        inner: Arc::new(EvictionQueueInner {
            tracked: Mutex::new(HashMap::new()),
            schedule: schedule_tx,
            config: config.clone(),
        }),
    };

    spawn_service(
        shutdown,
        span!(Level::INFO, "eviction:scheduler"),
        run_scheduler(schedule_rx, ready_tx, shutdown.clone()),
    )?;

    let ready_rx = Arc::new(tokio::sync::Mutex::new(ready_rx));
    for id in 0..config.workers {
        spawn_service(
            shutdown,
            span!(Level::INFO, "eviction:worker", id),
            run_worker(
                queue.clone(),
                Arc::clone(&cluster),
                Arc::clone(&ready_rx),
                shutdown.clone(),
            ),
        )?;
    }

    Ok(queue)
}

impl EvictionQueue {
    /// Returns `false` if the pod is already pending or in flight.
    ///
    /// Pods are keyed by namespace and name. A UID in `pod.extra` is kept with the entry and
    /// evictions are made conditional on it.
    pub fn add(&self, pod: ObjectRef<Pod>) -> bool {
        let mut tracked = self.inner.tracked.lock().unwrap();
        match tracked.entry(pod) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                let pod = entry.key().clone();
                entry.insert(RetryState::new(&self.inner.config));
                trace!(%pod, "enqueued");
                _ = self.inner.schedule.send(Schedule::Now(pod));
                true
            }
        }
    }

    pub fn contains(&self, pod: &ObjectRef<Pod>) -> bool {
        self.inner.tracked.lock().unwrap().contains_key(pod)
    }

    async fn evict(&self, cluster: &dyn ClusterApi, pod: ObjectRef<Pod>) {
        let err = match cluster.evict_pod(&pod).await {
            Ok(()) => {
                info!("pod is evicted");
                self.forget(&pod);
                return;
            }
            Err(err) if is_gone_error(&err) => {
                debug!("pod is gone anyway"); // This is what we desired.
                self.forget(&pod);
                return;
            }
            Err(err) if is_409_conflict_error(&err) => {
                // UID precondition failed. The pod we were asked for is gone.
                debug!(%err, "pod is replaced by another with the same name");
                self.forget(&pod);
                return;
            }
            Err(err) => err,
        };

        // Both PodDisruptionBudget and the apiserver's throttling answer 429.
        let expected = is_429_too_many_requests_error(&err) || is_transient_error(&err);
        match self.next_retry(&pod, !expected) {
            Retry::After(delay) if expected => {
                debug!(%err, ?delay, "eviction is rejected for now");
                self.schedule(Schedule::After(pod, delay));
            }
            Retry::After(delay) => {
                warn!(%err, ?delay, "eviction failed");
                self.schedule(Schedule::After(pod, delay));
            }
            Retry::GiveUp { attempts } => {
                error!(%err, attempts, "giving up eviction");
                cluster
                    .publish_event(
                        &ObjectReference::from(pod),
                        EventType::Warning,
                        "Evict",
                        "EvictionFailed",
                        format!("Giving up eviction after {attempts} attempts: {err}"),
                    )
                    .await;
            }
            Retry::Untracked => {}
        }
    }

    fn next_retry(&self, pod: &ObjectRef<Pod>, unexpected: bool) -> Retry {
        let mut tracked = self.inner.tracked.lock().unwrap();
        let Some(state) = tracked.get_mut(pod) else {
            return Retry::Untracked;
        };

        if unexpected {
            state.unexpected_failures += 1;
            let attempts = state.unexpected_failures;
            if attempts >= self.inner.config.max_attempts {
                tracked.remove(pod);
                return Retry::GiveUp { attempts };
            }
        }

        let max_backoff = self.inner.config.max_backoff;
        let delay = state
            .backoff
            .next_backoff()
            .map_or(max_backoff, |delay| delay.min(max_backoff));
        Retry::After(delay)
    }

    fn forget(&self, pod: &ObjectRef<Pod>) {
        self.inner.tracked.lock().unwrap().remove(pod);
    }

    fn schedule(&self, schedule: Schedule) {
        _ = self.inner.schedule.send(schedule);
    }
}

async fn run_scheduler(
    mut schedule: UnboundedReceiver<Schedule>,
    ready: UnboundedSender<ObjectRef<Pod>>,
    shutdown: Shutdown,
) {
    let mut delayed: DelayQueue<ObjectRef<Pod>> = DelayQueue::new();
    loop {
        select! {
            _ = shutdown.wait_shutdown_triggered() => break,
            scheduled = schedule.recv() => match scheduled {
                Some(Schedule::Now(pod)) => {
                    _ = ready.send(pod);
                }
                Some(Schedule::After(pod, delay)) => {
                    trace!(%pod, ?delay, "retry scheduled");
                    delayed.insert(pod, delay);
                }
                None => break,
            },
            Some(expired) = delayed.next(), if !delayed.is_empty() => {
                _ = ready.send(expired.into_inner());
            }
        }
    }
}

async fn run_worker(
    queue: EvictionQueue,
    cluster: Arc<dyn ClusterApi>,
    ready: Arc<tokio::sync::Mutex<UnboundedReceiver<ObjectRef<Pod>>>>,
    shutdown: Shutdown,
) {
    loop {
        let next = select! {
            _ = shutdown.wait_shutdown_triggered() => break,
            next = async { ready.lock().await.recv().await } => next,
        };
        let Some(pod) = next else {
            break;
        };

        instrumented!(
            span!(Level::INFO, "evict", %pod),
            queue.evict(cluster.as_ref(), pod)
        )
        .await;
    }
}
