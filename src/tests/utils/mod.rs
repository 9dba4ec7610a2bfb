pub mod fake_cluster;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use k8s_openapi::api::core::v1::{Node, Pod};
use tokio::time::Instant;

use crate::cluster::ClusterApi;
use crate::tests::utils::fake_cluster::FakeCluster;
use crate::{
    Clock, Config, EvictionQueue, EvictionQueueConfig, Shutdown, TerminationReconciler,
    start_eviction_queue,
};

macro_rules! from_json {
    ($($json:tt)+) => {
        ::serde_json::from_value(::serde_json::json!($($json)+)).expect("Invalid json")
    };
}

pub(crate) use from_json;

pub const TEST_NAMESPACE: &str = "default";
pub const TEST_NODE: &str = "test-node";
const EVENTUALLY_TIMEOUT: Duration = Duration::from_secs(5);

pub fn test_config() -> Config {
    Config {
        termination_grace_period: Duration::from_secs(30),
        drain_requeue_interval: Duration::from_secs(10),
        stuck_terminating_after: Duration::from_secs(60),
        eviction: EvictionQueueConfig {
            workers: 2,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            max_attempts: 3,
        },
    }
}

/// Eviction workers running against a [`FakeCluster`], torn down on drop.
pub struct TestContext {
    pub cluster: Arc<FakeCluster>,
    pub eviction_queue: EvictionQueue,
    pub shutdown: Shutdown,
    pub config: Config,
}

impl TestContext {
    pub fn new(config: Config) -> Self {
        let shutdown = Shutdown::new_with_signal(std::future::pending::<()>());
        let cluster = Arc::new(FakeCluster::default());
        let eviction_queue = start_eviction_queue(
            Arc::clone(&cluster) as Arc<dyn ClusterApi>,
            &config.eviction,
            &shutdown,
        )
        .unwrap();

        Self {
            cluster,
            eviction_queue,
            shutdown,
            config,
        }
    }

    pub fn reconciler(&self, clock: Clock) -> TerminationReconciler {
        TerminationReconciler::new(
            Arc::clone(&self.cluster) as Arc<dyn ClusterApi>,
            self.eviction_queue.clone(),
            clock,
            &self.config,
        )
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        self.shutdown.trigger_shutdown();
    }
}

/// Clock that reads `offset` after the real time.
pub fn shifted_clock(offset: Duration) -> Clock {
    let offset = TimeDelta::from_std(offset).unwrap();
    Clock::from_fn(move || Utc::now() + offset)
}

pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + EVENTUALLY_TIMEOUT;
    while Instant::now() < deadline {
        if condition().await {
            return true;
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    false
}

/// Node whose deletion was requested at `deleted_at`, still held by our finalizer.
pub fn terminating_node(deleted_at: DateTime<Utc>) -> Node {
    from_json!({
        "metadata": {
            "name": TEST_NODE,
            "deletionTimestamp": deleted_at.to_rfc3339(),
            "finalizers": [crate::TERMINATION_FINALIZER],
        },
    })
}

pub fn plain_pod(name: &str) -> Pod {
    from_json!({
        "metadata": {
            "name": name,
            "namespace": TEST_NAMESPACE,
            "labels": {
                "app": "test",
            },
        },
        "spec": {
            "nodeName": TEST_NODE,
            "containers": [{
                "name": "app",
                "image": "public.ecr.aws/docker/library/busybox",
            }],
        },
        "status": {
            "phase": "Running",
        },
    })
}
