pub(crate) mod termination;
mod utils;

use std::sync::Arc;

use eyre::Result;

use crate::controllers::termination::start_termination_controller;
use crate::eviction_queue::{EvictionQueue, start_eviction_queue};
use crate::{ApiResolver, ClusterApi, Config, Shutdown};

/// Start the eviction workers and the controller that terminates nodes with them.
pub fn start_controllers(
    api_resolver: &ApiResolver,
    cluster: Arc<dyn ClusterApi>,
    config: &Config,
    shutdown: &Shutdown,
) -> Result<EvictionQueue> {
    let eviction_queue = start_eviction_queue(Arc::clone(&cluster), &config.eviction, shutdown)?;

    start_termination_controller(api_resolver, cluster, &eviction_queue, config, shutdown)?;

    Ok(eviction_queue)
}
