mod api_resolver;
mod clock;
mod cluster;
mod config;
mod controllers;
mod error_codes;
mod eviction_queue;
mod labels_and_annotations;
mod pod_state;
mod report;
mod shutdown;
mod spawn_service;
mod terminator;
mod utils;

pub use crate::api_resolver::ApiResolver;
pub use crate::clock::Clock;
pub use crate::cluster::{ClusterApi, KubeClusterApi};
pub use crate::config::{Config, EvictionQueueConfig};
pub use crate::controllers::start_controllers;
pub use crate::controllers::termination::{
    TerminationError, TerminationReconciler, TerminationState,
};
pub use crate::eviction_queue::{EvictionQueue, start_eviction_queue};
pub use crate::labels_and_annotations::{
    CONTROLLER_NAME, DO_NOT_EVICT_ANNOTATION_KEY, TERMINATION_FINALIZER,
};
pub use crate::shutdown::Shutdown;
pub use crate::terminator::Terminator;


#[cfg(test)]
#[macro_use]
extern crate assert_matches;
