use std::future::Future;
use std::time::Duration;

use eyre::{Context, Result};
use tokio::task::{JoinError, JoinHandle};
use tokio::{select, spawn};
use tracing::{Instrument, Span, debug, error, warn};

use crate::shutdown::Shutdown;

const SLOW_SHUTDOWN_WARNING: Duration = Duration::from_secs(3);

#[derive(Debug)]
pub enum ServiceExit {
    GracefulShutdown,
    EarlyStop,
    Panic(JoinError),
}

/// Run a long-living background loop.
///
/// A service is expected to return only after shutdown is triggered. Returning early or panicking
/// triggers the shutdown of the whole process, since a controller without its eviction workers
/// (or vice versa) can't make progress.
pub fn spawn_service(
    shutdown: &Shutdown,
    span: Span,
    future: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<ServiceExit>> {
    let service_name = span
        .metadata()
        .map(|metadata| metadata.name())
        .unwrap_or("service")
        .to_owned();

    let supervised = {
        let shutdown = shutdown.clone();
        async move {
            let mut task = spawn(future.instrument(Span::current()));
            let exit = select! {
                result = &mut task => to_service_exit(&shutdown, result),
                _ = slow_shutdown(&shutdown) => {
                    warn!("Service shutdown is taking some time");
                    to_service_exit(&shutdown, task.await)
                }
            };

            match &exit {
                ServiceExit::GracefulShutdown => debug!("Service gracefully shutdown"),
                ServiceExit::EarlyStop => error!("Service stopped early"),
                ServiceExit::Panic(err) => error!(%err, "Service panicked"),
            }

            exit
        }
    };

    let delayed = shutdown
        .wrap_delay_shutdown(supervised.instrument(span))
        .context(service_name)?;

    Ok(spawn(delayed))
}

fn to_service_exit(shutdown: &Shutdown, result: Result<(), JoinError>) -> ServiceExit {
    match result {
        Ok(()) if shutdown.is_shutdown_triggered() => ServiceExit::GracefulShutdown,
        Ok(()) => {
            shutdown.trigger_shutdown();
            ServiceExit::EarlyStop
        }
        Err(err) => {
            shutdown.trigger_shutdown();
            ServiceExit::Panic(err)
        }
    }
}

async fn slow_shutdown(shutdown: &Shutdown) {
    shutdown.wait_shutdown_triggered().await;
    tokio::time::sleep(SLOW_SHUTDOWN_WARNING).await;
}
