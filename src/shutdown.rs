use std::future::Future;

use async_shutdown::{
    ShutdownAlreadyCompleted, ShutdownComplete, ShutdownManager, ShutdownSignal, WrapDelayShutdown,
};
use tokio::signal;
use tracing::info;

/// Shutdown shared by every background service.
///
/// Services hold the shutdown open until they return, so [`Shutdown::wait_shutdown_complete`]
/// resolves only after in-flight evictions and reconciles have settled.
#[derive(Clone)]
pub struct Shutdown {
    manager: ShutdownManager<()>,
}

impl Shutdown {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Shutdown {
        Self::new_with_signal(shutdown_signal())
    }

    pub fn new_with_signal<F>(signal: F) -> Shutdown
    where
        F: Future + Send + Sync + 'static,
    {
        let manager = ShutdownManager::new();

        tokio::spawn({
            let manager = manager.clone();
            async move {
                tokio::select! {
                    _ = signal => {
                        info!("Shutdown start");
                        _ = manager.trigger_shutdown(());
                    }
                    _ = manager.wait_shutdown_triggered() => {}
                }
            }
        });

        Shutdown { manager }
    }

    pub fn wrap_delay_shutdown<F: Future>(
        &self,
        future: F,
    ) -> Result<WrapDelayShutdown<(), F>, ShutdownAlreadyCompleted<()>> {
        self.manager.wrap_delay_shutdown(future)
    }

    pub fn trigger_shutdown(&self) {
        _ = self.manager.trigger_shutdown(());
    }

    pub fn is_shutdown_triggered(&self) -> bool {
        self.manager.is_shutdown_triggered()
    }

    pub fn wait_shutdown_triggered(&self) -> ShutdownSignal<()> {
        self.manager.wait_shutdown_triggered()
    }

    pub fn wait_shutdown_complete(&self) -> ShutdownComplete<()> {
        self.manager.wait_shutdown_complete()
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler")
    };

    #[cfg(not(unix))]
    ctrl_c.await;

    #[cfg(unix)]
    {
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        };
    }
}
