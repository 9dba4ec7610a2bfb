use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use color_eyre::config::Frame;
use eyre::Result;
use kube::runtime::events::{Recorder, Reporter};
use tokio::select;
use tracing::{Level, debug, error, info};
use tracing_error::ErrorLayer;
use tracing_subscriber::filter::FromEnvError;
use tracing_subscriber::fmt::Layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, filter::Directive};

use node_graceful_drain::{
    ApiResolver, CONTROLLER_NAME, ClusterApi, Config, KubeClusterApi, Shutdown, start_controllers,
};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let config = Config::parse();

    init_tracing_subscriber()?;
    install_color_eyre()?;

    print_build_info();

    let shutdown = Shutdown::new();
    if let Err(err) = try_main(config, &shutdown).await {
        error!(?err, "Failed to start controllers");
        shutdown.trigger_shutdown();
    }

    shutdown.wait_shutdown_triggered().await;

    select! {
        _ = shutdown.wait_shutdown_complete() => {},
        _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {
            info!("Waiting for graceful shutdown");
            shutdown.wait_shutdown_complete().await;
        }
    }

    info!("Bye!");
    Ok(ExitCode::from(1))
}

async fn try_main(config: Config, shutdown: &Shutdown) -> Result<()> {
    let api_resolver = ApiResolver::try_new(kube::Config::infer().await?)?;
    let recorder = Recorder::new(
        api_resolver.client.clone(),
        Reporter {
            controller: String::from(CONTROLLER_NAME),
            instance: std::env::var("POD_NAME").ok(),
        },
    );
    let cluster: Arc<dyn ClusterApi> =
        Arc::new(KubeClusterApi::new(api_resolver.clone(), recorder));

    info!(?config, "Starting");

    start_controllers(&api_resolver, cluster, &config, shutdown)?;

    info!("Controllers started");
    Ok(())
}

fn selfish_frame_filter(frames: &mut Vec<&Frame>) {
    frames.retain(|frame| {
        matches!(frame.name.as_ref(),
            Some(name) if name == "node_graceful_drain"
            || name.starts_with("node_graceful_drain::"))
    });
}

fn init_tracing_subscriber() -> Result<()> {
    tracing_subscriber::registry()
        .with({
            let layer = Layer::default();
            let filter = env_filter()?;
            layer.with_filter(filter)
        })
        .with({
            let layer = ErrorLayer::default();
            let filter = env_filter()?;
            layer.with_filter(filter)
        })
        .try_init()?;

    return Ok(());

    fn env_filter() -> Result<EnvFilter, FromEnvError> {
        EnvFilter::builder()
            .with_default_directive(Directive::from(Level::INFO))
            .from_env()
    }
}

fn install_color_eyre() -> Result<()> {
    color_eyre::config::HookBuilder::new()
        .capture_span_trace_by_default(true)
        .add_frame_filter(Box::new(selfish_frame_filter))
        .install()?;
    Ok(())
}

fn print_build_info() {
    info!("tag: {}", env!("VERGEN_GIT_DESCRIBE"));
    debug!("branch: {}", env!("VERGEN_GIT_BRANCH"));
    debug!("commit: {}", env!("VERGEN_GIT_SHA"));
    debug!("commit date: {}", env!("VERGEN_GIT_COMMIT_DATE"));

    debug!("rustc: {}", env!("VERGEN_RUSTC_SEMVER"));
    debug!("build date: {}", env!("VERGEN_BUILD_TIMESTAMP"));
}
