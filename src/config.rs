use std::time::Duration;

use clap::{Args, Parser};
use eyre::{Result, eyre};
use humantime::parse_duration;

#[derive(Clone, Debug, Parser)]
#[command(version, about)]
pub struct Config {
    /// Used when the node doesn't carry its own deletionGracePeriodSeconds.
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    pub termination_grace_period: Duration,

    #[arg(long, default_value = "10s", value_parser = parse_nonzero_duration)]
    pub drain_requeue_interval: Duration,

    #[arg(long, default_value = "1m", value_parser = parse_duration)]
    pub stuck_terminating_after: Duration,

    #[command(flatten)]
    pub eviction: EvictionQueueConfig,
}

#[derive(Clone, Debug, Args)]
pub struct EvictionQueueConfig {
    #[arg(long = "eviction-workers", default_value = "8", value_parser = parse_workers)]
    pub workers: usize,

    #[arg(long = "eviction-initial-backoff", default_value = "100ms", value_parser = parse_nonzero_duration)]
    pub initial_backoff: Duration,

    #[arg(long = "eviction-max-backoff", default_value = "10s", value_parser = parse_nonzero_duration)]
    pub max_backoff: Duration,

    /// Attempts per pod that may fail for an unexpected reason before the eviction is dropped.
    /// Disruption budget rejections and throttling are not counted.
    #[arg(long = "eviction-max-attempts", default_value = "5", value_parser = parse_max_attempts)]
    pub max_attempts: u32,
}

fn parse_nonzero_duration(input: &str) -> Result<Duration> {
    let duration = parse_duration(input)?;
    if duration.is_zero() {
        return Err(eyre!("duration should be > 0"));
    }

    Ok(duration)
}

fn parse_workers(input: &str) -> Result<usize> {
    let workers: usize = input.parse()?;
    if workers == 0 {
        return Err(eyre!("eviction-workers should be >= 1"));
    }

    Ok(workers)
}

fn parse_max_attempts(input: &str) -> Result<u32> {
    let attempts: u32 = input.parse()?;
    if attempts == 0 {
        return Err(eyre!("eviction-max-attempts should be >= 1"));
    }

    Ok(attempts)
}
