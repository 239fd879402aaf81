mod cli;
mod workload;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use quiver_core::{load_dotenv, QuiverConfig};
use quiver_scheduler::Quiver;

use crate::cli::BenchArgs;

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = BenchArgs::parse();
    let config = args.config(QuiverConfig::from_env());
    config.log_summary();

    let quiver = Quiver::new(config).context("invalid scheduler configuration")?;
    info!(tasks = args.tasks, task_ms = args.task_ms, "starting bench");

    let report = workload::run(&quiver, &args).await?;
    quiver.stop();

    let json = if args.pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{json}");
    Ok(())
}
