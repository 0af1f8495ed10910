//! Container task driver - launches, supervises, and garbage-collects
//! workloads on a local container engine on behalf of a cluster workload
//! orchestrator.

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use container_task_driver::cmd;

#[derive(Parser)]
#[command(name = "container-task-driver")]
#[command(about = "Container task driver core")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<cmd::Commands>,

    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("container_task_driver={}", log_level).into()),
        )
        .init();

    info!("starting container task driver v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Some(cmd::Commands::Diagnostics) => {
            let config = container_task_driver::Configuration::load(&cli.config)
                .unwrap_or_else(|_| toml::from_str("").expect("empty config always parses"));
            cmd::diagnostics::run(&config.endpoint).await?;
        }
        None => {
            if let Err(e) = cmd::root::run(&cli.config).await {
                error!(error = %e, "driver exited with error");
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
