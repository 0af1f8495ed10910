//! Default command: starts the driver core and blocks until shutdown.

use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::config::Configuration;
use crate::driver::{Driver, FingerprintHealth};

const FINGERPRINT_PERIOD: Duration = Duration::from_secs(15);

pub async fn run(config_path: &str) -> Result<()> {
    info!("loading configuration from: {}", config_path);
    let config = Configuration::load(config_path)?;

    let driver = Driver::connect(&config)?;
    info!(endpoint = %config.endpoint, "connected to engine");

    let mut fingerprint = driver.spawn_fingerprint(FINGERPRINT_PERIOD);
    driver.spawn_reconciler();

    tokio::spawn(async move {
        while let Some(health) = fingerprint.recv().await {
            match health {
                FingerprintHealth::Healthy => {}
                FingerprintHealth::Unhealthy => warn!("engine fingerprint lost, was previously healthy"),
                FingerprintHealth::Undetected => warn!("engine undetected"),
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("failed to install ctrl-c handler: {}", e))?;

    info!("shutdown signal received, stopping driver");
    driver.shutdown();

    Ok(())
}
