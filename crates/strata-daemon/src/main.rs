//! stratad - deduplicating snapshot store daemon.
//!
//! Environment:
//!   ROOT         data root (overrides the config document)
//!   CONFIG       configuration file path
//!   ADDRESS      RPC socket path, served by the embedding transport
//!   API_ADDRESS  admin HTTP bind, served by the external surface

use anyhow::{Context, Result};
use std::path::PathBuf;
use strata_config::logging::{init_logging, LogLevel};
use strata_config::Config;
use strata_daemon::Daemon;
use tracing::info;

const DEFAULT_ROOT: &str = "/var/lib/strata";

fn resolve_config() -> Result<(Config, Option<PathBuf>)> {
    if let Ok(path) = std::env::var("CONFIG") {
        let path = PathBuf::from(path);
        let config = Config::load(&path)
            .with_context(|| format!("loading config from {}", path.display()))?;
        return Ok((config, Some(path)));
    }

    let root = std::env::var("ROOT").unwrap_or_else(|_| DEFAULT_ROOT.to_string());
    let mut config = Config::with_root(root);
    config.validate().context("validating default config")?;
    Ok((config, None))
}

#[tokio::main]
async fn main() -> Result<()> {
    let (config, config_path) = resolve_config()?;
    init_logging(LogLevel::parse(&config.log_level));

    if let Ok(address) = std::env::var("ADDRESS") {
        info!(address, "snapshot RPC served by the embedding transport");
    }
    if let Ok(api_address) = std::env::var("API_ADDRESS") {
        info!(api_address, "admin API served by the external surface");
    }

    let daemon = Daemon::new(config)?;
    daemon.spawn_background(config_path)?;
    info!("stratad running");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    daemon.shutdown().await;
    Ok(())
}
