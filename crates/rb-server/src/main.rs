//! rulebot daemon
//!
//! Loads the rule file, starts the engine task against the attached
//! devices, optionally bridges commands from MQTT, and runs until Ctrl-C.

mod mqtt;
mod settings;

use anyhow::{Context, Result};
use clap::Parser;
use rb_config::RuleLoader;
use rb_devices::SimulatedDevices;
use rb_engine::{EngineRuntime, RuleEngine};
use settings::{Cli, Settings};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn init_tracing(filter: Option<&str>) -> Result<()> {
    let filter = match filter {
        Some(filter) => EnvFilter::try_new(filter).context("Invalid log filter")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::from_cli(&cli)?;
    init_tracing(settings.log.as_deref())?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        rules = %settings.rules.display(),
        "Starting rulebot"
    );

    // No hardware drivers are bundled; the simulated devices log every write
    let devices = SimulatedDevices::new();
    let loader = RuleLoader::new(&settings.rules).with_options(settings.load_options());
    let engine = RuleEngine::from_loader(loader, devices.collaborators())
        .with_context(|| format!("Failed to load rules from {}", settings.rules.display()))?;
    let handle = EngineRuntime::new(engine, settings.runtime_config()).start()?;

    // Inbound device adapters attach to a clone of the handle: an input
    // interrupt callback calls `notify_state("mcp23017", bit, level)`, a peer
    // link forwards each received line to `peer_message`. MQTT is the only
    // inbound transport bundled.

    let bridge = settings
        .mqtt
        .clone()
        .map(|mqtt| mqtt::spawn(mqtt, handle.clone()));

    info!("rulebot is running");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    if let Some(bridge) = bridge {
        bridge.abort();
    }
    handle.stop().await;

    Ok(())
}
