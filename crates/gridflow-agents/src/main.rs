// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of GridFlow.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use gridflow_adapters::{CachedTagClient, SimulatedPlc, TagValue};
use gridflow_agents::config::SystemConfig;
use gridflow_agents::{Bus, HomeAgent, UtilityAgent};
use tracing::info;
use tracing_subscriber::FmtSubscriber;

/// GridFlow - transactive control for a simulated DC microgrid
#[derive(Debug, Parser)]
#[command(name = "gridflow", version)]
struct Cli {
    /// Path to the system configuration file
    #[arg(short, long, default_value = "gridflow.toml")]
    config: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing with env filter support
    // Respects RUST_LOG environment variable
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = SystemConfig::load(&cli.config)?;

    info!("🚀 Starting GridFlow");
    info!("📋 Configuration summary:");
    info!("   Utility: {}", config.utility.name);
    info!("   Utility resources: {}", config.utility.resources.len());
    info!("   Homes: {}", config.homes.len());
    for home in &config.homes {
        info!(
            "     - {} at {} ({} resources, {} appliances, refload {} W)",
            home.name,
            home.location,
            home.resources.len(),
            home.appliances.len(),
            home.refload
        );
    }
    info!(
        "   Planning period: {} s, window length {}",
        config.utility.settings.st_plan_interval,
        config.homes.first().map_or(0, |h| h.windowlength)
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config))
}

async fn run(config: SystemConfig) -> Result<()> {
    let bus = Bus::new();
    let plc = Arc::new(seed_simulated_plc(&config));

    let (utility, utility_events) = UtilityAgent::new(
        config.utility,
        bus.clone(),
        Arc::new(CachedTagClient::new(plc.clone(), Duration::from_millis(250))),
    );
    tokio::spawn(utility.run(utility_events));

    for home_config in config.homes {
        let (home, home_events) = HomeAgent::new(
            home_config,
            bus.clone(),
            Arc::new(CachedTagClient::new(plc.clone(), Duration::from_millis(250))),
        )?;
        tokio::spawn(home.run(home_events));
    }

    info!("All agents running; Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}

/// Seed the in-memory PLC with nominal values for every tag the grid
/// model and the configured agents will touch.
fn seed_simulated_plc(config: &SystemConfig) -> SimulatedPlc {
    let plc = SimulatedPlc::new();

    let grid = gridflow_agents::utility::default_grid();
    for relay in &grid.relays {
        // relay tags are inverted: false means conducting
        plc.set(relay.tag.clone(), TagValue::Bool(false));
    }
    for edge in &grid.edges {
        if let Some(tag) = &edge.current_tag {
            plc.set(tag.clone(), TagValue::Float(0.0));
        }
    }
    for node in &grid.nodes {
        if let Some(tag) = &node.voltage_tag {
            plc.set(tag.clone(), TagValue::Float(12.1));
        }
    }

    for home in &config.homes {
        if let Ok(location) = gridflow_types::config::Location::parse(&home.location) {
            if let (Ok(branch), Ok(bus), Ok(load)) = (
                location.branch_number(),
                location.bus_number(),
                location.load_number(),
            ) {
                plc.set(
                    format!("BRANCH_{branch}_BUS_{bus}_LOAD_{load}_User"),
                    TagValue::Bool(false),
                );
                plc.set(
                    format!("BRANCH_{branch}_BUS_{bus}_LOAD_{load}_Current"),
                    TagValue::Float(0.0),
                );
            }
        }
    }

    for resource in config
        .utility
        .resources
        .iter()
        .chain(config.homes.iter().flat_map(|h| h.resources.iter()))
    {
        for suffix in ["REG_VOLTAGE", "REG_CURRENT", "UNREG_VOLTAGE", "UNREG_CURRENT"] {
            let value = if suffix.ends_with("VOLTAGE") { 12.2 } else { 0.0 };
            plc.set(
                format!("SOURCE_{}_{suffix}", resource.discharge_channel),
                TagValue::Float(value),
            );
        }
    }

    plc
}
