//! CLI entry point for deck-modules
//!
//! Provides commands for:
//! - Listing the module device namespace
//! - Discovering and connecting attached modules
//! - Flashing new firmware onto a module by serial number
//!
//! # Usage
//!
//! ```bash
//! deck-modules ports
//! deck-modules discover --json
//! deck-modules update --serial TD2018053002 --firmware temp-deck-v1.2.0.hex
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use deck_modules::config::ModulesConfig;
use deck_modules::registry::ModuleRegistry;
use deck_modules::{logging, PortDirectory};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "deck-modules")]
#[command(about = "Discover and flash serial deck modules", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = deck_modules::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Read real hardware regardless of configuration
    #[arg(long, global = true)]
    live: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List entries in the module device directory
    Ports,

    /// Discover and connect all attached modules
    Discover {
        /// Print modules as JSON
        #[arg(long)]
        json: bool,
    },

    /// Flash firmware onto the module with the given serial number
    Update {
        /// Serial number reported by the module
        #[arg(long)]
        serial: String,

        /// Intel HEX image to flash (deleted afterwards)
        #[arg(long)]
        firmware: PathBuf,

        /// avrdude configuration file (defaults to flash_tool.config_file)
        #[arg(long)]
        tool_config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ModulesConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if cli.live {
        config.hardware.live = true;
    }
    logging::init_from_config(&config)?;

    match cli.command {
        Commands::Ports => list_ports(&config).await,
        Commands::Discover { json } => discover(&config, json).await,
        Commands::Update {
            serial,
            firmware,
            tool_config,
        } => {
            let tool_config = tool_config.unwrap_or_else(|| config.flash_tool.config_file.clone());
            update(&config, &serial, firmware, tool_config).await
        }
    }
}

async fn list_ports(config: &ModulesConfig) -> Result<()> {
    let directory = PortDirectory::from_config(&config.hardware);
    if !directory.is_live() {
        println!("Live hardware disabled; nothing to list (use --live)");
        return Ok(());
    }

    let snapshot = directory.enumerate().await?;
    if snapshot.is_empty() {
        println!("No devices in {}", directory.root().display());
    }
    for port in &snapshot {
        println!("{port}");
    }
    Ok(())
}

async fn discover(config: &ModulesConfig, json: bool) -> Result<()> {
    let mut registry = ModuleRegistry::from_config(config);
    let summaries = registry.survey().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    if summaries.is_empty() {
        println!("No modules found");
    }
    for module in &summaries {
        println!(
            "{:<9} {:<40} {:<20} serial={} model={}",
            module.module_type.to_string(),
            module.port,
            module.state.to_string(),
            module.device_info.serial().unwrap_or("-"),
            module.device_info.model().unwrap_or("-"),
        );
    }
    Ok(())
}

async fn update(
    config: &ModulesConfig,
    serial: &str,
    firmware: PathBuf,
    tool_config: PathBuf,
) -> Result<()> {
    let mut registry = ModuleRegistry::from_config(config);
    let report = registry
        .update_firmware(serial, &firmware, &tool_config)
        .await
        .with_context(|| format!("Firmware update of module {serial} failed"))?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
