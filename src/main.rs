//! CLI entry point for av-control
//!
//! Provides command-line interface for:
//! - Running a room (devices, keep-alive supervision, debug console)
//! - Checking a room configuration without touching any device
//!
//! # Usage
//!
//! ```bash
//! av-control run --config config/room.toml
//! av-control check-config --config config/room.toml
//! ```

use anyhow::{Context, Result};
use av_control::config::{RoomConfig, TransportConfig};
use av_control::logging::{self, LogFormat, LoggingConfig};
use av_control::room::Room;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "av-control")]
#[command(about = "Keep-alive supervision and debug console for AV devices", long_about = None)]
struct Cli {
    /// Log output format (pretty, compact, json); overrides the configuration
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    /// Raise the log level (-v debug, -vv trace); overrides the configuration
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every configured device and the console, run until Ctrl-C
    Run {
        #[arg(long, default_value = "config/room.toml")]
        config: PathBuf,
    },

    /// Load and validate a configuration, then print a summary
    CheckConfig {
        #[arg(long, default_value = "config/room.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Run { config } => {
            let room_config = load(config)?;
            init_logging(&cli, &room_config)?;
            info!(config = %config.display(), "configuration loaded");
            Room::new(room_config).run().await?;
            Ok(())
        }
        Commands::CheckConfig { config } => {
            let room_config = load(config)?;
            print_summary(&room_config);
            Ok(())
        }
    }
}

fn load(path: &Path) -> Result<RoomConfig> {
    let config = RoomConfig::load(path)
        .with_context(|| format!("loading {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("validating {}", path.display()))?;
    Ok(config)
}

fn init_logging(cli: &Cli, config: &RoomConfig) -> Result<()> {
    let format = cli.log_format.unwrap_or(config.application.log_format);
    let mut logging_config =
        LoggingConfig::from_names(&config.application.log_level, format).map_err(anyhow::Error::msg)?;
    match cli.verbose {
        0 => {}
        1 => logging_config.level = Level::DEBUG,
        _ => logging_config.level = Level::TRACE,
    }
    logging::init(&logging_config).map_err(anyhow::Error::msg)
}

fn print_summary(config: &RoomConfig) {
    println!("Room: {}", config.application.name);
    println!(
        "Handlers: limit {}, poll every {:?}, retry every {:?}",
        config.handlers.disconnect_limit, config.handlers.poll_interval, config.handlers.connect_retry
    );
    if config.console.enabled {
        println!("Console: port {}, {} users", config.console.port, config.console.users.len());
    } else {
        println!("Console: disabled");
    }
    for device in &config.devices {
        let link = match &device.transport {
            TransportConfig::Tcp { host, port } => format!("tcp {host}:{port}"),
            TransportConfig::Udp { host, port, .. } => format!("udp {host}:{port}"),
            TransportConfig::Serial { path, baud_rate } => format!("serial {path} @ {baud_rate}"),
            TransportConfig::Visca { host, port } => format!("visca {host}:{port} via :{}", config.visca.port),
        };
        println!(
            "Device {}: {} over {link}, keep-alive {}",
            device.name,
            device.driver,
            device.keep_alive().command
        );
    }
    println!("Configuration OK");
}
