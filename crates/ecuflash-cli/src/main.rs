//! ecuflash - ECU flashing and diagnostics CLI

mod commands;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ecuflash::FlashConfig;

#[derive(Parser)]
#[command(name = "ecuflash")]
#[command(author, version, about = "UDS-over-CAN ECU flashing tool")]
#[command(propagate_version = true)]
struct Cli {
    /// CAN interface
    #[arg(short, long, env = "ECUFLASH_INTERFACE")]
    interface: Option<String>,

    /// Configuration file path (TOML)
    #[arg(short, long, env = "ECUFLASH_CONFIG")]
    config: Option<PathBuf>,

    /// Append a plain-text audit line for every CAN frame to this file
    #[arg(long)]
    frame_log: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Unlock the ECU and reset it into the bootloader
    Preflash,

    /// Flash a firmware image: preflash, then program every block
    Flash {
        /// S-record image path
        image: PathBuf,
    },

    /// Finalize a region: transfer exit plus CRC validation
    Postflash {
        /// Region start address
        #[arg(long, value_parser = parse_u32)]
        address: u32,

        /// Region length in bytes
        #[arg(long, value_parser = parse_u32)]
        length: u32,

        /// Expected 16-bit CRC of the streamed bytes
        #[arg(long, value_parser = parse_u16)]
        crc: u16,
    },

    /// List the contiguous blocks of an image without touching the bus
    Blocks {
        /// S-record image path
        image: PathBuf,
    },

    /// Listen for one telemetry value
    Probe {
        /// Probe name (e.g. battery-soc, mcu-version); see --list
        #[arg(required_unless_present = "list")]
        name: Option<String>,

        /// List available probes
        #[arg(long)]
        list: bool,
    },

    /// Read or clear MCU diagnostic trouble codes
    Dtc {
        /// Clear instead of read
        #[arg(long)]
        clear: bool,
    },
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let (digits, radix) = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(rest) => (rest, 16),
        None => (s, 10),
    };
    u32::from_str_radix(digits, radix).map_err(|e| e.to_string())
}

fn parse_u16(s: &str) -> Result<u16, String> {
    parse_u32(s)?
        .try_into()
        .map_err(|_| format!("'{s}' does not fit in 16 bits"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let mut config = match &cli.config {
        Some(path) => FlashConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => FlashConfig::default(),
    };
    if let Some(interface) = cli.interface {
        config.interface = interface;
    }
    if let Some(path) = cli.frame_log {
        config.frame_log = Some(path);
    }

    match cli.command {
        Commands::Preflash => commands::preflash::run(&config).await,
        Commands::Flash { image } => commands::flash::run(&config, &image).await,
        Commands::Postflash {
            address,
            length,
            crc,
        } => commands::postflash::run(&config, address, length, crc).await,
        Commands::Blocks { image } => commands::blocks::run(&image),
        Commands::Probe { name, list } => commands::probe::run(&config, name.as_deref(), list).await,
        Commands::Dtc { clear } => commands::dtc::run(&config, clear).await,
    }
}
