//! CLI entry point for mkid-readout
//!
//! Provides command-line access to:
//! - Hardware bring-up of one or more boards (program, MicroBlaze init, bus calibration)
//! - Channelizer configuration (frequency list, LUTs, IQ loop sweeps, FIR taps, thresholds)
//! - Dry-run channel allocation of a frequency list
//!
//! # Usage
//!
//! Bring every configured board up:
//! ```bash
//! mkid-readout --config config/readout.toml init --all
//! ```
//!
//! Re-run one configuration command on board 112 (prerequisites run as needed):
//! ```bash
//! mkid-readout --config config/readout.toml configure --board 112 --command define-dac-lut
//! ```
//!
//! Show the merged configuration (file, defaults and `MKID_` environment overrides):
//! ```bash
//! mkid-readout --config config/readout.toml show-config
//! ```
//!
//! Show where resonators would land:
//! ```bash
//! mkid-readout allocate --freq-file freqs.txt --order spread
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use mkid_readout::bringup::{run_boards, ConfigureCommand, InitCommand, Target, WorkerRequest};
use mkid_readout::channels::{AllocationOrder, ChannelGrid};
use mkid_readout::config::ReadoutConfig;
use mkid_readout::device::DefaultConnector;
use mkid_readout::resonator::load_freq_file;
use mkid_readout::tracing_init::{self, OutputFormat, TracingConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "mkid-readout")]
#[command(about = "Configure and bring up MKID channelizer readout boards", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/readout.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format: pretty, compact or json
    #[arg(long, global = true, default_value = "compact")]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct BoardSelection {
    /// Board number to run. Repeat for several; omit for every configured board
    #[arg(long = "board")]
    boards: Vec<u32>,

    /// Run this command (and whatever it needs), even if already completed
    #[arg(long, conflicts_with = "all")]
    command: Option<String>,

    /// Bring every command to completion without repeating completed ones
    #[arg(long)]
    all: bool,
}

impl BoardSelection {
    fn target<C: mkid_readout::bringup::CommandSet>(&self) -> Result<Target<C>> {
        match &self.command {
            Some(name) if !self.all => name.parse().map_err(|e: String| anyhow!(e)),
            _ => Ok(Target::EnsureAll),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Program and calibrate the board hardware
    Init {
        #[command(flatten)]
        selection: BoardSelection,
    },

    /// Load frequency combs, LUTs, FIR taps and thresholds
    Configure {
        #[command(flatten)]
        selection: BoardSelection,

        /// Resonator to channel allocation order
        #[arg(long, default_value = "spread")]
        order: AllocationOrder,
    },

    /// Print the channel grid a frequency list would produce
    Allocate {
        /// Frequency list file
        #[arg(long)]
        freq_file: PathBuf,

        /// Resonator to channel allocation order
        #[arg(long, default_value = "spread")]
        order: AllocationOrder,
    },

    /// Print the effective configuration with every default filled in
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ReadoutConfig::load_from(path),
        None => ReadoutConfig::load(),
    }
    .map_err(|e| anyhow!("Failed to load configuration: {}", e))?;
    config
        .validate()
        .map_err(|e| anyhow!("Invalid configuration: {}", e))?;

    let level = tracing_init::parse_log_level(&config.application.log_level).map_err(|e| anyhow!(e))?;
    tracing_init::init(TracingConfig::new(level).with_format(cli.log_format)).map_err(|e| anyhow!(e))?;

    match cli.command {
        Commands::Init { selection } => {
            let request = WorkerRequest {
                boards: selection.boards.clone(),
                init: Some(selection.target::<InitCommand>()?),
                ..WorkerRequest::default()
            };
            run(config, request).await
        }
        Commands::Configure { selection, order } => {
            let request = WorkerRequest {
                boards: selection.boards.clone(),
                configure: Some(selection.target::<ConfigureCommand>()?),
                order,
                ..WorkerRequest::default()
            };
            run(config, request).await
        }
        Commands::Allocate { freq_file, order } => allocate(&config, freq_file, order),
        Commands::ShowConfig => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn run(config: ReadoutConfig, request: WorkerRequest) -> Result<()> {
    let reports = run_boards(Arc::new(config), Arc::new(DefaultConnector), request).await?;
    println!("{}", serde_json::to_string_pretty(&reports)?);

    let failed: Vec<u32> = reports.iter().filter(|r| !r.is_ok()).map(|r| r.board).collect();
    if failed.is_empty() {
        info!(boards = reports.len(), "All boards finished");
        Ok(())
    } else {
        Err(anyhow!("Boards {:?} failed", failed))
    }
}

fn allocate(config: &ReadoutConfig, freq_file: PathBuf, order: AllocationOrder) -> Result<()> {
    let resonators = load_freq_file(&freq_file)
        .with_context(|| format!("Failed to read {}", freq_file.display()))?;
    let grid = ChannelGrid::for_firmware(resonators.len(), &config.firmware, order)?;

    println!("{:>8} {:>16} {:>8} {:>8} {:>8}", "resID", "freq (Hz)", "channel", "stream", "index");
    for (idx, res) in resonators.iter().enumerate().take(grid.n_resonators()) {
        if let Some(slot) = grid.slot_of(idx) {
            println!(
                "{:>8} {:>16.1} {:>8} {:>8} {:>8}",
                res.id,
                res.frequency_hz,
                slot.channel,
                slot.stream,
                slot.firmware_index()
            );
        }
    }
    if grid.n_resonators() < resonators.len() {
        println!(
            "{} resonators dropped: device holds {} channels",
            resonators.len() - grid.n_resonators(),
            config.firmware.n_channels
        );
    }
    Ok(())
}
