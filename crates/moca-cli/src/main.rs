//! Moca CLI
//!
//! Inspect the epoch clock and configuration, and replay scripted
//! transaction sequences against an in-memory protocol.

mod scenario;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use moca_core::clock::ClockReading;
use moca_node::{telemetry, ProtocolConfig};
use scenario::{Scenario, Simulation};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "moca")]
#[command(version)]
#[command(about = "Moca vote-escrow protocol tools", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML); `MOCA__*` environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the configuration as TOML
    Config {
        /// Print the loaded configuration instead of the defaults
        #[arg(long)]
        resolved: bool,
    },

    /// Show week and epoch boundaries around a Unix timestamp
    Clock {
        /// Unix seconds, defaults to now
        timestamp: Option<u64>,
    },

    /// Replay a JSON scenario and print every outcome
    Simulate {
        /// Scenario file
        scenario: PathBuf,

        /// Write the final bincode state here
        #[arg(long)]
        export: Option<PathBuf>,
    },
}

fn utc(timestamp: u64) -> String {
    i64::try_from(timestamp)
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "out of range".to_string())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = ProtocolConfig::load(cli.config.as_deref()).context("loading configuration")?;
    telemetry::init(&config.logging, cli.verbose)?;

    match cli.command {
        Commands::Config { resolved } => {
            let shown = if resolved { config } else { ProtocolConfig::default() };
            print!("{}", shown.to_toml()?);
        }

        Commands::Clock { timestamp } => {
            let now = match timestamp {
                Some(ts) => ts,
                None => u64::try_from(Utc::now().timestamp()).context("system clock before 1970")?,
            };
            let reading = ClockReading::at(now);
            println!("Timestamp:   {:>12}  {}", reading.timestamp, utc(reading.timestamp));
            println!("Week start:  {:>12}  {}", reading.week_start, utc(reading.week_start));
            println!("Epoch:       {:>12}", reading.epoch);
            println!("Epoch start: {:>12}  {}", reading.epoch_start, utc(reading.epoch_start));
            println!("Epoch end:   {:>12}  {}", reading.epoch_end, utc(reading.epoch_end));
        }

        Commands::Simulate { scenario, export } => {
            let source = std::fs::read_to_string(&scenario)
                .with_context(|| format!("reading scenario {}", scenario.display()))?;
            let parsed: Scenario = serde_json::from_str(&source).context("parsing scenario")?;
            tracing::info!(steps = parsed.steps.len(), path = %scenario.display(), "replaying scenario");

            let mut sim = Simulation::new(&parsed, config)?;
            let outcomes = sim.run(&parsed.steps)?;
            for outcome in &outcomes {
                let (status, detail) = match &outcome.result {
                    Ok(value) => ("ok", value.as_str()),
                    Err(reason) => ("reverted", reason.as_str()),
                };
                println!(
                    "[{:>3}] {:>12} {:<28} {:<8} {}",
                    outcome.index, outcome.timestamp, outcome.op, status, detail
                );
            }

            if let Some(path) = export {
                let bytes = sim.protocol().export_state()?;
                std::fs::write(&path, &bytes).with_context(|| format!("writing {}", path.display()))?;
                println!("State written to {} ({} bytes)", path.display(), bytes.len());
            }
            println!("State root: {}", sim.protocol().state_root_hex()?);
        }
    }

    Ok(())
}
