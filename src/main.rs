use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use flightbox::geometry::Position;
use flightbox::log_format::{TargetFirstFormat, plain_layer};

mod commands;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser, Debug)]
#[command(
    name = "flightbox",
    version,
    about = "Collects ADS-B, GNSS and FLARM telemetry and routes it to NMEA and traffic outputs"
)]
struct Cli {
    /// Also append log output to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the hub with the configured inputs, transformation and outputs (default)
    Run {
        /// Config file (default: $FLIGHTBOX_CONFIG, then ./flightbox.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Decode an SBS1 capture file and print sentences and traffic frames
    DecodeSbs1 {
        file: PathBuf,
        /// Reference latitude for relative positions
        #[arg(long, requires = "lon", allow_hyphen_values = true)]
        lat: Option<f64>,
        /// Reference longitude for relative positions
        #[arg(long, requires = "lat", allow_hyphen_values = true)]
        lon: Option<f64>,
        /// Reference altitude in meters
        #[arg(long, allow_hyphen_values = true)]
        alt_m: Option<f64>,
    },
}

fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .event_format(TargetFirstFormat::default())
        .with_writer(std::io::stderr);

    let file_layer = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {:?}", path))?;
            Some(plain_layer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to initialize logging")
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.log_file.as_deref())?;

    match cli.command.unwrap_or(Commands::Run { config: None }) {
        Commands::Run { config } => commands::handle_run(config.as_deref()).await,
        Commands::DecodeSbs1 {
            file,
            lat,
            lon,
            alt_m,
        } => {
            let reference = lat.zip(lon).map(|(lat, lon)| {
                let position = Position::new(lat, lon);
                match alt_m {
                    Some(alt) => position.with_altitude(alt),
                    None => position,
                }
            });
            commands::handle_decode_sbs1(&file, reference)
        }
    }
}
