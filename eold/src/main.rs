//! EOL Station Daemon
//!
//! Loads the station configuration, builds one driver per configured device,
//! starts the execution engine and runs the requested test sequence. Engine
//! events are printed to stdout as JSON lines.
//!
//! # Running tests
//!
//! - `eold --sequence force --dut SN123` runs one test and exits.
//! - `--repeat N` runs the same sequence N times with the configured pause
//!   between cycles; serial numbers get a `-001`, `-002`... suffix.
//! - Finished runs are written as JSON files to the `--results` directory
//!   (or `engine.result_dir` from the station file).
//! - Without `--sequence` the daemon connects (if configured) and idles
//!   until Ctrl+C.
//!
//! The first Ctrl+C or SIGTERM cancels the running work and shuts down with
//! every device made safe. A second one trips the emergency stop.

mod shutdown;
mod station;

use anyhow::Result;
use clap::Parser;
use eol_core::config::CONFIG_ENV_VAR;
use eol_core::default_config_path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

/// EOL test station daemon
#[derive(Parser, Debug)]
#[command(name = "eold")]
#[command(version, about = "EOL Test Station Daemon", long_about = None)]
struct Args {
    /// Path to station configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Enable mock mode (simulate every configured device)
    #[arg(long)]
    mock: bool,

    /// Test sequence to run
    #[arg(short, long)]
    sequence: Option<String>,

    /// Serial number of the device under test
    #[arg(short, long, default_value = "DUT")]
    dut: String,

    /// Number of test cycles
    #[arg(short, long, default_value_t = 1)]
    repeat: u32,

    /// Directory for archived test results (overrides the station file)
    #[arg(long)]
    results: Option<PathBuf>,

    /// List configured sequences and exit
    #[arg(long)]
    list: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_tracing(args.verbose);

    info!("EOL station starting...");

    // Config path: CLI flag > env var > default
    let config_path = args.config.unwrap_or_else(|| {
        std::env::var(CONFIG_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_config_path())
    });
    info!("Configuration file: {}", config_path.display());

    let config = station::load(&config_path, args.mock)?;
    info!(
        "Configuration loaded: {} device(s), {} sequence(s)",
        config.devices.len(),
        config.sequences.len()
    );

    if args.list {
        for sequence in &config.sequences {
            println!("{}", sequence.name);
        }
        return Ok(());
    }

    let archive = station::open_archive(&config, args.results)?;
    let engine = Arc::new(station::start_engine(&config)?);
    tokio::spawn(station::print_events(engine.subscribe()));

    if config.engine.connect_on_start {
        info!("Connecting all devices...");
        engine.submit_connect_all()?;
    }

    let mut failed = false;
    match args.sequence.as_deref() {
        Some(sequence) => {
            let pause = Duration::from_millis(config.engine.cycle_pause_ms);
            let cycles = station::run_cycles(
                &engine,
                archive.as_ref(),
                sequence,
                &args.dut,
                args.repeat,
                pause,
            );
            tokio::select! {
                outcome = cycles => {
                    match outcome {
                        Ok(results) => {
                            let passed = results.iter().filter(|r| r.passed()).count();
                            info!("{}/{} cycle(s) passed", passed, results.len());
                            failed = passed != results.len();
                        }
                        Err(e) => {
                            error!("Test run failed: {:#}", e);
                            failed = true;
                        }
                    }
                }
                _ = shutdown_signal() => {
                    warn!("Test run interrupted");
                    failed = true;
                }
            }
        }
        None => {
            info!("Station ready, no sequence requested");
            shutdown_signal().await;
        }
    }

    shutdown::stop_station(engine, shutdown_signal()).await;

    info!("Station shutdown complete");
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        },
    }
}

/// Initialize tracing subscriber for logging
fn init_tracing(verbose: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
