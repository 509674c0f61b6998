//! # smartscan
//!
//! Command line entry point: load the configuration, connect to the instrument
//! (or the built-in simulator) and run one adaptive scan campaign.
//!
//! While the campaign runs, type `pause`, `resume` or `exit` on stdin. Ctrl-C
//! requests the same cooperative stop as `exit`.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use smartscan::config::Settings;
use smartscan::logging::init_logging;
use smartscan::scan::console::spawn_stdin_console;
use smartscan::scan::{SmartScan, SnapshotWriter};
use smartscan::transport::simulator::quick_settings;
use smartscan::transport::{SimulatedTransport, TcpTransport, Transport};

/// Adaptive, model-driven scanning campaigns
#[derive(Parser, Debug)]
#[command(name = "smartscan", version)]
struct Cli {
    /// Configuration file (TOML or YAML)
    #[arg(short, long, default_value = "config/smartscan.toml")]
    config: PathBuf,

    /// Log level or filter directive, overrides the configuration and RUST_LOG
    #[arg(short, long)]
    log: Option<String>,

    /// Time budget, e.g. "90m" or "2h 30m" (overrides scanning.duration)
    #[arg(long, value_parser = parse_duration)]
    duration: Option<Duration>,

    /// Run against the built-in instrument simulator instead of TCP
    #[arg(long)]
    simulate: bool,

    /// Do not read pause/resume/exit commands from stdin
    #[arg(long)]
    no_console: bool,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    let log_file = init_logging(&settings.logging, cli.log.as_deref())
        .context("Failed to initialize logging")?;
    info!(config = %cli.config.display(), "Configuration loaded");

    let transport: Arc<dyn Transport> = if cli.simulate {
        let sim_settings = settings
            .simulator
            .clone()
            .unwrap_or_else(|| quick_settings("data"));
        let simulator = SimulatedTransport::new(sim_settings).context("Failed to build simulator")?;
        info!(simulator = ?simulator, "Using simulated instrument");
        Arc::new(simulator)
    } else {
        let tcp = TcpTransport::new(&settings.tcp);
        info!(address = %tcp.address(), "Using TCP instrument");
        Arc::new(tcp)
    };

    let mut scan = SmartScan::new(settings, transport)
        .context("Invalid scan configuration")?
        .with_log_file(log_file)
        .with_visualizer(Box::new(SnapshotWriter::new()));
    if let Some(duration) = cli.duration {
        scan = scan.with_duration(duration);
    }

    let handle = scan.handle();
    tokio::spawn({
        let handle = handle.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping scan");
                handle.stop();
            }
        }
    });
    if !cli.no_console {
        spawn_stdin_console(handle).context("Failed to start console")?;
    }

    let summary = scan.run().await.context("Scan failed")?;
    info!(
        iterations = summary.iterations,
        positions = summary.unique_positions,
        spectra = summary.spectra,
        trainings = summary.trainings,
        elapsed = ?summary.elapsed,
        "Done"
    );
    Ok(())
}
