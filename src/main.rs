//! `edge-gatewayd`: the service entry point. Parses CLI flags, loads
//! configuration, initializes file-based tracing the same way the
//! teacher's CLI did (`tracing-appender::non_blocking` writer, leaked
//! guard), opens the sqlite ConfigStore, and runs the `BrokerSupervisor`
//! to completion on a dedicated thread, joining it after SIGINT/SIGTERM.

use std::fs::OpenOptions;
use std::sync::Arc;

use clap::Parser;
use edge_gateway::cli::Cli;
use edge_gateway::config::Config;
use edge_gateway::store::ConfigStore;
use edge_gateway::supervisor::BrokerSupervisor;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing_appender::non_blocking;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.clone(), cli.db.clone());
    init_tracing(&config, cli.debug);

    tracing::info!(db = %config.db_path.display(), "starting edge-gatewayd");
    let store = Arc::new(ConfigStore::open(&config.db_path)?);
    let supervisor = Arc::new(BrokerSupervisor::new(config.broker.clone(), store));

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let supervisor_for_signals = supervisor.clone();
    std::thread::spawn(move || {
        if signals.forever().next().is_some() {
            tracing::info!("shutdown signal received, stopping supervisor");
            supervisor_for_signals.stop();
        }
    });

    let handle = supervisor.run_blocking();
    handle.join().map_err(|_| anyhow::anyhow!("supervisor thread panicked"))?;
    tracing::info!("edge-gatewayd stopped");
    Ok(())
}

/// Initializes tracing to `<logs_dir>/debug.log`, matching the teacher's
/// console-silent, file-only logging discipline. `--debug` raises the
/// level from warn to debug; the writer guard is leaked so the background
/// flush thread survives for the life of the process.
fn init_tracing(config: &Config, debug: bool) {
    let logs_dir = &config.logs_dir;
    let _ = std::fs::create_dir_all(logs_dir);
    let log_path = logs_dir.join("debug.log");
    let level = if debug { "debug" } else { "warn" };

    match OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => {
            let (writer, guard) = non_blocking(file);
            let _ = Box::leak(Box::new(guard));
            let file_layer = fmt::layer().with_writer(writer).with_ansi(false).with_filter(EnvFilter::new(level));
            tracing_subscriber::registry().with(file_layer).init();
        }
        Err(e) => {
            eprintln!("warning: could not open debug log at {}: {e}", log_path.display());
        }
    }
}
