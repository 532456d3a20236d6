//! Command-line flags for the `edge-gatewayd` service entry point, modeled
//! on the teacher's `#[derive(Parser)]` style even though this binary is a
//! single long-running service rather than a multi-subcommand tool.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Edge message-routing and file-transfer gateway", long_about = None)]
pub struct Cli {
    /// Path to the gateway's JSON configuration file. Defaults to
    /// `~/.edge-gateway/config.json`.
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Path to the sqlite database backing the ConfigStore. Overrides the
    /// value in the configuration file when given.
    #[clap(long)]
    pub db: Option<PathBuf>,

    /// Enable debug-level tracing (default is warn-level).
    #[clap(long)]
    pub debug: bool,
}
