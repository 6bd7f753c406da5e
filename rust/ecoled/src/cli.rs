//! Command-line arguments.

use clap::Parser;
use std::path::PathBuf;
use tracing::Level;

/// ecoled - school grades and fee-recovery sidecar
///
/// Reads one JSON request per line on stdin and writes one JSON response per
/// line on stdout. Logs go to stderr.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Workspace directory to open at startup
    ///
    /// Same effect as sending `workspace.select` first.
    #[arg(short, long, value_name = "DIR", env = "ECOLED_WORKSPACE")]
    pub workspace: Option<PathBuf>,

    /// Path to a configuration file
    ///
    /// Takes precedence over an `ecoled.toml` found in the workspace.
    #[arg(short, long, value_name = "FILE", env = "ECOLED_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging on stderr
    #[arg(short, long)]
    pub verbose: bool,

    /// Print a default ecoled.toml to stdout and exit
    #[arg(long)]
    pub print_config: bool,
}

impl Args {
    pub fn log_level(&self) -> Level {
        if self.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        }
    }
}
