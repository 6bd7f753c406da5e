mod cache;
mod calc;
mod cli;
mod config;
mod db;
mod error;
mod export;
mod ipc;
mod ranking;
mod recovery;
mod report;

use std::io::{self, BufRead, Write};

use anyhow::Result;
use clap::Parser;
use cli::Args;
use config::Config;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Logs go to stderr; stdout carries the protocol.
fn init_logging(args: &Args) {
    let filter = EnvFilter::try_from_env("ECOLED_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(args.log_level().to_string().to_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .with_ansi(false)
        .compact()
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print!("{}", Config::default_toml());
        return Ok(());
    }

    init_logging(&args);
    info!("ecoled v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    let mut state = match &args.config {
        Some(path) => {
            let config = Config::load(path)?;
            info!("using config {}", path.display());
            ipc::AppState::new(config, true)
        }
        None => ipc::AppState::new(Config::default(), false),
    };
    if let Some(ws) = &args.workspace {
        ipc::open_workspace(&mut state, ws)?;
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // No id to answer to.
                let resp = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        debug!(id = %req.id, method = %req.method, "request");
        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }

    info!("stdin closed, exiting");
    Ok(())
}
