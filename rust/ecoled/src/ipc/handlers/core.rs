use crate::config::Config;
use crate::db;
use crate::ipc::error::err;
use crate::ipc::helpers::{required_str, respond, Reply};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

fn handle_health(state: &mut AppState, _req: &Request) -> Reply {
    Ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
        "cache": {
            "ttlSeconds": state.cache.ttl().as_secs(),
            "entries": state.cache.len(),
        }
    }))
}

/// Opens (creating if needed) the workspace database and picks up its
/// `ecoled.toml`. Used by `workspace.select` and by `--workspace` at startup.
pub fn open_workspace(state: &mut AppState, path: &Path) -> anyhow::Result<()> {
    let conn = db::open_db(path)?;

    if !state.config_pinned {
        let config = match Config::load_from_workspace(path) {
            Ok(Some(c)) => {
                info!("loaded {} from workspace", crate::config::CONFIG_FILE_NAME);
                c
            }
            Ok(None) => Config::default(),
            Err(e) => {
                warn!("ignoring workspace config: {:#}", e);
                Config::default()
            }
        };
        state.cache.set_ttl(config.cache_ttl());
        state.config = config;
    }

    if !state.cache.is_empty() {
        debug!("dropping {} cached reports", state.cache.len());
        state.cache.clear();
    }
    state.workspace = Some(path.to_path_buf());
    state.db = Some(conn);
    info!("workspace opened: {}", path.display());
    Ok(())
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> Reply {
    let path = PathBuf::from(required_str(req, "path")?);
    match open_workspace(state, &path) {
        Ok(()) => Ok(json!({
            "workspacePath": path.to_string_lossy(),
            "config": state.config,
        })),
        Err(e) => Err(err(&req.id, "db_open_failed", format!("{e:#}"), None)),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let reply = match req.method.as_str() {
        "health" => handle_health(state, req),
        "workspace.select" => handle_workspace_select(state, req),
        _ => return None,
    };
    Some(respond(req, reply))
}
