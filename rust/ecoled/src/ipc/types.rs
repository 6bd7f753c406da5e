use std::path::PathBuf;
use std::time::Instant;

use rusqlite::Connection;
use serde::Deserialize;

use crate::cache::ReportCache;
use crate::config::Config;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Identity established by the front end's session layer.
    #[serde(default)]
    pub user: Option<String>,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub config: Config,
    /// Set when `--config` was given; workspace files are then ignored.
    pub config_pinned: bool,
    pub cache: ReportCache,
}

impl AppState {
    pub fn new(config: Config, config_pinned: bool) -> Self {
        let cache = ReportCache::new(config.cache_ttl());
        Self {
            workspace: None,
            db: None,
            config,
            config_pinned,
            cache,
        }
    }
}

/// Per-request values handed down to the handlers instead of session globals.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub user: String,
    pub now: Instant,
}

impl RequestContext {
    pub fn from_request(req: &Request) -> Self {
        Self {
            user: req
                .user
                .as_deref()
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .unwrap_or("anonymous")
                .to_string(),
            now: Instant::now(),
        }
    }
}
