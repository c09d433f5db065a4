use std::path::PathBuf;
use std::time::Duration;

use rusqlite::Connection;
use serde::Deserialize;

use crate::cache::TtlCache;

/// How long a cached reference bootstrap payload stays valid.
const BOOTSTRAP_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub bootstrap_cache: TtlCache<serde_json::Value>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            workspace: None,
            db: None,
            bootstrap_cache: TtlCache::with_system_clock(BOOTSTRAP_CACHE_TTL),
        }
    }
}
