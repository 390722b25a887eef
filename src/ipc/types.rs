use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::cache::GridCache;
use crate::commit::Committer;
use crate::config::CommitPolicy;
use crate::grid::Navigator;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Navigator bound to the class it was opened on.
pub struct CursorSession {
    pub class_id: String,
    pub nav: Navigator,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub grids: GridCache,
    pub committer: Option<Committer>,
    pub policy: CommitPolicy,
    pub cursor: Option<CursorSession>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            workspace: None,
            db: None,
            grids: GridCache::default(),
            committer: None,
            policy: CommitPolicy::default(),
            cursor: None,
        }
    }
}
