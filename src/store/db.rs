//! Connection helper shared by every repository.
//!
//! Grounded in `orchestrator::queue::SqliteTaskQueue`: open a fresh
//! [`rusqlite::Connection`] inside `spawn_blocking` per call.
//! `rusqlite::Connection` is `!Send`-by-convention across await points,
//! so this keeps blocking SQLite work off the async executor without a
//! pool crate.

use std::path::{Path, PathBuf};

use rusqlite::Connection;
use tokio::task;

use crate::error::{AgencyError, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    agent_type TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    profile_ref TEXT NOT NULL,
    loop_interval_secs INTEGER NOT NULL,
    status TEXT NOT NULL,
    last_heartbeat TEXT,
    container_handle TEXT
);

CREATE TABLE IF NOT EXISTS agent_state (
    agent_id TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (agent_id, key)
);

CREATE TABLE IF NOT EXISTS agent_history (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    action_type TEXT NOT NULL,
    summary TEXT NOT NULL,
    details TEXT NOT NULL,
    embedding TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_history_agent ON agent_history(agent_id, created_at);

CREATE TABLE IF NOT EXISTS decisions (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    proposed_by TEXT NOT NULL,
    tier TEXT NOT NULL,
    status TEXT NOT NULL,
    veto_round INTEGER NOT NULL DEFAULT 0,
    ceo_vote TEXT,
    dao_vote TEXT,
    c_level_votes TEXT NOT NULL DEFAULT '{}',
    human_decision TEXT,
    resolved_at TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    assigned_to TEXT NOT NULL,
    created_by TEXT NOT NULL,
    status TEXT NOT NULL,
    priority INTEGER NOT NULL,
    due_date TEXT,
    completed_at TEXT,
    result TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_assigned ON tasks(assigned_to, status, priority);

CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    event_type TEXT NOT NULL,
    source_agent TEXT,
    target_agent TEXT,
    payload TEXT NOT NULL,
    correlation_id TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_correlation ON events(correlation_id);

CREATE TABLE IF NOT EXISTS escalations (
    id TEXT PRIMARY KEY,
    decision_id TEXT NOT NULL,
    reason TEXT NOT NULL,
    channels_notified TEXT NOT NULL,
    human_response TEXT,
    responded_at TEXT,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS system_settings (
    category TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (category, key)
);
"#;

/// Owns the database file path; every repository call opens its own
/// connection inside `spawn_blocking`.
#[derive(Clone)]
pub struct Db {
    path: PathBuf,
}

impl Db {
    /// Opens (creating if needed) the database at `path` and applies the
    /// schema. Schema application failures are fatal (§7: "DB schema
    /// violation | store | fatal").
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let path_for_blocking = path.clone();
        task::spawn_blocking(move || -> Result<()> {
            let conn = Connection::open(&path_for_blocking)?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .map_err(|e| AgencyError::Fatal(format!("schema init task panicked: {e}")))??;
        Ok(Self { path })
    }

    pub(crate) fn connect(&self) -> rusqlite::Result<Connection> {
        Connection::open(&self.path)
    }

    pub(crate) fn path(&self) -> PathBuf {
        self.path.clone()
    }
}
