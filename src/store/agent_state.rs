//! `agentState` repository: `(agentId, key) -> JSON value` (§3, §4.1).

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use tokio::task;

use crate::error::{AgencyError, Result};

use super::db::Db;

/// Keys that must be readable in one cheap call (§3).
pub const ESSENTIAL_KEYS: [&str; 6] = [
    "loop_count",
    "last_loop_at",
    "last_loop_result",
    "current_focus",
    "error_count",
    "success_count",
];

/// The minimal per-agent state loaded on every loop invocation (§4.9 step 2).
#[derive(Debug, Clone, Default)]
pub struct EssentialState {
    pub loop_count: i64,
    pub last_loop_at: Option<String>,
    pub last_loop_result: Option<String>,
    pub current_focus: Option<String>,
    pub error_count: i64,
    pub success_count: i64,
}

#[derive(Clone)]
pub struct AgentStateRepo {
    db: Db,
}

impl AgentStateRepo {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Upsert on `(agentId, key)`, per §4.1.
    pub async fn set(&self, agent_id: &str, key: &str, value: &Value) -> Result<()> {
        let db = self.db.clone();
        let agent_id = agent_id.to_string();
        let key = key.to_string();
        let value_json = serde_json::to_string(value)?;
        task::spawn_blocking(move || -> Result<()> {
            let conn = db.connect()?;
            conn.execute(
                "INSERT INTO agent_state (agent_id, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(agent_id, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![agent_id, key, value_json, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| AgencyError::Transient(e.to_string()))?
    }

    /// Read of an unknown key returns `None`, never an error (§4.1).
    pub async fn get(&self, agent_id: &str, key: &str) -> Result<Option<Value>> {
        let db = self.db.clone();
        let agent_id = agent_id.to_string();
        let key = key.to_string();
        task::spawn_blocking(move || -> Result<Option<Value>> {
            let conn = db.connect()?;
            let raw: Option<String> = conn
                .query_row(
                    "SELECT value FROM agent_state WHERE agent_id = ?1 AND key = ?2",
                    params![agent_id, key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(match raw {
                Some(s) => Some(serde_json::from_str(&s)?),
                None => None,
            })
        })
        .await
        .map_err(|e| AgencyError::Transient(e.to_string()))?
    }

    /// Loads the six essential keys in one call (§3, §4.9 step 2).
    pub async fn get_essential(&self, agent_id: &str) -> Result<EssentialState> {
        let db = self.db.clone();
        let agent_id = agent_id.to_string();
        task::spawn_blocking(move || -> Result<EssentialState> {
            let conn = db.connect()?;
            let placeholders: Vec<&str> = ESSENTIAL_KEYS.to_vec();
            let mut stmt = conn.prepare(
                "SELECT key, value FROM agent_state WHERE agent_id = ?1 AND key IN (?2,?3,?4,?5,?6,?7)",
            )?;
            let rows = stmt.query_map(
                params![
                    agent_id,
                    placeholders[0],
                    placeholders[1],
                    placeholders[2],
                    placeholders[3],
                    placeholders[4],
                    placeholders[5],
                ],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )?;
            let mut state = EssentialState::default();
            for row in rows {
                let (key, raw) = row?;
                let value: Value = serde_json::from_str(&raw).unwrap_or(Value::Null);
                match key.as_str() {
                    "loop_count" => state.loop_count = value.as_i64().unwrap_or(0),
                    "last_loop_at" => state.last_loop_at = value.as_str().map(str::to_string),
                    "last_loop_result" => state.last_loop_result = value.as_str().map(str::to_string),
                    "current_focus" => state.current_focus = value.as_str().map(str::to_string),
                    "error_count" => state.error_count = value.as_i64().unwrap_or(0),
                    "success_count" => state.success_count = value.as_i64().unwrap_or(0),
                    _ => {}
                }
            }
            Ok(state)
        })
        .await
        .map_err(|e| AgencyError::Transient(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_repo() -> AgentStateRepo {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path().join("test.sqlite3")).await.unwrap();
        std::mem::forget(dir);
        AgentStateRepo::new(db)
    }

    #[tokio::test]
    async fn unknown_key_returns_none() {
        let repo = test_repo().await;
        assert_eq!(repo.get("agent-1", "nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_is_an_upsert() {
        let repo = test_repo().await;
        repo.set("agent-1", "loop_count", &json!(1)).await.unwrap();
        repo.set("agent-1", "loop_count", &json!(2)).await.unwrap();
        assert_eq!(repo.get("agent-1", "loop_count").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn essential_state_reads_in_one_call() {
        let repo = test_repo().await;
        repo.set("agent-1", "loop_count", &json!(5)).await.unwrap();
        repo.set("agent-1", "current_focus", &json!("quarterly plan")).await.unwrap();
        let state = repo.get_essential("agent-1").await.unwrap();
        assert_eq!(state.loop_count, 5);
        assert_eq!(state.current_focus.as_deref(), Some("quarterly plan"));
        assert_eq!(state.error_count, 0);
    }
}
