//! `agents` repository (§3, §4.1).

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use tokio::task;

use crate::agent::{Agent, AgentStatus, AgentType};
use crate::error::{AgencyError, Result};

use super::db::Db;

#[derive(Clone)]
pub struct AgentsRepo {
    db: Db,
}

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
    let agent_type_str: String = row.get(1)?;
    let status_str: String = row.get(5)?;
    let heartbeat_str: Option<String> = row.get(6)?;
    Ok(Agent {
        id: row.get(0)?,
        agent_type: AgentType::from_str_loose(&agent_type_str).unwrap_or(AgentType::Ceo),
        name: row.get(2)?,
        profile_ref: row.get(3)?,
        loop_interval_secs: row.get::<_, i64>(4)? as u64,
        status: status_from_str(&status_str),
        last_heartbeat: heartbeat_str
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc)),
        container_handle: row.get(7)?,
    })
}

fn status_from_str(s: &str) -> AgentStatus {
    match s {
        "starting" => AgentStatus::Starting,
        "active" => AgentStatus::Active,
        "stopping" => AgentStatus::Stopping,
        "error" => AgentStatus::Error,
        _ => AgentStatus::Inactive,
    }
}

fn status_to_str(s: AgentStatus) -> &'static str {
    match s {
        AgentStatus::Inactive => "inactive",
        AgentStatus::Starting => "starting",
        AgentStatus::Active => "active",
        AgentStatus::Stopping => "stopping",
        AgentStatus::Error => "error",
    }
}

impl AgentsRepo {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Inserts a new agent row. `agent_type` is unique (§3); a duplicate
    /// insert surfaces as a store error.
    pub async fn create(&self, agent: &Agent) -> Result<()> {
        let db = self.db.clone();
        let agent = agent.clone();
        task::spawn_blocking(move || -> Result<()> {
            let conn = db.connect()?;
            conn.execute(
                "INSERT INTO agents (id, agent_type, name, profile_ref, loop_interval_secs, status, last_heartbeat, container_handle)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    agent.id,
                    agent.agent_type.as_str(),
                    agent.name,
                    agent.profile_ref,
                    agent.loop_interval_secs as i64,
                    status_to_str(agent.status),
                    agent.last_heartbeat.map(|d| d.to_rfc3339()),
                    agent.container_handle,
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| AgencyError::Transient(e.to_string()))?
    }

    pub async fn get_by_type(&self, agent_type: AgentType) -> Result<Option<Agent>> {
        let db = self.db.clone();
        let type_str = agent_type.as_str();
        task::spawn_blocking(move || -> Result<Option<Agent>> {
            let conn = db.connect()?;
            let agent = conn
                .query_row(
                    "SELECT id, agent_type, name, profile_ref, loop_interval_secs, status, last_heartbeat, container_handle
                     FROM agents WHERE agent_type = ?1",
                    params![type_str],
                    row_to_agent,
                )
                .optional()?;
            Ok(agent)
        })
        .await
        .map_err(|e| AgencyError::Transient(e.to_string()))?
    }

    pub async fn list(&self) -> Result<Vec<Agent>> {
        let db = self.db.clone();
        task::spawn_blocking(move || -> Result<Vec<Agent>> {
            let conn = db.connect()?;
            let mut stmt = conn.prepare(
                "SELECT id, agent_type, name, profile_ref, loop_interval_secs, status, last_heartbeat, container_handle FROM agents",
            )?;
            let rows = stmt.query_map([], row_to_agent)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
        .map_err(|e| AgencyError::Transient(e.to_string()))?
    }

    /// Applies a status transition, rejecting illegal ones per the
    /// state machine documented on [`AgentStatus::can_transition_to`].
    pub async fn set_status(&self, agent_id: &str, from: AgentStatus, to: AgentStatus) -> Result<()> {
        if !from.can_transition_to(to) {
            return Err(AgencyError::Fatal(format!(
                "illegal agent status transition {from:?} -> {to:?}"
            )));
        }
        let db = self.db.clone();
        let id = agent_id.to_string();
        task::spawn_blocking(move || -> Result<()> {
            let conn = db.connect()?;
            conn.execute(
                "UPDATE agents SET status = ?1 WHERE id = ?2",
                params![status_to_str(to), id],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| AgencyError::Transient(e.to_string()))?
    }

    /// Records a heartbeat timestamp, mutated only by the scheduler's
    /// heartbeat updater (§5).
    pub async fn record_heartbeat(&self, agent_id: &str, at: DateTime<Utc>) -> Result<()> {
        let db = self.db.clone();
        let id = agent_id.to_string();
        task::spawn_blocking(move || -> Result<()> {
            let conn = db.connect()?;
            conn.execute(
                "UPDATE agents SET last_heartbeat = ?1 WHERE id = ?2",
                params![at.to_rfc3339(), id],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| AgencyError::Transient(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Db {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path().join("test.sqlite3")).await.unwrap();
        std::mem::forget(dir);
        db
    }

    #[tokio::test]
    async fn create_and_fetch_roundtrip() {
        let repo = AgentsRepo::new(test_db().await);
        let agent = Agent::new(AgentType::Cmo, "Marketing", "profiles/cmo.md");
        repo.create(&agent).await.unwrap();
        let fetched = repo.get_by_type(AgentType::Cmo).await.unwrap().unwrap();
        assert_eq!(fetched.id, agent.id);
        assert_eq!(fetched.status, AgentStatus::Inactive);
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let repo = AgentsRepo::new(test_db().await);
        let agent = Agent::new(AgentType::Cto, "Engineering", "profiles/cto.md");
        repo.create(&agent).await.unwrap();
        let result = repo.set_status(&agent.id, AgentStatus::Inactive, AgentStatus::Active).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn legal_transition_updates_status() {
        let repo = AgentsRepo::new(test_db().await);
        let agent = Agent::new(AgentType::Ceo, "Chief", "profiles/ceo.md");
        repo.create(&agent).await.unwrap();
        repo.set_status(&agent.id, AgentStatus::Inactive, AgentStatus::Starting).await.unwrap();
        let fetched = repo.get_by_type(AgentType::Ceo).await.unwrap().unwrap();
        assert_eq!(fetched.status, AgentStatus::Starting);
    }
}
