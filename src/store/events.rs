//! `events` repository: append-only log (§3, §4.1 invariant (d)).

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task;
use uuid::Uuid;

use crate::error::{AgencyError, Result};

use super::db::Db;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgencyEventRecord {
    pub id: String,
    pub event_type: String,
    pub source_agent: Option<String>,
    pub target_agent: Option<String>,
    pub payload: Value,
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct EventsRepo {
    db: Db,
}

impl EventsRepo {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Appends an event. There is no update or delete path: the table is
    /// append-only by construction (§3 invariant (d)).
    pub async fn append(
        &self,
        event_type: &str,
        source_agent: Option<&str>,
        target_agent: Option<&str>,
        payload: Value,
        correlation_id: Option<&str>,
    ) -> Result<String> {
        let db = self.db.clone();
        let id = Uuid::new_v4().to_string();
        let event_type = event_type.to_string();
        let source_agent = source_agent.map(str::to_string);
        let target_agent = target_agent.map(str::to_string);
        let correlation_id = correlation_id.map(str::to_string);
        let payload_json = serde_json::to_string(&payload)?;
        let created_at = Utc::now();
        let id_for_blocking = id.clone();
        task::spawn_blocking(move || -> Result<()> {
            let conn = db.connect()?;
            conn.execute(
                "INSERT INTO events (id, event_type, source_agent, target_agent, payload, correlation_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![id_for_blocking, event_type, source_agent, target_agent, payload_json, correlation_id, created_at.to_rfc3339()],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| AgencyError::Transient(e.to_string()))??;
        Ok(id)
    }

    /// Reconstructs the full chain of events sharing a correlation id
    /// (decision proposed -> voted -> resolved, §4.7).
    pub async fn by_correlation(&self, correlation_id: &str) -> Result<Vec<AgencyEventRecord>> {
        let db = self.db.clone();
        let correlation_id = correlation_id.to_string();
        task::spawn_blocking(move || -> Result<Vec<AgencyEventRecord>> {
            let conn = db.connect()?;
            let mut stmt = conn.prepare(
                "SELECT id, event_type, source_agent, target_agent, payload, correlation_id, created_at
                 FROM events WHERE correlation_id = ?1 ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map(params![correlation_id], |row| {
                Ok(AgencyEventRecord {
                    id: row.get(0)?,
                    event_type: row.get(1)?,
                    source_agent: row.get(2)?,
                    target_agent: row.get(3)?,
                    payload: serde_json::from_str(&row.get::<_, String>(4)?).unwrap_or(Value::Null),
                    correlation_id: row.get(5)?,
                    created_at: DateTime::parse_from_rfc3339(&row.get::<_, String>(6)?)
                        .map(|d| d.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
        .map_err(|e| AgencyError::Transient(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn events_with_shared_correlation_id_reconstruct_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path().join("test.sqlite3")).await.unwrap();
        std::mem::forget(dir);
        let repo = EventsRepo::new(db);
        repo.append("decision_proposed", Some("cto"), None, json!({}), Some("corr-1")).await.unwrap();
        repo.append("decision_voted", Some("ceo"), None, json!({}), Some("corr-1")).await.unwrap();
        let chain = repo.by_correlation("corr-1").await.unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].event_type, "decision_proposed");
        assert_eq!(chain[1].event_type, "decision_voted");
    }
}
