//! `escalations` repository (§3, §4.7).

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::task;
use uuid::Uuid;

use crate::error::{AgencyError, Result};

use super::db::Db;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationStatus {
    Pending,
    Responded,
    Timeout,
}

impl EscalationStatus {
    fn as_str(&self) -> &'static str {
        match self {
            EscalationStatus::Pending => "pending",
            EscalationStatus::Responded => "responded",
            EscalationStatus::Timeout => "timeout",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "responded" => EscalationStatus::Responded,
            "timeout" => EscalationStatus::Timeout,
            _ => EscalationStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub id: String,
    pub decision_id: String,
    pub reason: String,
    pub channels_notified: Vec<String>,
    pub human_response: Option<String>,
    pub responded_at: Option<DateTime<Utc>>,
    pub status: EscalationStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct EscalationsRepo {
    db: Db,
}

impl EscalationsRepo {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn create(&self, decision_id: &str, reason: &str, channels_notified: &[String]) -> Result<Escalation> {
        let escalation = Escalation {
            id: Uuid::new_v4().to_string(),
            decision_id: decision_id.to_string(),
            reason: reason.to_string(),
            channels_notified: channels_notified.to_vec(),
            human_response: None,
            responded_at: None,
            status: EscalationStatus::Pending,
            created_at: Utc::now(),
        };
        let db = self.db.clone();
        let e = escalation.clone();
        task::spawn_blocking(move || -> Result<()> {
            let conn = db.connect()?;
            conn.execute(
                "INSERT INTO escalations (id, decision_id, reason, channels_notified, human_response, responded_at, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, NULL, NULL, ?5, ?6)",
                params![
                    e.id,
                    e.decision_id,
                    e.reason,
                    serde_json::to_string(&e.channels_notified)?,
                    e.status.as_str(),
                    e.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| AgencyError::Transient(e.to_string()))??;
        Ok(escalation)
    }

    /// Records a human response. Invariant (c) from §3: `respondedAt`
    /// set implies `status=responded` — enforced by construction here,
    /// since both fields are written in the same statement.
    pub async fn record_response(&self, id: &str, response: &str) -> Result<()> {
        let db = self.db.clone();
        let id = id.to_string();
        let response = response.to_string();
        task::spawn_blocking(move || -> Result<()> {
            let conn = db.connect()?;
            conn.execute(
                "UPDATE escalations SET human_response = ?1, responded_at = ?2, status = 'responded' WHERE id = ?3",
                params![response, Utc::now().to_rfc3339(), id],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| AgencyError::Transient(e.to_string()))?
    }

    pub async fn mark_timeout(&self, id: &str) -> Result<()> {
        let db = self.db.clone();
        let id = id.to_string();
        task::spawn_blocking(move || -> Result<()> {
            let conn = db.connect()?;
            conn.execute(
                "UPDATE escalations SET status = 'timeout' WHERE id = ?1 AND status = 'pending'",
                params![id],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| AgencyError::Transient(e.to_string()))?
    }

    pub async fn get(&self, id: &str) -> Result<Option<Escalation>> {
        let db = self.db.clone();
        let id = id.to_string();
        task::spawn_blocking(move || -> Result<Option<Escalation>> {
            let conn = db.connect()?;
            conn.query_row(
                "SELECT id, decision_id, reason, channels_notified, human_response, responded_at, status, created_at FROM escalations WHERE id = ?1",
                params![id],
                |row| {
                    let channels_raw: String = row.get(3)?;
                    Ok(Escalation {
                        id: row.get(0)?,
                        decision_id: row.get(1)?,
                        reason: row.get(2)?,
                        channels_notified: serde_json::from_str(&channels_raw).unwrap_or_default(),
                        human_response: row.get(4)?,
                        responded_at: row
                            .get::<_, Option<String>>(5)?
                            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                            .map(|d| d.with_timezone(&Utc)),
                        status: EscalationStatus::from_str(&row.get::<_, String>(6)?),
                        created_at: DateTime::parse_from_rfc3339(&row.get::<_, String>(7)?)
                            .map(|d| d.with_timezone(&Utc))
                            .unwrap_or_else(|_| Utc::now()),
                    })
                },
            )
            .optional()
            .map_err(AgencyError::from)
        })
        .await
        .map_err(|e| AgencyError::Transient(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn response_sets_responded_at_and_status_together() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path().join("test.sqlite3")).await.unwrap();
        std::mem::forget(dir);
        let repo = EscalationsRepo::new(db);
        let escalation = repo
            .create("decision-1", "no human vote within 48h", &["telegram".to_string(), "email".to_string(), "dashboard".to_string()])
            .await
            .unwrap();
        repo.record_response(&escalation.id, "approved").await.unwrap();
        let fetched = repo.get(&escalation.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, EscalationStatus::Responded);
        assert!(fetched.responded_at.is_some());
    }
}
