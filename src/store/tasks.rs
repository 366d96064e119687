//! `tasks` repository (§3, §4.1).

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::task;
use uuid::Uuid;

use crate::error::{AgencyError, Result};

use super::db::Db;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "in_progress" => TaskStatus::InProgress,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "cancelled" => TaskStatus::Cancelled,
            _ => TaskStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: String,
    pub title: String,
    pub description: String,
    pub assigned_to: String,
    pub created_by: String,
    pub status: TaskStatus,
    pub priority: u8,
    pub due_date: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentTask> {
    Ok(AgentTask {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        assigned_to: row.get(3)?,
        created_by: row.get(4)?,
        status: TaskStatus::from_str(&row.get::<_, String>(5)?),
        priority: row.get::<_, i64>(6)? as u8,
        due_date: row
            .get::<_, Option<String>>(7)?
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&chrono::Utc)),
        completed_at: row
            .get::<_, Option<String>>(8)?
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&chrono::Utc)),
        result: row.get(9)?,
        created_at: DateTime::parse_from_rfc3339(&row.get::<_, String>(10)?)
            .map(|d| d.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[derive(Clone)]
pub struct TasksRepo {
    db: Db,
}

impl TasksRepo {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn create(&self, title: &str, description: &str, assigned_to: &str, created_by: &str, priority: u8) -> Result<AgentTask> {
        let task_row = AgentTask {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            description: description.to_string(),
            assigned_to: assigned_to.to_string(),
            created_by: created_by.to_string(),
            status: TaskStatus::Pending,
            priority,
            due_date: None,
            completed_at: None,
            result: None,
            created_at: Utc::now(),
        };
        let db = self.db.clone();
        let t = task_row.clone();
        task::spawn_blocking(move || -> Result<()> {
            let conn = db.connect()?;
            conn.execute(
                "INSERT INTO tasks (id, title, description, assigned_to, created_by, status, priority, due_date, completed_at, result, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, NULL, NULL, ?8)",
                params![t.id, t.title, t.description, t.assigned_to, t.created_by, t.status.as_str(), t.priority, t.created_at.to_rfc3339()],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| AgencyError::Transient(e.to_string()))??;
        Ok(task_row)
    }

    /// Open pending tasks for an agent, sorted by priority descending
    /// (§4.9 step 3). Low-priority items are included here; callers
    /// filter them out when building the prompt (§4.9 step 4).
    pub async fn pending_for_agent(&self, agent_id: &str) -> Result<Vec<AgentTask>> {
        let db = self.db.clone();
        let agent_id = agent_id.to_string();
        task::spawn_blocking(move || -> Result<Vec<AgentTask>> {
            let conn = db.connect()?;
            let mut stmt = conn.prepare(
                "SELECT id, title, description, assigned_to, created_by, status, priority, due_date, completed_at, result, created_at
                 FROM tasks WHERE assigned_to = ?1 AND status IN ('pending', 'in_progress') ORDER BY priority DESC, created_at ASC",
            )?;
            let rows = stmt.query_map(params![agent_id], row_to_task)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
        .map_err(|e| AgencyError::Transient(e.to_string()))?
    }

    pub async fn set_status(&self, id: &str, status: TaskStatus, result: Option<String>) -> Result<()> {
        let db = self.db.clone();
        let id = id.to_string();
        let completed_at = matches!(status, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
            .then(|| Utc::now().to_rfc3339());
        task::spawn_blocking(move || -> Result<()> {
            let conn = db.connect()?;
            conn.execute(
                "UPDATE tasks SET status = ?1, result = ?2, completed_at = ?3 WHERE id = ?4",
                params![status.as_str(), result, completed_at, id],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| AgencyError::Transient(e.to_string()))?
    }

    pub async fn kanban_counts(&self, agent_id: &str) -> Result<std::collections::HashMap<String, i64>> {
        let db = self.db.clone();
        let agent_id = agent_id.to_string();
        task::spawn_blocking(move || -> Result<std::collections::HashMap<String, i64>> {
            let conn = db.connect()?;
            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*) FROM tasks WHERE assigned_to = ?1 GROUP BY status",
            )?;
            let rows = stmt.query_map(params![agent_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
            let mut out = std::collections::HashMap::new();
            for row in rows {
                let (status, count) = row?;
                out.insert(status, count);
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

    #[tokio::test]
    async fn pending_tasks_are_sorted_by_priority_descending() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path().join("test.sqlite3")).await.unwrap();
        std::mem::forget(dir);
        let repo = TasksRepo::new(db);
        repo.create("low", "d", "cmo-1", "ceo-1", 1).await.unwrap();
        repo.create("high", "d", "cmo-1", "ceo-1", 5).await.unwrap();
        let pending = repo.pending_for_agent("cmo-1").await.unwrap();
        assert_eq!(pending[0].title, "high");
        assert_eq!(pending[1].title, "low");
    }

    #[tokio::test]
    async fn completing_a_task_stamps_completed_at() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path().join("test.sqlite3")).await.unwrap();
        std::mem::forget(dir);
        let repo = TasksRepo::new(db);
        let task_row = repo.create("ship it", "d", "cto-1", "ceo-1", 3).await.unwrap();
        repo.set_status(&task_row.id, TaskStatus::Completed, Some("done".to_string())).await.unwrap();
        let remaining = repo.pending_for_agent("cto-1").await.unwrap();
        assert!(remaining.is_empty());
    }
}
