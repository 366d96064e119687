//! `agentHistory` repository: append-only log with optional embedding
//! and cosine k-NN search (§3, §4.1, §9 "RAG embeddings").

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task;
use uuid::Uuid;

use crate::error::{AgencyError, Result};

use super::db::Db;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Decision,
    Task,
    Communication,
    Error,
    Idea,
}

impl ActionType {
    fn as_str(&self) -> &'static str {
        match self {
            ActionType::Decision => "decision",
            ActionType::Task => "task",
            ActionType::Communication => "communication",
            ActionType::Error => "error",
            ActionType::Idea => "idea",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "decision" => ActionType::Decision,
            "task" => ActionType::Task,
            "communication" => ActionType::Communication,
            "error" => ActionType::Error,
            _ => ActionType::Idea,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub agent_id: String,
    pub action_type: ActionType,
    pub summary: String,
    pub details: Value,
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

/// Embeds free text into a fixed-size vector so history entries can be
/// retrieved by semantic similarity. Embedder-agnostic by design;
/// [`NullEmbedder`] is the default when none is wired, and kNN search
/// then falls back to recency ordering.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Option<Vec<f32>>;
}

/// Default no-op embedder: every entry is stored without a vector.
pub struct NullEmbedder;

#[async_trait]
impl Embedder for NullEmbedder {
    async fn embed(&self, _text: &str) -> Option<Vec<f32>> {
        None
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[derive(Clone)]
pub struct AgentHistoryRepo {
    db: Db,
}

impl AgentHistoryRepo {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn append(
        &self,
        agent_id: &str,
        action_type: ActionType,
        summary: &str,
        details: Value,
        embedding: Option<Vec<f32>>,
    ) -> Result<String> {
        let db = self.db.clone();
        let id = Uuid::new_v4().to_string();
        let agent_id = agent_id.to_string();
        let summary = summary.to_string();
        let details_json = serde_json::to_string(&details)?;
        let embedding_json = embedding.as_ref().map(|e| serde_json::to_string(e)).transpose()?;
        let created_at = Utc::now();
        let id_for_blocking = id.clone();
        task::spawn_blocking(move || -> Result<()> {
            let conn = db.connect()?;
            conn.execute(
                "INSERT INTO agent_history (id, agent_id, action_type, summary, details, embedding, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id_for_blocking,
                    agent_id,
                    action_type.as_str(),
                    summary,
                    details_json,
                    embedding_json,
                    created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| AgencyError::Transient(e.to_string()))??;
        Ok(id)
    }

    /// `search(agentId, queryEmbedding, k)`: top-k by cosine similarity
    /// restricted to the agent (§4.1). Entries without an embedding are
    /// excluded from the similarity ranking; if `query_embedding` is
    /// `None` (no embedder wired, §9) this falls back to recency order.
    pub async fn search(
        &self,
        agent_id: &str,
        query_embedding: Option<&[f32]>,
        k: usize,
    ) -> Result<Vec<HistoryEntry>> {
        let db = self.db.clone();
        let agent_id = agent_id.to_string();
        let query_embedding = query_embedding.map(|e| e.to_vec());
        task::spawn_blocking(move || -> Result<Vec<HistoryEntry>> {
            let conn = db.connect()?;
            let mut stmt = conn.prepare(
                "SELECT id, agent_id, action_type, summary, details, embedding, created_at
                 FROM agent_history WHERE agent_id = ?1 ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map(params![agent_id], |row| {
                let embedding_raw: Option<String> = row.get(5)?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    embedding_raw,
                    row.get::<_, String>(6)?,
                ))
            })?;
            let mut entries = Vec::new();
            for row in rows {
                let (id, agent_id, action_type, summary, details, embedding_raw, created_at) = row?;
                let embedding: Option<Vec<f32>> = embedding_raw
                    .as_deref()
                    .and_then(|s| serde_json::from_str(s).ok());
                entries.push(HistoryEntry {
                    id,
                    agent_id,
                    action_type: ActionType::from_str(&action_type),
                    summary,
                    details: serde_json::from_str(&details).unwrap_or(Value::Null),
                    embedding,
                    created_at: DateTime::parse_from_rfc3339(&created_at)
                        .map(|d| d.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                });
            }

            match query_embedding {
                Some(query) => {
                    let mut scored: Vec<(f32, HistoryEntry)> = entries
                        .into_iter()
                        .filter_map(|e| {
                            let score = e.embedding.as_ref().map(|v| cosine_similarity(v, &query));
                            score.map(|s| (s, e))
                        })
                        .collect();
                    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
                    Ok(scored.into_iter().take(k).map(|(_, e)| e).collect())
                }
                None => Ok(entries.into_iter().take(k).collect()),
            }
        })
        .await
        .map_err(|e| AgencyError::Transient(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_repo() -> AgentHistoryRepo {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path().join("test.sqlite3")).await.unwrap();
        std::mem::forget(dir);
        AgentHistoryRepo::new(db)
    }

    #[tokio::test]
    async fn search_without_embedding_falls_back_to_recency() {
        let repo = test_repo().await;
        repo.append("agent-1", ActionType::Idea, "first", json!({}), None).await.unwrap();
        repo.append("agent-1", ActionType::Idea, "second", json!({}), None).await.unwrap();
        let results = repo.search("agent-1", None, 10).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].summary, "second");
    }

    #[tokio::test]
    async fn search_with_embedding_ranks_by_cosine_similarity() {
        let repo = test_repo().await;
        repo.append("agent-1", ActionType::Idea, "matches", json!({}), Some(vec![1.0, 0.0]))
            .await
            .unwrap();
        repo.append("agent-1", ActionType::Idea, "orthogonal", json!({}), Some(vec![0.0, 1.0]))
            .await
            .unwrap();
        let results = repo.search("agent-1", Some(&[1.0, 0.0]), 1).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].summary, "matches");
    }
}
