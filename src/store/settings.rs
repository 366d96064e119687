//! `systemSettings` repository: `(category, key)` unique, runtime-editable
//! (§6, §9). The durable source of truth the daemon entrypoint polls on
//! a fixed interval to push fresh tunables into the owning component.

use rusqlite::{params, OptionalExtension};
use tokio::task;

use crate::error::{AgencyError, Result};

use super::db::Db;

#[derive(Clone)]
pub struct SettingsRepo {
    db: Db,
}

impl SettingsRepo {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn get(&self, category: &str, key: &str) -> Result<Option<String>> {
        let db = self.db.clone();
        let category = category.to_string();
        let key = key.to_string();
        task::spawn_blocking(move || -> Result<Option<String>> {
            let conn = db.connect()?;
            conn.query_row(
                "SELECT value FROM system_settings WHERE category = ?1 AND key = ?2",
                params![category, key],
                |row| row.get(0),
            )
            .optional()
            .map_err(AgencyError::from)
        })
        .await
        .map_err(|e| AgencyError::Transient(e.to_string()))?
    }

    pub async fn set(&self, category: &str, key: &str, value: &str) -> Result<()> {
        let db = self.db.clone();
        let category = category.to_string();
        let key = key.to_string();
        let value = value.to_string();
        task::spawn_blocking(move || -> Result<()> {
            let conn = db.connect()?;
            conn.execute(
                "INSERT INTO system_settings (category, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(category, key) DO UPDATE SET value = excluded.value",
                params![category, key, value],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| AgencyError::Transient(e.to_string()))?
    }

    pub async fn list_category(&self, category: &str) -> Result<Vec<(String, String)>> {
        let db = self.db.clone();
        let category = category.to_string();
        task::spawn_blocking(move || -> Result<Vec<(String, String)>> {
            let conn = db.connect()?;
            let mut stmt = conn.prepare("SELECT key, value FROM system_settings WHERE category = ?1")?;
            let rows = stmt.query_map(params![category], |row| Ok((row.get(0)?, row.get(1)?)))?;
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

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path().join("test.sqlite3")).await.unwrap();
        std::mem::forget(dir);
        let repo = SettingsRepo::new(db);
        repo.set("llm", "routing_strategy", "gemini-prefer").await.unwrap();
        assert_eq!(repo.get("llm", "routing_strategy").await.unwrap(), Some("gemini-prefer".to_string()));
    }
}
