//! `decisions` repository (§3, §4.1, §4.7).

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::task;
use uuid::Uuid;

use crate::agent::AgentType;
use crate::error::{AgencyError, Result};

use super::db::Db;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Operational,
    Minor,
    Major,
    Critical,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Operational => "operational",
            Tier::Minor => "minor",
            Tier::Major => "major",
            Tier::Critical => "critical",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "minor" => Tier::Minor,
            "major" => Tier::Major,
            "critical" => Tier::Critical,
            _ => Tier::Operational,
        }
    }

    /// Per §4.7 table.
    pub fn requires_ceo(&self) -> bool {
        !matches!(self, Tier::Operational)
    }

    pub fn requires_dao(&self) -> bool {
        matches!(self, Tier::Major | Tier::Critical)
    }

    pub fn requires_human(&self) -> bool {
        matches!(self, Tier::Critical)
    }

    pub fn auto_approve_on_timeout(&self) -> bool {
        matches!(self, Tier::Operational | Tier::Minor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionStatus {
    Pending,
    Approved,
    Rejected,
    Vetoed,
    Escalated,
}

impl DecisionStatus {
    fn as_str(&self) -> &'static str {
        match self {
            DecisionStatus::Pending => "pending",
            DecisionStatus::Approved => "approved",
            DecisionStatus::Rejected => "rejected",
            DecisionStatus::Vetoed => "vetoed",
            DecisionStatus::Escalated => "escalated",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "approved" => DecisionStatus::Approved,
            "rejected" => DecisionStatus::Rejected,
            "vetoed" => DecisionStatus::Vetoed,
            "escalated" => DecisionStatus::Escalated,
            _ => DecisionStatus::Pending,
        }
    }

    /// Monotone transition check (§3 invariant (b)).
    pub fn can_transition_to(&self, next: DecisionStatus) -> bool {
        use DecisionStatus::*;
        match self {
            Pending => matches!(next, Approved | Rejected | Vetoed | Escalated),
            Escalated => matches!(next, Approved | Rejected),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vote {
    Approve,
    Veto,
    Abstain,
}

impl Vote {
    fn as_str(&self) -> &'static str {
        match self {
            Vote::Approve => "approve",
            Vote::Veto => "veto",
            Vote::Abstain => "abstain",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "approve" => Some(Vote::Approve),
            "veto" => Some(Vote::Veto),
            "abstain" => Some(Vote::Abstain),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub title: String,
    pub description: String,
    pub proposed_by: String,
    pub tier: Tier,
    pub status: DecisionStatus,
    pub veto_round: u32,
    pub ceo_vote: Option<Vote>,
    pub dao_vote: Option<Vote>,
    pub c_level_votes: std::collections::HashMap<String, Vote>,
    pub human_decision: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

fn row_to_decision(row: &rusqlite::Row<'_>) -> rusqlite::Result<Decision> {
    let c_level_raw: String = row.get(9)?;
    let c_level_votes: std::collections::HashMap<String, String> =
        serde_json::from_str(&c_level_raw).unwrap_or_default();
    Ok(Decision {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        proposed_by: row.get(3)?,
        tier: Tier::from_str(&row.get::<_, String>(4)?),
        status: DecisionStatus::from_str(&row.get::<_, String>(5)?),
        veto_round: row.get::<_, i64>(6)? as u32,
        ceo_vote: row.get::<_, Option<String>>(7)?.and_then(|s| Vote::from_str(&s)),
        dao_vote: row.get::<_, Option<String>>(8)?.and_then(|s| Vote::from_str(&s)),
        c_level_votes: c_level_votes
            .into_iter()
            .filter_map(|(k, v)| Vote::from_str(&v).map(|v| (k, v)))
            .collect(),
        human_decision: row.get(10)?,
        resolved_at: row
            .get::<_, Option<String>>(11)?
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc)),
        created_at: DateTime::parse_from_rfc3339(&row.get::<_, String>(12)?)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[derive(Clone)]
pub struct DecisionsRepo {
    db: Db,
}

impl DecisionsRepo {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn propose(&self, title: &str, description: &str, proposed_by: &str, tier: Tier) -> Result<Decision> {
        let decision = Decision {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            description: description.to_string(),
            proposed_by: proposed_by.to_string(),
            tier,
            status: DecisionStatus::Pending,
            veto_round: 0,
            ceo_vote: None,
            dao_vote: None,
            c_level_votes: Default::default(),
            human_decision: None,
            resolved_at: None,
            created_at: Utc::now(),
        };
        let db = self.db.clone();
        let d = decision.clone();
        task::spawn_blocking(move || -> Result<()> {
            let conn = db.connect()?;
            conn.execute(
                "INSERT INTO decisions (id, title, description, proposed_by, tier, status, veto_round, ceo_vote, dao_vote, c_level_votes, human_decision, resolved_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, NULL, NULL, '{}', NULL, NULL, ?7)",
                params![d.id, d.title, d.description, d.proposed_by, d.tier.as_str(), d.status.as_str(), d.created_at.to_rfc3339()],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| AgencyError::Transient(e.to_string()))??;
        Ok(decision)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Decision>> {
        let db = self.db.clone();
        let id = id.to_string();
        task::spawn_blocking(move || -> Result<Option<Decision>> {
            let conn = db.connect()?;
            conn.query_row(
                "SELECT id, title, description, proposed_by, tier, status, veto_round, ceo_vote, dao_vote, c_level_votes, human_decision, resolved_at, created_at
                 FROM decisions WHERE id = ?1",
                params![id],
                row_to_decision,
            )
            .optional()
            .map_err(AgencyError::from)
        })
        .await
        .map_err(|e| AgencyError::Transient(e.to_string()))?
    }

    /// Records one voter's ballot and persists the (possibly unchanged)
    /// vote/status fields in one transaction. Returns the updated row.
    /// A vote on a resolved decision is a no-op (§7).
    pub async fn apply_vote(
        &self,
        id: &str,
        voter: Voter,
        vote: Vote,
        max_veto_rounds: u32,
    ) -> Result<Option<Decision>> {
        let db = self.db.clone();
        let id = id.to_string();
        task::spawn_blocking(move || -> Result<Option<Decision>> {
            let mut conn = db.connect()?;
            let tx = conn.transaction()?;
            let mut decision = match tx
                .query_row(
                    "SELECT id, title, description, proposed_by, tier, status, veto_round, ceo_vote, dao_vote, c_level_votes, human_decision, resolved_at, created_at
                     FROM decisions WHERE id = ?1",
                    params![id],
                    row_to_decision,
                )
                .optional()?
            {
                Some(d) => d,
                None => return Ok(None),
            };

            if decision.status != DecisionStatus::Pending {
                return Ok(Some(decision));
            }

            match voter {
                Voter::Ceo => decision.ceo_vote = Some(vote),
                Voter::Dao => decision.dao_vote = Some(vote),
                Voter::CLevel(agent_type) => {
                    decision.c_level_votes.insert(agent_type.as_str().to_string(), vote);
                }
            }

            let tier = decision.tier;
            let any_required_veto = (tier.requires_ceo() && decision.ceo_vote == Some(Vote::Veto))
                || (tier.requires_dao() && decision.dao_vote == Some(Vote::Veto));

            if any_required_veto {
                decision.veto_round += 1;
                if decision.veto_round >= max_veto_rounds {
                    decision.status = DecisionStatus::Vetoed;
                    decision.resolved_at = Some(Utc::now());
                } else {
                    decision.ceo_vote = None;
                    decision.dao_vote = None;
                }
            } else {
                let ceo_ok = !tier.requires_ceo() || matches!(decision.ceo_vote, Some(Vote::Approve) | Some(Vote::Abstain));
                let dao_ok = !tier.requires_dao() || matches!(decision.dao_vote, Some(Vote::Approve) | Some(Vote::Abstain));
                if ceo_ok && dao_ok {
                    decision.status = DecisionStatus::Approved;
                    decision.resolved_at = Some(Utc::now());
                }
            }

            let c_level_json = serde_json::to_string(
                &decision
                    .c_level_votes
                    .iter()
                    .map(|(k, v)| (k.clone(), v.as_str().to_string()))
                    .collect::<std::collections::HashMap<_, _>>(),
            )?;

            tx.execute(
                "UPDATE decisions SET status = ?1, veto_round = ?2, ceo_vote = ?3, dao_vote = ?4, c_level_votes = ?5, resolved_at = ?6 WHERE id = ?7",
                params![
                    decision.status.as_str(),
                    decision.veto_round,
                    decision.ceo_vote.map(|v| v.as_str().to_string()),
                    decision.dao_vote.map(|v| v.as_str().to_string()),
                    c_level_json,
                    decision.resolved_at.map(|d| d.to_rfc3339()),
                    decision.id,
                ],
            )?;
            tx.commit()?;
            Ok(Some(decision))
        })
        .await
        .map_err(|e| AgencyError::Transient(e.to_string()))?
    }

    /// All decisions currently awaiting resolution, oldest first — the
    /// working set for the scheduler's timeout-sweep job (§4.7 step 4).
    pub async fn pending(&self) -> Result<Vec<Decision>> {
        let db = self.db.clone();
        task::spawn_blocking(move || -> Result<Vec<Decision>> {
            let conn = db.connect()?;
            let mut stmt = conn.prepare(
                "SELECT id, title, description, proposed_by, tier, status, veto_round, ceo_vote, dao_vote, c_level_votes, human_decision, resolved_at, created_at
                 FROM decisions WHERE status = 'pending' ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map([], row_to_decision)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
        .map_err(|e| AgencyError::Transient(e.to_string()))?
    }

    /// Resolves a pending/escalated decision to a terminal status,
    /// enforcing monotonicity (§3 invariant (b)).
    pub async fn resolve(&self, id: &str, status: DecisionStatus) -> Result<()> {
        let db = self.db.clone();
        let id = id.to_string();
        task::spawn_blocking(move || -> Result<()> {
            let mut conn = db.connect()?;
            let tx = conn.transaction()?;
            let current: String = tx.query_row("SELECT status FROM decisions WHERE id = ?1", params![id], |r| r.get(0))?;
            let current = DecisionStatus::from_str(&current);
            if !current.can_transition_to(status) {
                return Err(AgencyError::Fatal(format!(
                    "illegal decision transition {current:?} -> {status:?}"
                )));
            }
            tx.execute(
                "UPDATE decisions SET status = ?1, resolved_at = ?2 WHERE id = ?3",
                params![status.as_str(), Utc::now().to_rfc3339(), id],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
        .map_err(|e| AgencyError::Transient(e.to_string()))?
    }

}

#[derive(Debug, Clone, Copy)]
pub enum Voter {
    Ceo,
    Dao,
    CLevel(AgentType),
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_repo() -> DecisionsRepo {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path().join("test.sqlite3")).await.unwrap();
        std::mem::forget(dir);
        DecisionsRepo::new(db)
    }

    #[tokio::test]
    async fn minor_decision_approves_on_ceo_approve() {
        let repo = test_repo().await;
        let decision = repo.propose("Ship feature", "desc", "cmo", Tier::Minor).await.unwrap();
        let updated = repo.apply_vote(&decision.id, Voter::Ceo, Vote::Approve, 3).await.unwrap().unwrap();
        assert_eq!(updated.status, DecisionStatus::Approved);
    }

    #[tokio::test]
    async fn veto_round_cap_vetoes_after_max_rounds() {
        let repo = test_repo().await;
        let decision = repo.propose("Risky move", "desc", "cto", Tier::Major).await.unwrap();
        for _ in 0..3 {
            repo.apply_vote(&decision.id, Voter::Ceo, Vote::Veto, 3).await.unwrap();
        }
        let final_state = repo.get(&decision.id).await.unwrap().unwrap();
        assert_eq!(final_state.status, DecisionStatus::Vetoed);
        assert_eq!(final_state.veto_round, 3);

        let after = repo.apply_vote(&decision.id, Voter::Ceo, Vote::Approve, 3).await.unwrap().unwrap();
        assert_eq!(after.status, DecisionStatus::Vetoed);
    }

    #[tokio::test]
    async fn resolve_rejects_illegal_backward_transition() {
        let repo = test_repo().await;
        let decision = repo.propose("Op task", "desc", "coo", Tier::Operational).await.unwrap();
        repo.resolve(&decision.id, DecisionStatus::Approved).await.unwrap();
        let result = repo.resolve(&decision.id, DecisionStatus::Pending).await;
        assert!(result.is_err());
    }
}
