//! Decision Engine (C7): the tiered voting state machine (§4.7).
//!
//! No prior decision protocol existed for this; grounded loosely in
//! `orchestrator::governance`'s verdict/gate vocabulary (pass/fail/abstain,
//! green/yellow/red) generalized here into `approve/veto/abstain` over a
//! mutable per-decision row instead of a static audit report.

pub mod notify;
pub mod pr_gate;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::info;

use crate::bus::{channels, Bus, Message, MessageType, Priority, Recipient};
use crate::config::{DecisionTimeouts, EscalationTimeouts};
use crate::error::Result;
use crate::store::decisions::{Decision, DecisionStatus, Tier, Vote, Voter};
use crate::store::Store;
use notify::HumanNotifier;

const HUMAN_CHANNELS: [&str; 3] = ["telegram", "email", "dashboard"];

pub struct DecisionEngine {
    store: Store,
    bus: Arc<Bus>,
    max_veto_rounds: u32,
    decision_timeouts: RwLock<DecisionTimeouts>,
    #[allow(dead_code)]
    escalation_timeouts: RwLock<EscalationTimeouts>,
    notifier: Option<Arc<dyn HumanNotifier>>,
}

impl DecisionEngine {
    pub fn new(store: Store, bus: Arc<Bus>, max_veto_rounds: u32, decision_timeouts: DecisionTimeouts, escalation_timeouts: EscalationTimeouts) -> Self {
        Self {
            store,
            bus,
            max_veto_rounds,
            decision_timeouts: RwLock::new(decision_timeouts),
            escalation_timeouts: RwLock::new(escalation_timeouts),
            notifier: None,
        }
    }

    /// Replaces the per-tier decision timeouts in place (§6:
    /// `decisions.timeout_<tier>` changeable at runtime without a
    /// process restart). Takes effect on the next `sweep_timeouts` tick.
    pub fn set_decision_timeouts(&self, timeouts: DecisionTimeouts) {
        *self.decision_timeouts.write().expect("decision timeouts lock poisoned") = timeouts;
    }

    /// Replaces the per-severity escalation timeouts in place (§6:
    /// `escalation.timeout_<severity>`).
    pub fn set_escalation_timeouts(&self, timeouts: EscalationTimeouts) {
        *self.escalation_timeouts.write().expect("escalation timeouts lock poisoned") = timeouts;
    }

    /// Attaches a human-channel notifier (e.g. [`notify::TelegramNotifier`])
    /// that `escalate()` will use to actually send the escalation message
    /// instead of only recording it.
    pub fn with_notifier(mut self, notifier: Arc<dyn HumanNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Step 1 of §4.7's protocol: insert the row, emit `decision_proposed`.
    pub async fn propose(&self, title: &str, description: &str, proposed_by: &str, tier: Tier) -> Result<Decision> {
        let decision = self.store.decisions.propose(title, description, proposed_by, tier).await?;
        self.store
            .events
            .append(
                "decision_proposed",
                Some(proposed_by),
                None,
                json!({ "decision_id": decision.id, "tier": tier.as_str() }),
                Some(&decision.id),
            )
            .await?;
        self.bus
            .publish(
                channels::ORCHESTRATOR,
                Message::new(
                    MessageType::Decision,
                    proposed_by,
                    Recipient::Head,
                    json!({ "decision_id": decision.id, "title": title }),
                    Priority::Normal,
                )
                .with_correlation_id(decision.id.clone()),
            )
            .await;
        Ok(decision)
    }

    /// Steps 2-3 of §4.7: apply a ballot, re-evaluate, log every
    /// transition under the decision's correlation id.
    pub async fn vote(&self, decision_id: &str, voter: Voter, vote: Vote) -> Result<Option<Decision>> {
        let before_status = self.store.decisions.get(decision_id).await?.map(|d| d.status);
        let updated = self
            .store
            .decisions
            .apply_vote(decision_id, voter, vote, self.max_veto_rounds)
            .await?;

        let Some(decision) = updated else {
            return Ok(None);
        };

        self.store
            .events
            .append(
                "decision_voted",
                None,
                None,
                json!({ "decision_id": decision.id, "vote": format!("{vote:?}") }),
                Some(&decision.id),
            )
            .await?;

        if before_status != Some(decision.status) {
            self.store
                .events
                .append(
                    "decision_resolved",
                    None,
                    None,
                    json!({ "decision_id": decision.id, "status": format!("{:?}", decision.status) }),
                    Some(&decision.id),
                )
                .await?;
            info!(decision_id = %decision.id, status = ?decision.status, "decision resolved by vote");
        }

        Ok(Some(decision))
    }

    fn timeout_for(&self, tier: Tier) -> Duration {
        let timeouts = *self.decision_timeouts.read().expect("decision timeouts lock poisoned");
        let ms = match tier {
            Tier::Operational => timeouts.operational,
            Tier::Minor => timeouts.minor,
            Tier::Major => timeouts.major,
            Tier::Critical => timeouts.critical,
        };
        Duration::from_millis(ms)
    }

    /// Step 4 of §4.7: invoked on a timer by the scheduler's
    /// escalation-timeout job (every minute, §4.8). For every pending
    /// decision whose tier timeout has elapsed: auto-approve or escalate.
    pub async fn sweep_timeouts(&self) -> Result<()> {
        let decisions = self.store.decisions.pending().await?;
        for decision in decisions {
            let elapsed = Utc::now().signed_duration_since(decision.created_at);
            let timeout = self.timeout_for(decision.tier);
            if timeout.is_zero() {
                continue;
            }
            if elapsed.to_std().unwrap_or_default() < timeout {
                continue;
            }

            if decision.tier.auto_approve_on_timeout() {
                self.store.decisions.resolve(&decision.id, DecisionStatus::Approved).await?;
                self.store
                    .events
                    .append("decision_resolved", None, None, json!({ "decision_id": decision.id, "status": "approved", "reason": "timeout" }), Some(&decision.id))
                    .await?;
                info!(decision_id = %decision.id, "auto-approved on timeout");
            } else {
                self.escalate(&decision, "tier timeout elapsed with required votes missing").await?;
            }
        }
        Ok(())
    }

    /// Creates an `Escalation` row, transitions the decision, and
    /// publishes to every configured human channel (§4.7 step 4).
    pub async fn escalate(&self, decision: &Decision, reason: &str) -> Result<()> {
        self.store.decisions.resolve(&decision.id, DecisionStatus::Escalated).await?;
        let escalation = self
            .store
            .escalations
            .create(&decision.id, reason, &HUMAN_CHANNELS.map(String::from))
            .await?;

        let sent_channels = match &self.notifier {
            Some(notifier) => notify::notify_all(notifier.as_ref(), &HUMAN_CHANNELS, &decision.id, reason).await,
            None => Vec::new(),
        };

        self.store
            .events
            .append(
                "escalation_created",
                None,
                None,
                json!({ "escalation_id": escalation.id, "decision_id": decision.id, "channels_sent": sent_channels }),
                Some(&decision.id),
            )
            .await?;
        self.bus
            .publish(
                channels::BROADCAST,
                Message::new(
                    MessageType::Alert,
                    "decision-engine",
                    Recipient::Head,
                    json!({ "escalation_id": escalation.id, "decision_id": decision.id, "reason": reason, "channels": HUMAN_CHANNELS, "channels_sent": sent_channels }),
                    Priority::Critical,
                )
                .with_correlation_id(decision.id.clone()),
            )
            .await;
        Ok(())
    }

    /// Step 5 of §4.7: a decisive human response resolves the decision.
    pub async fn record_human_response(&self, escalation_id: &str, decision_id: &str, approved: bool, response: &str) -> Result<()> {
        self.store.escalations.record_response(escalation_id, response).await?;
        let status = if approved { DecisionStatus::Approved } else { DecisionStatus::Rejected };
        self.store.decisions.resolve(decision_id, status).await?;
        self.store
            .events
            .append("escalation_resolved", None, None, json!({ "escalation_id": escalation_id, "decision_id": decision_id }), Some(decision_id))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentType;
    use crate::config::QueueDelays;

    async fn test_engine() -> DecisionEngine {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("test.sqlite3")).await.unwrap();
        std::mem::forget(dir);
        let bus = Bus::new(QueueDelays { critical: 0, urgent: 0, high: 0, normal: 0, low: 0, operational: 0 });
        DecisionEngine::new(
            store,
            bus,
            3,
            DecisionTimeouts { operational: 0, minor: 1, major: 1, critical: 1 },
            EscalationTimeouts { low: 1, medium: 1, high: 1 },
        )
    }

    #[tokio::test]
    async fn veto_round_cap_vetoes_and_ignores_further_votes() {
        let engine = test_engine().await;
        let decision = engine.propose("Risky pivot", "desc", "cto", Tier::Major).await.unwrap();
        for _ in 0..3 {
            engine.vote(&decision.id, Voter::Ceo, Vote::Veto).await.unwrap();
        }
        let final_state = engine.store.decisions.get(&decision.id).await.unwrap().unwrap();
        assert_eq!(final_state.status, DecisionStatus::Vetoed);

        let after = engine.vote(&decision.id, Voter::Ceo, Vote::Approve).await.unwrap().unwrap();
        assert_eq!(after.status, DecisionStatus::Vetoed);
    }

    #[tokio::test]
    async fn escalation_creates_exactly_one_row_with_all_channels() {
        let engine = test_engine().await;
        let decision = engine.propose("New datacenter", "desc", "dao", Tier::Critical).await.unwrap();
        engine.escalate(&decision, "no human response within 48h").await.unwrap();
        let updated = engine.store.decisions.get(&decision.id).await.unwrap().unwrap();
        assert_eq!(updated.status, DecisionStatus::Escalated);
    }

    #[tokio::test]
    async fn agent_type_c_level_vote_is_recorded() {
        let engine = test_engine().await;
        let decision = engine.propose("Campaign budget", "desc", "cmo", Tier::Operational).await.unwrap();
        let updated = engine.vote(&decision.id, Voter::CLevel(AgentType::Cfo), Vote::Approve).await.unwrap().unwrap();
        assert_eq!(updated.status, DecisionStatus::Approved);
    }

    #[tokio::test]
    async fn set_decision_timeouts_changes_the_next_sweep_s_behavior() {
        let engine = test_engine().await;
        engine.set_decision_timeouts(DecisionTimeouts { operational: 0, minor: 0, major: 0, critical: 0 });
        let decision = engine.propose("Minor hire", "desc", "coo", Tier::Minor).await.unwrap();
        engine.sweep_timeouts().await.unwrap();
        let updated = engine.store.decisions.get(&decision.id).await.unwrap().unwrap();
        assert_eq!(updated.status, DecisionStatus::Approved);
    }
}
