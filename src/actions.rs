//! The agent loop's output action vocabulary (§4.9 step 6-7): a loop
//! invocation returns `{ actions: Action[], summary: string }`; unknown
//! action types are logged and dropped rather than failing the whole
//! result.

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::store::decisions::Tier;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    CreateTask {
        title: String,
        description: String,
        assigned_to: String,
        #[serde(default)]
        priority: u8,
    },
    EnqueueMessage {
        channel: String,
        #[serde(default)]
        payload: Value,
    },
    ProposeDecision {
        title: String,
        description: String,
        tier: Tier,
    },
    SpawnWorker {
        task_type: String,
        #[serde(default)]
        payload: Value,
    },
    /// Catches any tag this build doesn't recognize so a single
    /// unfamiliar action never fails the whole loop result.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoopResult {
    #[serde(default)]
    pub actions: Vec<Action>,
    pub summary: String,
}

/// Parses a loop's raw JSON output, dropping and logging unrecognized
/// action entries rather than failing the whole parse (§4.9 step 6).
pub fn parse_loop_result(raw: &str) -> crate::error::Result<(Vec<Action>, String)> {
    let parsed: LoopResult = serde_json::from_str(raw)?;
    let mut actions = Vec::with_capacity(parsed.actions.len());
    for action in parsed.actions {
        match action {
            Action::Unknown => warn!("dropping unrecognized action type from loop output"),
            other => actions.push(other),
        }
    }
    Ok((actions, parsed.summary))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_action_types_are_dropped_not_fatal() {
        let raw = r#"{
            "actions": [
                { "type": "create_task", "title": "t", "description": "d", "assigned_to": "cmo-1" },
                { "type": "future_action_type", "whatever": true }
            ],
            "summary": "did stuff"
        }"#;
        let (actions, summary) = parse_loop_result(raw).unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(summary, "did stuff");
        assert!(matches!(actions[0], Action::CreateTask { .. }));
    }

    #[test]
    fn propose_decision_action_carries_a_tier() {
        let raw = r#"{
            "actions": [{ "type": "propose_decision", "title": "t", "description": "d", "tier": "major" }],
            "summary": "escalating"
        }"#;
        let (actions, _) = parse_loop_result(raw).unwrap();
        assert!(matches!(&actions[0], Action::ProposeDecision { tier: Tier::Major, .. }));
    }
}
