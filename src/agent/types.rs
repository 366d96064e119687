//! The fixed agent roster and the durable `Agent` row (C1 §3).

use serde::{Deserialize, Serialize};
use std::fmt;

/// The seven role-specialised agent types. `AgentType` is unique per row
/// in the durable store (spec.md §3: "`type` is unique").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Ceo,
    Dao,
    Cmo,
    Cto,
    Cfo,
    Coo,
    Cco,
}

impl AgentType {
    pub const ALL: [AgentType; 7] = [
        AgentType::Ceo,
        AgentType::Dao,
        AgentType::Cmo,
        AgentType::Cto,
        AgentType::Cfo,
        AgentType::Coo,
        AgentType::Cco,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Ceo => "ceo",
            AgentType::Dao => "dao",
            AgentType::Cmo => "cmo",
            AgentType::Cto => "cto",
            AgentType::Cfo => "cfo",
            AgentType::Coo => "coo",
            AgentType::Cco => "cco",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "ceo" => Some(AgentType::Ceo),
            "dao" => Some(AgentType::Dao),
            "cmo" => Some(AgentType::Cmo),
            "cto" => Some(AgentType::Cto),
            "cfo" => Some(AgentType::Cfo),
            "coo" => Some(AgentType::Coo),
            "cco" => Some(AgentType::Cco),
            _ => None,
        }
    }

    /// Default loop cadence in seconds, overridable via
    /// `systemSettings.agents.loop_interval_<type>` (spec.md §6).
    pub fn default_loop_interval_secs(&self) -> u64 {
        match self {
            AgentType::Ceo => 3600,
            AgentType::Dao => 7200,
            AgentType::Cmo => 1800,
            AgentType::Cto => 1800,
            AgentType::Cfo => 3600,
            AgentType::Coo => 1800,
            AgentType::Cco => 3600,
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status transitions: inactive -> starting -> active -> stopping -> inactive;
/// any -> error on unrecoverable fault (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Inactive,
    Starting,
    Active,
    Stopping,
    Error,
}

impl AgentStatus {
    /// Whether `self -> next` is a legal status transition.
    pub fn can_transition_to(&self, next: AgentStatus) -> bool {
        use AgentStatus::*;
        if next == Error {
            return true;
        }
        matches!(
            (self, next),
            (Inactive, Starting) | (Starting, Active) | (Active, Stopping) | (Stopping, Inactive)
        )
    }
}

/// The durable `Agent` row (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub agent_type: AgentType,
    pub name: String,
    pub profile_ref: String,
    pub loop_interval_secs: u64,
    pub status: AgentStatus,
    pub last_heartbeat: Option<chrono::DateTime<chrono::Utc>>,
    pub container_handle: Option<String>,
}

impl Agent {
    pub fn new(agent_type: AgentType, name: impl Into<String>, profile_ref: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_type,
            name: name.into(),
            profile_ref: profile_ref.into(),
            loop_interval_secs: agent_type.default_loop_interval_secs(),
            status: AgentStatus::Inactive,
            last_heartbeat: None,
            container_handle: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roster_round_trips_through_string() {
        for t in AgentType::ALL {
            assert_eq!(AgentType::from_str_loose(t.as_str()), Some(t));
        }
        assert_eq!(AgentType::from_str_loose("CEO"), Some(AgentType::Ceo));
        assert_eq!(AgentType::from_str_loose("bogus"), None);
    }

    #[test]
    fn status_transitions_follow_the_documented_cycle() {
        use AgentStatus::*;
        assert!(Inactive.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Active));
        assert!(Active.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Inactive));
        assert!(!Inactive.can_transition_to(Active));
        assert!(!Active.can_transition_to(Inactive));
        assert!(Active.can_transition_to(Error));
        assert!(Starting.can_transition_to(Error));
    }
}
