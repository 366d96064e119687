//! Bus message shape and the closed message/priority vocabularies (§3, §6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The closed set of message types carried on the bus (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Task,
    TaskQueued,
    StatusRequest,
    StatusResponse,
    Decision,
    Vote,
    Alert,
    Broadcast,
    Direct,
    WorkerResult,
    PrApprovedByRag,
    PrRejected,
    PrReviewRequested,
}

/// Ordered from least to most urgent so `a < b` matches the intended
/// preemption order (§4.3's delay table: critical=0ms ... operational
/// =600s). `Operational` sits below `Low` since it names background
/// system traffic (health checks, digests) that should never preempt an
/// agent-facing message, however low-priority that message is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Operational,
    Low,
    Normal,
    High,
    Urgent,
    Critical,
}

/// Recipient: a specific agent id, or one of the three broadcast groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recipient {
    Agent(String),
    All,
    Head,
    CLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub message_type: MessageType,
    pub from: String,
    pub to: Recipient,
    pub payload: Value,
    pub priority: Priority,
    pub requires_response: bool,
    pub response_deadline: Option<DateTime<Utc>>,
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(message_type: MessageType, from: impl Into<String>, to: Recipient, payload: Value, priority: Priority) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type,
            from: from.into(),
            to,
            payload,
            priority,
            requires_response: false,
            response_deadline: None,
            correlation_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn requiring_response(mut self, deadline: Option<DateTime<Utc>>) -> Self {
        self.requires_response = true;
        self.response_deadline = deadline;
        self
    }
}
