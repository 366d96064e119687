//! Well-known channel name helpers (§4.3).

pub const BROADCAST: &str = "channel:broadcast";
pub const ORCHESTRATOR: &str = "channel:orchestrator";
pub const WORKER_LOGS: &str = "channel:worker:logs";
pub const QUOTA_WARNING: &str = "channel:quota:warning";
pub const STATUS_FEED: &str = "channel:status-feed";

pub fn agent(agent_id: &str) -> String {
    format!("channel:agent:{agent_id}")
}
