//! The system-prompt text injected exactly once per session (§4.6).

use super::AgentType;

#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub agent_type: AgentType,
    pub system_prompt: String,
}

impl AgentProfile {
    pub fn new(agent_type: AgentType, system_prompt: impl Into<String>) -> Self {
        Self {
            agent_type,
            system_prompt: system_prompt.into(),
        }
    }
}
