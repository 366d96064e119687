//! Durable store (C1): `agents`, `agentState`, `agentHistory` (with
//! cosine kNN), `decisions`, `tasks`, `events`, `escalations`,
//! `systemSettings` — one repository module per entity in the data
//! model, all sharing the [`db::Db`] connection helper.

mod db;

pub mod agent_history;
pub mod agent_state;
pub mod agents;
pub mod decisions;
pub mod escalations;
pub mod events;
pub mod settings;
pub mod tasks;

use std::path::Path;

use crate::error::Result;

pub use db::Db;

/// The full set of repositories, constructed once at startup and cloned
/// cheaply (each repo just holds a [`Db`] handle) into every component
/// that needs store access.
#[derive(Clone)]
pub struct Store {
    pub agents: agents::AgentsRepo,
    pub agent_state: agent_state::AgentStateRepo,
    pub agent_history: agent_history::AgentHistoryRepo,
    pub decisions: decisions::DecisionsRepo,
    pub tasks: tasks::TasksRepo,
    pub events: events::EventsRepo,
    pub escalations: escalations::EscalationsRepo,
    pub settings: settings::SettingsRepo,
}

impl Store {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Db::open(path).await?;
        Ok(Self {
            agents: agents::AgentsRepo::new(db.clone()),
            agent_state: agent_state::AgentStateRepo::new(db.clone()),
            agent_history: agent_history::AgentHistoryRepo::new(db.clone()),
            decisions: decisions::DecisionsRepo::new(db.clone()),
            tasks: tasks::TasksRepo::new(db.clone()),
            events: events::EventsRepo::new(db.clone()),
            escalations: escalations::EscalationsRepo::new(db.clone()),
            settings: settings::SettingsRepo::new(db),
        })
    }
}
