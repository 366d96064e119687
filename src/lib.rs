//! Semi-Autonomous Agency
//!
//! A durable, multi-agent system where seven role-specialised agents loop
//! on cadence and on event wake-up, routed across LLM providers under
//! quota, voting on decisions through a tiered governance protocol.

pub mod actions;
pub mod agent;
pub mod bus;
pub mod cache;
pub mod config;
pub mod container;
pub mod decision;
pub mod error;
pub mod llm;
pub mod loop_;
pub mod quota;
pub mod router;
pub mod scheduler;
pub mod secrets;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod utils;

pub use agent::{Agent, AgentStatus, AgentType};
pub use error::{AgencyError, Result};
pub use store::Store;
