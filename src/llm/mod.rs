//! The stream protocol and CLI session pool (C6).

pub mod protocol;
pub mod provider;
pub mod session;

pub use session::{ProviderCliBackendFactory, Session, SessionPool, SessionState};
