//! Crate-wide error kinds.
//!
//! Mirrors the failure table in spec.md §7: every suspension point
//! (provider call, store query, message publish, cache fetch, semaphore
//! acquisition) raises an `AgencyError` and callers decide whether to
//! retry based on [`AgencyError::is_retryable`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgencyError {
    #[error("transient I/O failure: {0}")]
    Transient(String),

    #[error("fatal error: {0}")]
    Fatal(String),

    #[error("provider rate-limited or overloaded")]
    ProviderRateLimited,

    #[error("provider call timed out after {0}ms")]
    ProviderTimeout(u64),

    #[error("quota exhausted for provider {0}")]
    QuotaExhausted(String),

    #[error("session is busy")]
    SessionBusy,

    #[error("session process is dead")]
    SessionDead,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl AgencyError {
    /// Whether the failure is worth retrying under the bounded-backoff
    /// policy described in spec.md §5 ("Retries use bounded exponential
    /// backoff with jitter; no unbounded retry loops exist anywhere").
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgencyError::Transient(_)
                | AgencyError::ProviderRateLimited
                | AgencyError::ProviderTimeout(_)
        )
    }

    /// Whether the failure should be surfaced as fatal at startup
    /// (spec.md §7: "Config validation | startup | fatal", "DB schema
    /// violation | store | fatal").
    pub fn is_fatal(&self) -> bool {
        matches!(self, AgencyError::Fatal(_) | AgencyError::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, AgencyError>;
