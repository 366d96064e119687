//! Startup configuration and the `systemSettings` runtime tunables (§6, §9).
//!
//! `AgencyConfig` is read once at process start from environment/secrets.
//! The subset of tunables that may change at runtime (routing strategy,
//! queue delays, decision/escalation timeouts) is re-read from
//! [`crate::store::settings::SettingsRepo`] on a fixed interval by the
//! daemon entrypoint and pushed straight into the owning component's
//! `RwLock`-guarded field — no separate cache layer, since the poll
//! interval itself is the staleness bound (§9: "≤60s ... without a
//! process restart").

use crate::error::{AgencyError, Result};
use crate::secrets::Secrets;

/// Per-priority publish delay, milliseconds (spec.md §4.3 defaults).
#[derive(Debug, Clone, Copy)]
pub struct QueueDelays {
    pub critical: u64,
    pub urgent: u64,
    pub high: u64,
    pub normal: u64,
    pub low: u64,
    pub operational: u64,
}

impl Default for QueueDelays {
    fn default() -> Self {
        Self {
            critical: 0,
            urgent: 5_000,
            high: 30_000,
            normal: 120_000,
            low: 300_000,
            operational: 600_000,
        }
    }
}

/// Per-tier decision timeout, milliseconds (§4.7 table).
#[derive(Debug, Clone, Copy)]
pub struct DecisionTimeouts {
    pub operational: u64,
    pub minor: u64,
    pub major: u64,
    pub critical: u64,
}

impl Default for DecisionTimeouts {
    fn default() -> Self {
        Self {
            operational: 0,
            minor: 4 * 3_600_000,
            major: 24 * 3_600_000,
            critical: 48 * 3_600_000,
        }
    }
}

/// Per-severity escalation retry timeout, seconds.
#[derive(Debug, Clone, Copy)]
pub struct EscalationTimeouts {
    pub low: u64,
    pub medium: u64,
    pub high: u64,
}

impl Default for EscalationTimeouts {
    fn default() -> Self {
        Self {
            low: 4 * 3_600,
            medium: 12 * 3_600,
            high: 24 * 3_600,
        }
    }
}

/// Process-wide configuration loaded once at startup.
#[derive(Debug, Clone)]
pub struct AgencyConfig {
    pub database_path: String,
    pub session_pool_enabled: bool,
    pub max_concurrent_per_agent: u32,
    pub loop_hard_timeout_secs: u64,
    pub health_check_interval_secs: u64,
    pub max_veto_rounds: u32,
    pub llm_call_timeout_secs: u64,
    pub provider_connect_timeout_secs: u64,
    pub provider_start_timeout_secs: u64,
    pub claude_monthly_quota: Option<u64>,
    pub gemini_monthly_quota: Option<u64>,
    pub openai_monthly_quota: Option<u64>,
    pub queue_delays: QueueDelays,
    pub decision_timeouts: DecisionTimeouts,
    pub escalation_timeouts: EscalationTimeouts,
    pub http_bind: String,
}

impl AgencyConfig {
    /// Loads configuration from the environment via the secrets
    /// abstraction (§6: files → file path → env var). Fatal on any
    /// malformed numeric value, per the "Config validation | startup |
    /// fatal" row in §7.
    pub fn load(secrets: &Secrets) -> Result<Self> {
        let database_path = secrets
            .get("DATABASE_PATH")
            .unwrap_or_else(|| "agency.sqlite3".to_string());
        let session_pool_enabled = secrets
            .get("SESSION_POOL_ENABLED")
            .map(|v| v != "false")
            .unwrap_or(true);

        let parse_u64 = |key: &str, default: u64| -> Result<u64> {
            match secrets.get(key) {
                None => Ok(default),
                Some(v) => v
                    .parse()
                    .map_err(|_| AgencyError::Config(format!("{key} must be an integer, got {v:?}"))),
            }
        };
        let parse_u32 = |key: &str, default: u32| -> Result<u32> {
            match secrets.get(key) {
                None => Ok(default),
                Some(v) => v
                    .parse()
                    .map_err(|_| AgencyError::Config(format!("{key} must be an integer, got {v:?}"))),
            }
        };
        let parse_quota = |key: &str| -> Result<Option<u64>> {
            match secrets.get(key) {
                None => Ok(None),
                Some(v) => v
                    .parse()
                    .map(Some)
                    .map_err(|_| AgencyError::Config(format!("{key} must be an integer, got {v:?}"))),
            }
        };

        Ok(Self {
            database_path,
            session_pool_enabled,
            max_concurrent_per_agent: parse_u32("TASKS_MAX_CONCURRENT_PER_AGENT", 2)?,
            loop_hard_timeout_secs: parse_u64("LOOP_HARD_TIMEOUT_SECS", 300)?,
            health_check_interval_secs: parse_u64("HEALTH_CHECK_INTERVAL_SECS", 60)?,
            max_veto_rounds: parse_u32("DECISIONS_MAX_VETO_ROUNDS", 3)?,
            llm_call_timeout_secs: parse_u64("LLM_CALL_TIMEOUT_SECS", 300)?,
            provider_connect_timeout_secs: parse_u64("PROVIDER_CONNECT_TIMEOUT_SECS", 2)?,
            provider_start_timeout_secs: parse_u64("PROVIDER_START_TIMEOUT_SECS", 60)?,
            claude_monthly_quota: parse_quota("CLAUDE_MONTHLY_QUOTA")?,
            gemini_monthly_quota: parse_quota("GEMINI_MONTHLY_QUOTA")?,
            openai_monthly_quota: parse_quota("OPENAI_MONTHLY_QUOTA")?,
            queue_delays: QueueDelays::default(),
            decision_timeouts: DecisionTimeouts::default(),
            escalation_timeouts: EscalationTimeouts::default(),
            http_bind: secrets
                .get("HTTP_BIND")
                .unwrap_or_else(|| "0.0.0.0:8080".to_string()),
        })
    }
}

