//! Quota Manager (C4): per-provider per-window usage counters and
//! threshold-based warnings (§4.4).
//!
//! Generalizes the `safety::rate_limiter::RateLimiter` token-bucket
//! (tokens/refill) into fixed accounting windows: usage *counters*
//! against a monthly quota ceiling rather than a refilling bucket.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::info;

use crate::bus::{channels, Bus, Message, MessageType, Priority, Recipient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Claude,
    Gemini,
    OpenAi,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Claude => "claude",
            Provider::Gemini => "gemini",
            Provider::OpenAi => "openai",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Window {
    Monthly,
    FiveHour,
    SevenDay,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WindowCounters {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub tokens_estimated: u64,
    pub total_duration_ms: u64,
}

impl WindowCounters {
    pub fn average_duration_ms(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.total_requests as f64
        }
    }

    fn record(&mut self, tokens: u64, duration_ms: u64, success: bool) {
        self.total_requests += 1;
        if success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }
        self.tokens_estimated += tokens;
        self.total_duration_ms += duration_ms;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderQuotaView {
    pub provider: Provider,
    pub monthly: WindowCounters,
    pub five_hour: Option<WindowCounters>,
    pub seven_day: Option<WindowCounters>,
    pub monthly_quota: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WarningLevel {
    Info,
    Warning,
    Critical,
}

impl WarningLevel {
    fn as_str(&self) -> &'static str {
        match self {
            WarningLevel::Info => "info",
            WarningLevel::Warning => "warning",
            WarningLevel::Critical => "critical",
        }
    }

    /// Threshold table from §4.4: info>=50%, warning>=80%, critical>=95%.
    fn for_ratio(ratio: f64) -> Option<Self> {
        if ratio >= 0.95 {
            Some(WarningLevel::Critical)
        } else if ratio >= 0.80 {
            Some(WarningLevel::Warning)
        } else if ratio >= 0.50 {
            Some(WarningLevel::Info)
        } else {
            None
        }
    }
}

struct ProviderBuckets {
    monthly: WindowCounters,
    five_hour: WindowCounters,
    seven_day: WindowCounters,
    /// The highest warning level already emitted this monthly window, so
    /// crossing 50/80/95 each emits exactly one notification (§8 property 7).
    last_warned: Option<WarningLevel>,
}

impl Default for ProviderBuckets {
    fn default() -> Self {
        Self {
            monthly: WindowCounters::default(),
            five_hour: WindowCounters::default(),
            seven_day: WindowCounters::default(),
            last_warned: None,
        }
    }
}

pub struct QuotaManager {
    bus: Arc<Bus>,
    monthly_quotas: HashMap<Provider, u64>,
    buckets: RwLock<HashMap<Provider, ProviderBuckets>>,
}

impl QuotaManager {
    pub fn new(bus: Arc<Bus>, monthly_quotas: HashMap<Provider, u64>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            monthly_quotas,
            buckets: RwLock::new(HashMap::new()),
        })
    }

    /// Atomically updates the current-month counter and, for Claude,
    /// the rolling 5h/7d counters too (§4.4). Redis/store failures in a
    /// real deployment are absorbed here so usage recording can never
    /// cancel an otherwise successful LLM call; this in-process
    /// implementation cannot itself fail.
    pub async fn record_usage(&self, provider: Provider, input_tokens: u64, output_tokens: u64, duration_ms: u64, success: bool) {
        let tokens = input_tokens + output_tokens;
        let ratio = {
            let mut buckets = self.buckets.write().await;
            let entry = buckets.entry(provider).or_default();
            entry.monthly.record(tokens, duration_ms, success);
            if provider == Provider::Claude {
                entry.five_hour.record(tokens, duration_ms, success);
                entry.seven_day.record(tokens, duration_ms, success);
            }
            self.monthly_quotas.get(&provider).map(|quota| entry.monthly.tokens_estimated as f64 / *quota as f64)
        };

        if let Some(ratio) = ratio {
            self.maybe_warn(provider, ratio).await;
        }
    }

    async fn maybe_warn(&self, provider: Provider, ratio: f64) {
        let Some(level) = WarningLevel::for_ratio(ratio) else {
            return;
        };
        let mut buckets = self.buckets.write().await;
        let entry = buckets.entry(provider).or_default();
        if entry.last_warned == Some(level) || matches!((entry.last_warned, level), (Some(WarningLevel::Warning), WarningLevel::Info) | (Some(WarningLevel::Critical), _)) {
            return;
        }
        entry.last_warned = Some(level);
        drop(buckets);

        info!(provider = provider.as_str(), level = level.as_str(), ratio, "quota threshold crossed");
        self.bus
            .publish(
                channels::QUOTA_WARNING,
                Message::new(
                    MessageType::Alert,
                    "quota-manager",
                    Recipient::Head,
                    json!({ "provider": provider.as_str(), "level": level.as_str(), "ratio": ratio }),
                    Priority::High,
                ),
            )
            .await;
    }

    /// `true` if monthly quota is unset, else `(monthly - used) >= estimated` (§4.4).
    pub async fn has_available_quota(&self, provider: Provider, estimated_tokens: u64) -> bool {
        let Some(quota) = self.monthly_quotas.get(&provider) else {
            return true;
        };
        let used = self
            .buckets
            .read()
            .await
            .get(&provider)
            .map(|b| b.monthly.tokens_estimated)
            .unwrap_or(0);
        quota.saturating_sub(used) >= estimated_tokens
    }

    pub async fn get_provider_quota(&self, provider: Provider) -> ProviderQuotaView {
        let buckets = self.buckets.read().await;
        let entry = buckets.get(&provider);
        ProviderQuotaView {
            provider,
            monthly: entry.map(|b| b.monthly.clone()).unwrap_or_default(),
            five_hour: (provider == Provider::Claude).then(|| entry.map(|b| b.five_hour.clone()).unwrap_or_default()),
            seven_day: (provider == Provider::Claude).then(|| entry.map(|b| b.seven_day.clone()).unwrap_or_default()),
            monthly_quota: self.monthly_quotas.get(&provider).copied(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueDelays;
    use futures_util::StreamExt;

    fn zero_delays() -> QueueDelays {
        QueueDelays { critical: 0, urgent: 0, high: 0, normal: 0, low: 0, operational: 0 }
    }

    #[tokio::test]
    async fn crossing_each_threshold_emits_exactly_one_warning() {
        let bus = Bus::new(zero_delays());
        let mut quotas = HashMap::new();
        quotas.insert(Provider::Gemini, 1000);
        let manager = QuotaManager::new(bus.clone(), quotas);
        let mut stream = bus.subscribe(channels::QUOTA_WARNING).await;

        manager.record_usage(Provider::Gemini, 500, 0, 10, true).await;
        manager.record_usage(Provider::Gemini, 300, 0, 10, true).await;
        manager.record_usage(Provider::Gemini, 150, 0, 10, true).await;

        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        let third = stream.next().await.unwrap().unwrap();
        assert_eq!(first.payload["level"], "info");
        assert_eq!(second.payload["level"], "warning");
        assert_eq!(third.payload["level"], "critical");
    }

    #[tokio::test]
    async fn has_available_quota_accounts_for_used_tokens() {
        let bus = Bus::new(zero_delays());
        let mut quotas = HashMap::new();
        quotas.insert(Provider::Gemini, 100_000);
        let manager = QuotaManager::new(bus, quotas);
        manager.record_usage(Provider::Gemini, 95_000, 0, 10, true).await;
        assert!(!manager.has_available_quota(Provider::Gemini, 10_000).await);
        assert!(manager.has_available_quota(Provider::Gemini, 1_000).await);
    }

    #[tokio::test]
    async fn unset_quota_is_always_available() {
        let bus = Bus::new(zero_delays());
        let manager = QuotaManager::new(bus, HashMap::new());
        assert!(manager.has_available_quota(Provider::Claude, 1_000_000).await);
    }
}
