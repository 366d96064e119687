//! Daemon entrypoint: load configuration, wire the nine components
//! together, and run the scheduler alongside the status server until
//! asked to shut down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use agency_core::agent::{Agent, AgentProfile, AgentType};
use agency_core::bus::Bus;
use agency_core::cache::{DataCache, HttpMarketDataSource};
use agency_core::config::{AgencyConfig, DecisionTimeouts, EscalationTimeouts, QueueDelays};
use agency_core::container::NoopContainerApi;
use agency_core::decision::DecisionEngine;
use agency_core::llm::{ProviderCliBackendFactory, SessionPool};
use agency_core::loop_::AgentLoop;
use agency_core::quota::{Provider, QuotaManager};
use agency_core::router::{Router, RoutingStrategy};
use agency_core::scheduler::Scheduler;
use agency_core::secrets::Secrets;
use agency_core::server::{self, AppState};
use agency_core::store::agent_history::NullEmbedder;
use agency_core::store::Store;

/// How often [`sync_runtime_settings`] re-reads `systemSettings`, well
/// inside the ≤60s bound in §6/§9.
const SETTINGS_SYNC_INTERVAL: Duration = Duration::from_secs(30);

fn parse_routing_strategy(raw: &str) -> Option<RoutingStrategy> {
    match raw {
        "claude-only" => Some(RoutingStrategy::ClaudeOnly),
        "task-type" => Some(RoutingStrategy::TaskType),
        "agent-role" => Some(RoutingStrategy::AgentRole),
        "gemini-prefer" => Some(RoutingStrategy::GeminiPrefer),
        "load-balance" => Some(RoutingStrategy::LoadBalance),
        _ => None,
    }
}

/// Re-reads the `systemSettings` table and applies any changed tunable
/// to the already-running component that owns it: queue delays onto the
/// bus, routing strategy onto the router, decision/escalation timeouts
/// onto the decision engine (§6, §9). Falls back to each field's
/// process-start default when a row is absent or unparsable, so a
/// partially-populated settings table never panics or stalls a
/// component on a bad value.
async fn sync_runtime_settings(store: &Store, bus: &Arc<Bus>, router: &Arc<Router>, decisions: &Arc<DecisionEngine>, defaults: &AgencyConfig) {
    let get_u64 = |rows: &[(String, String)], key: &str, default: u64| -> u64 {
        rows.iter().find(|(k, _)| k == key).and_then(|(_, v)| v.parse().ok()).unwrap_or(default)
    };

    if let Ok(rows) = store.settings.list_category("queue").await {
        bus.set_delays(QueueDelays {
            critical: get_u64(&rows, "delay_critical", defaults.queue_delays.critical),
            urgent: get_u64(&rows, "delay_urgent", defaults.queue_delays.urgent),
            high: get_u64(&rows, "delay_high", defaults.queue_delays.high),
            normal: get_u64(&rows, "delay_normal", defaults.queue_delays.normal),
            low: get_u64(&rows, "delay_low", defaults.queue_delays.low),
            operational: get_u64(&rows, "delay_operational", defaults.queue_delays.operational),
        })
        .await;
    }

    if let Ok(rows) = store.settings.list_category("llm").await {
        if let Some(strategy) = rows.iter().find(|(k, _)| k == "routing_strategy").and_then(|(_, v)| parse_routing_strategy(v)) {
            router.set_strategy(strategy);
        }
    }

    if let Ok(rows) = store.settings.list_category("decisions").await {
        decisions.set_decision_timeouts(DecisionTimeouts {
            operational: get_u64(&rows, "timeout_operational", defaults.decision_timeouts.operational),
            minor: get_u64(&rows, "timeout_minor", defaults.decision_timeouts.minor),
            major: get_u64(&rows, "timeout_major", defaults.decision_timeouts.major),
            critical: get_u64(&rows, "timeout_critical", defaults.decision_timeouts.critical),
        });
    }

    if let Ok(rows) = store.settings.list_category("escalation").await {
        decisions.set_escalation_timeouts(EscalationTimeouts {
            low: get_u64(&rows, "timeout_low", defaults.escalation_timeouts.low),
            medium: get_u64(&rows, "timeout_medium", defaults.escalation_timeouts.medium),
            high: get_u64(&rows, "timeout_high", defaults.escalation_timeouts.high),
        });
    }
}

fn default_profile(agent_type: AgentType) -> AgentProfile {
    let prompt = match agent_type {
        AgentType::Ceo => {
            "You are the CEO agent. Set direction, resolve cross-functional conflicts, and propose \
             major/critical decisions when the agency needs to commit to a course of action."
        }
        AgentType::Dao => {
            "You are the DAO agent. Represent token-holder governance; vote on proposals that touch \
             treasury or protocol parameters and flag anything that looks like a rug."
        }
        AgentType::Cmo => "You are the CMO agent. Drive growth, community, and narrative.",
        AgentType::Cto => {
            "You are the CTO agent. Own technical architecture and risk. Evaluate engineering proposals \
             for soundness before they reach a vote."
        }
        AgentType::Cfo => "You are the CFO agent. Track treasury health and flag spend anomalies.",
        AgentType::Coo => "You are the COO agent. Keep day-to-day operations and task flow moving.",
        AgentType::Cco => "You are the CCO agent. Own compliance and communications review.",
    };
    AgentProfile::new(agent_type, prompt)
}

/// Inserts a durable `agents` row for every role that doesn't have one
/// yet, so a fresh database boots with the full roster present.
async fn seed_roster(store: &Store) -> Result<()> {
    for agent_type in AgentType::ALL {
        if store.agents.get_by_type(agent_type).await?.is_some() {
            continue;
        }
        let agent = Agent::new(agent_type, agent_type.as_str(), agent_type.as_str());
        store.agents.create(&agent).await?;
        info!(agent_type = %agent_type, "seeded agent roster row");
    }
    Ok(())
}

fn monthly_quotas(config: &AgencyConfig) -> HashMap<Provider, u64> {
    let mut quotas = HashMap::new();
    if let Some(q) = config.claude_monthly_quota {
        quotas.insert(Provider::Claude, q);
    }
    if let Some(q) = config.gemini_monthly_quota {
        quotas.insert(Provider::Gemini, q);
    }
    if let Some(q) = config.openai_monthly_quota {
        quotas.insert(Provider::OpenAi, q);
    }
    quotas
}

#[tokio::main]
async fn main() -> Result<()> {
    agency_core::telemetry::init();

    let secrets = Secrets::new();
    let config = AgencyConfig::load(&secrets)?;
    info!(database_path = %config.database_path, "starting agency");

    let store = Store::open(&config.database_path).await?;
    seed_roster(&store).await?;

    let bus = Bus::new(config.queue_delays);

    let market_source = Arc::new(HttpMarketDataSource::new());
    let tracked_symbols = vec!["bitcoin".to_string(), "ethereum".to_string(), "solana".to_string()];
    let cache = DataCache::new(market_source, tracked_symbols);
    cache.spawn_refresh_loops();

    let quota = QuotaManager::new(bus.clone(), monthly_quotas(&config));

    let mcp_config_path = secrets.get("MCP_CONFIG_PATH");
    let session_factory = Arc::new(ProviderCliBackendFactory::new("claude", "gemini", mcp_config_path));
    // A session that never passes `max_loops` never gets reused, i.e. a
    // fresh process per loop invocation — this is what disabling the
    // pool means in practice since there is no alternate transport.
    let session_max_loops = if config.session_pool_enabled { 50 } else { 0 };
    let session_pool = Arc::new(SessionPool::with_timeouts(
        session_factory,
        session_max_loops,
        Duration::from_secs(config.provider_start_timeout_secs),
        Duration::from_secs(config.provider_connect_timeout_secs),
    ));

    let mut decision_engine = DecisionEngine::new(
        store.clone(),
        bus.clone(),
        config.max_veto_rounds,
        config.decision_timeouts,
        config.escalation_timeouts,
    );
    if let (Some(token), Some(chat_id)) = (secrets.get("TELEGRAM_BOT_TOKEN"), secrets.get("TELEGRAM_CHAT_ID")) {
        match chat_id.parse::<i64>() {
            Ok(chat_id) => {
                decision_engine = decision_engine.with_notifier(Arc::new(
                    agency_core::decision::notify::TelegramNotifier::new(token, chat_id),
                ));
            }
            Err(e) => tracing::warn!(error = %e, "TELEGRAM_CHAT_ID is not a valid integer, escalations will not be sent"),
        }
    }
    let decisions = Arc::new(decision_engine);

    let profiles: HashMap<AgentType, AgentProfile> =
        AgentType::ALL.into_iter().map(|t| (t, default_profile(t))).collect();

    let router = Arc::new(Router::new(RoutingStrategy::AgentRole, true, quota.clone()));

    let agent_loop = Arc::new(AgentLoop::new(
        store.clone(),
        bus.clone(),
        cache,
        session_pool.clone(),
        decisions.clone(),
        Arc::new(NullEmbedder),
        profiles,
        Duration::from_secs(config.llm_call_timeout_secs),
        router.clone(),
        quota,
    ));

    let container = Arc::new(NoopContainerApi);
    let mut scheduler = Scheduler::new(
        agent_loop,
        container,
        decisions.clone(),
        bus.clone(),
        config.max_concurrent_per_agent as usize,
        Duration::from_secs(config.loop_hard_timeout_secs),
    )
    .await?;

    // `tasks.max_concurrent_per_agent` is not covered here: the
    // scheduler's per-agent cap is a `tokio::sync::Semaphore` sized at
    // construction, and shrinking a semaphore's permit count safely
    // while permits are outstanding needs more than a settings poll —
    // it is read once at startup, matching every other *count*-shaped
    // (non-timing) tunable in this crate.
    {
        let store = store.clone();
        let bus = bus.clone();
        let router = router.clone();
        let decisions = decisions.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SETTINGS_SYNC_INTERVAL);
            loop {
                ticker.tick().await;
                sync_runtime_settings(&store, &bus, &router, &decisions, &config).await;
            }
        });
    }

    let intervals: HashMap<AgentType, u64> = AgentType::ALL
        .into_iter()
        .map(|t| (t, t.default_loop_interval_secs()))
        .collect();
    scheduler
        .start(&intervals, Duration::from_secs(config.health_check_interval_secs))
        .await?;

    let server_state = AppState::new(store, bus);
    let http_bind = config.http_bind.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server::run(server_state, &http_bind).await {
            tracing::error!(error = %e, "status server exited");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    server_handle.abort();
    session_pool.stop_all().await;
    scheduler.stop().await?;

    Ok(())
}
