//! LLM Router (C5): strategy-table dispatch of a request to a
//! primary/fallback provider (§4.5).
//!
//! Generalizes `orchestrator::router::Router`, which picked an *agent
//! type* for a chat query via heuristics then an LLM fallback, into a
//! decision table that picks a *provider* for a task, consulting the
//! quota manager instead of an LLM classifier.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::agent::AgentType;
use crate::quota::{Provider, QuotaManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    ClaudeOnly,
    TaskType,
    AgentRole,
    GeminiPrefer,
    LoadBalance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskComplexity {
    Simple,
    Complex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    SpawnWorker,
    Operational,
    CreateTask,
    Alert,
    ProposeDecision,
    Vote,
    Loop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPriority {
    Low,
    Normal,
    High,
    Urgent,
    Critical,
}

/// Inputs to a routing decision (§4.5).
#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    pub agent_type: Option<AgentType>,
    pub task_type: Option<TaskType>,
    pub priority: Option<RequestPriority>,
    pub requires_reasoning: bool,
    pub estimated_complexity: Option<TaskComplexity>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub primary: Provider,
    /// Ordered fallback chain, tried in order when `primary` (then each
    /// prior fallback) is unavailable or over quota.
    pub fallback: Vec<Provider>,
    pub reason: String,
}

/// Chooses primary/fallback provider and executes with quota-aware
/// fallback. Never calls a provider directly: provider adapters are
/// supplied by the session pool / `llm::provider` layer (§4.5).
pub struct Router {
    strategy: RwLock<RoutingStrategy>,
    enable_fallback: bool,
    quota: Arc<QuotaManager>,
}

impl Router {
    pub fn new(strategy: RoutingStrategy, enable_fallback: bool, quota: Arc<QuotaManager>) -> Self {
        Self { strategy: RwLock::new(strategy), enable_fallback, quota }
    }

    fn strategy(&self) -> RoutingStrategy {
        *self.strategy.read().expect("router strategy lock poisoned")
    }

    /// Swaps the active strategy in place (§6: `llm.routing_strategy`
    /// changeable at runtime without a process restart).
    pub fn set_strategy(&self, strategy: RoutingStrategy) {
        *self.strategy.write().expect("router strategy lock poisoned") = strategy;
    }

    /// `route(ctx)` returns `{ primary, fallback, reason }` per the
    /// strategy table in §4.5. `priority=critical` always overrides to
    /// claude under `task-type`, regardless of other fields.
    pub fn route(&self, ctx: &TaskContext) -> RouteDecision {
        let strategy = self.strategy();
        if ctx.priority == Some(RequestPriority::Critical) && strategy == RoutingStrategy::TaskType {
            return RouteDecision {
                primary: Provider::Claude,
                fallback: vec![Provider::Gemini],
                reason: "critical priority overrides to claude".to_string(),
            };
        }

        match strategy {
            RoutingStrategy::ClaudeOnly => RouteDecision {
                primary: Provider::Claude,
                fallback: vec![],
                reason: "claude-only strategy".to_string(),
            },
            RoutingStrategy::TaskType => self.route_task_type(ctx),
            RoutingStrategy::AgentRole => self.route_agent_role(ctx),
            RoutingStrategy::GeminiPrefer => self.route_gemini_prefer(ctx),
            RoutingStrategy::LoadBalance => RouteDecision {
                primary: Provider::Claude,
                fallback: vec![Provider::Gemini, Provider::OpenAi],
                reason: "load-balance: claude first, gemini then openai on exhaustion".to_string(),
            },
        }
    }

    fn route_task_type(&self, ctx: &TaskContext) -> RouteDecision {
        if ctx.task_type.is_none() {
            return RouteDecision {
                primary: Provider::Claude,
                fallback: vec![Provider::Gemini],
                reason: "no task context".to_string(),
            };
        }
        if ctx.requires_reasoning {
            return RouteDecision {
                primary: Provider::Claude,
                fallback: vec![Provider::Gemini],
                reason: "requires reasoning".to_string(),
            };
        }
        match ctx.task_type {
            Some(TaskType::SpawnWorker) | Some(TaskType::Operational) | Some(TaskType::CreateTask) | Some(TaskType::Alert) => {
                RouteDecision {
                    primary: Provider::Gemini,
                    fallback: vec![Provider::Claude],
                    reason: "lightweight operational task type".to_string(),
                }
            }
            Some(TaskType::ProposeDecision) | Some(TaskType::Vote) => RouteDecision {
                primary: Provider::Claude,
                fallback: vec![Provider::Gemini],
                reason: "governance task type requires claude".to_string(),
            },
            Some(TaskType::Loop) => {
                if ctx.estimated_complexity == Some(TaskComplexity::Complex) {
                    RouteDecision {
                        primary: Provider::Claude,
                        fallback: vec![Provider::Gemini],
                        reason: "complex loop".to_string(),
                    }
                } else {
                    RouteDecision {
                        primary: Provider::Gemini,
                        fallback: vec![Provider::Claude],
                        reason: "simple loop".to_string(),
                    }
                }
            }
            None => unreachable!("checked above"),
        }
    }

    fn route_agent_role(&self, ctx: &TaskContext) -> RouteDecision {
        let claude_roles = matches!(ctx.agent_type, Some(AgentType::Ceo) | Some(AgentType::Dao) | Some(AgentType::Cto));
        if claude_roles {
            RouteDecision {
                primary: Provider::Claude,
                fallback: vec![Provider::Gemini],
                reason: "agent-role: ceo/dao/cto use claude".to_string(),
            }
        } else {
            RouteDecision {
                primary: Provider::Gemini,
                fallback: vec![Provider::Claude],
                reason: "agent-role: remaining roles use gemini".to_string(),
            }
        }
    }

    fn route_gemini_prefer(&self, ctx: &TaskContext) -> RouteDecision {
        if ctx.priority == Some(RequestPriority::Critical) || ctx.requires_reasoning {
            RouteDecision {
                primary: Provider::Claude,
                fallback: vec![Provider::Gemini],
                reason: "gemini-prefer overridden by critical priority or required reasoning".to_string(),
            }
        } else {
            RouteDecision {
                primary: Provider::Gemini,
                fallback: vec![Provider::Claude],
                reason: "gemini-prefer default".to_string(),
            }
        }
    }

    /// Resolves the effective provider, walking the fallback chain in
    /// order when `primary` (then each prior fallback) is already known
    /// to be over quota before sending (§4.5, scenario E5). Load-balance
    /// routing's three-tier chain (claude, then gemini, then openai)
    /// falls all the way through this loop rather than stopping at one
    /// fallback.
    pub async fn resolve_with_quota(&self, decision: &RouteDecision, estimated_tokens: u64) -> (Provider, String) {
        if self.quota.has_available_quota(decision.primary, estimated_tokens).await {
            return (decision.primary, decision.reason.clone());
        }
        if !self.enable_fallback {
            return (decision.primary, format!("{} quota exhausted, no fallback enabled", decision.primary.as_str()));
        }
        for candidate in &decision.fallback {
            if self.quota.has_available_quota(*candidate, estimated_tokens).await {
                return (
                    *candidate,
                    format!("{} quota exhausted, falling back to {}", decision.primary.as_str(), candidate.as_str()),
                );
            }
        }
        let last_resort = decision.fallback.last().copied().unwrap_or(decision.primary);
        (
            last_resort,
            format!("{} and all fallbacks exhausted, using {} as last resort", decision.primary.as_str(), last_resort.as_str()),
        )
    }
}

/// Small complexity->model table used once a provider is chosen (§4.5
/// "Model selection within a provider uses a small complexity→model
/// table").
pub fn model_for(provider: Provider, complexity: TaskComplexity) -> &'static str {
    match (provider, complexity) {
        (Provider::Claude, TaskComplexity::Complex) => "claude-opus-4",
        (Provider::Claude, TaskComplexity::Simple) => "claude-haiku-4",
        (Provider::Gemini, TaskComplexity::Complex) => "gemini-2.5-pro",
        (Provider::Gemini, TaskComplexity::Simple) => "gemini-2.5-flash",
        (Provider::OpenAi, _) => "gpt-4o",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::config::QueueDelays;
    use std::collections::HashMap;

    fn test_quota() -> Arc<QuotaManager> {
        let bus = Bus::new(QueueDelays { critical: 0, urgent: 0, high: 0, normal: 0, low: 0, operational: 0 });
        QuotaManager::new(bus, HashMap::new())
    }

    #[tokio::test]
    async fn claude_only_always_routes_to_claude() {
        let router = Router::new(RoutingStrategy::ClaudeOnly, true, test_quota());
        let decision = router.route(&TaskContext::default());
        assert_eq!(decision.primary, Provider::Claude);
        assert!(decision.fallback.is_empty());
    }

    #[tokio::test]
    async fn set_strategy_takes_effect_on_the_next_route_call() {
        let router = Router::new(RoutingStrategy::ClaudeOnly, true, test_quota());
        assert_eq!(router.route(&TaskContext::default()).primary, Provider::Claude);

        router.set_strategy(RoutingStrategy::GeminiPrefer);
        assert_eq!(router.route(&TaskContext::default()).primary, Provider::Gemini);
    }

    #[tokio::test]
    async fn task_type_no_context_routes_to_claude() {
        let router = Router::new(RoutingStrategy::TaskType, true, test_quota());
        let decision = router.route(&TaskContext::default());
        assert_eq!(decision.primary, Provider::Claude);
    }

    #[tokio::test]
    async fn task_type_operational_routes_to_gemini() {
        let router = Router::new(RoutingStrategy::TaskType, true, test_quota());
        let ctx = TaskContext { task_type: Some(TaskType::Operational), ..Default::default() };
        assert_eq!(router.route(&ctx).primary, Provider::Gemini);
    }

    #[tokio::test]
    async fn critical_priority_always_overrides_to_claude_under_task_type() {
        let router = Router::new(RoutingStrategy::TaskType, true, test_quota());
        let ctx = TaskContext {
            task_type: Some(TaskType::Operational),
            priority: Some(RequestPriority::Critical),
            ..Default::default()
        };
        assert_eq!(router.route(&ctx).primary, Provider::Claude);
    }

    #[tokio::test]
    async fn agent_role_picks_claude_for_ceo_dao_cto() {
        let router = Router::new(RoutingStrategy::AgentRole, true, test_quota());
        for role in [AgentType::Ceo, AgentType::Dao, AgentType::Cto] {
            let ctx = TaskContext { agent_type: Some(role), ..Default::default() };
            assert_eq!(router.route(&ctx).primary, Provider::Claude);
        }
        let ctx = TaskContext { agent_type: Some(AgentType::Cmo), ..Default::default() };
        assert_eq!(router.route(&ctx).primary, Provider::Gemini);
    }

    #[tokio::test]
    async fn gemini_prefer_falls_back_to_claude_on_reasoning() {
        let router = Router::new(RoutingStrategy::GeminiPrefer, true, test_quota());
        let ctx = TaskContext { requires_reasoning: true, ..Default::default() };
        assert_eq!(router.route(&ctx).primary, Provider::Claude);
        assert_eq!(router.route(&TaskContext::default()).primary, Provider::Gemini);
    }

    #[tokio::test]
    async fn resolve_with_quota_falls_back_exactly_once_when_exhausted() {
        let bus = Bus::new(QueueDelays { critical: 0, urgent: 0, high: 0, normal: 0, low: 0, operational: 0 });
        let mut quotas = HashMap::new();
        quotas.insert(Provider::Gemini, 100_000);
        let quota = QuotaManager::new(bus, quotas);
        quota.record_usage(Provider::Gemini, 95_000, 0, 10, true).await;

        let router = Router::new(RoutingStrategy::GeminiPrefer, true, quota);
        let decision = router.route(&TaskContext::default());
        let (provider, reason) = router.resolve_with_quota(&decision, 10_000).await;
        assert_eq!(provider, Provider::Claude);
        assert!(reason.contains("quota exhausted"));
    }

    #[tokio::test]
    async fn load_balance_chains_claude_then_gemini_then_openai() {
        let router = Router::new(RoutingStrategy::LoadBalance, true, test_quota());
        let decision = router.route(&TaskContext::default());
        assert_eq!(decision.primary, Provider::Claude);
        assert_eq!(decision.fallback, vec![Provider::Gemini, Provider::OpenAi]);
    }

    #[tokio::test]
    async fn load_balance_falls_through_to_openai_when_claude_and_gemini_exhausted() {
        let bus = Bus::new(QueueDelays { critical: 0, urgent: 0, high: 0, normal: 0, low: 0, operational: 0 });
        let mut quotas = HashMap::new();
        quotas.insert(Provider::Claude, 100_000);
        quotas.insert(Provider::Gemini, 100_000);
        let quota = QuotaManager::new(bus, quotas);
        quota.record_usage(Provider::Claude, 95_000, 0, 10, true).await;
        quota.record_usage(Provider::Gemini, 95_000, 0, 10, true).await;

        let router = Router::new(RoutingStrategy::LoadBalance, true, quota);
        let decision = router.route(&TaskContext::default());
        let (provider, reason) = router.resolve_with_quota(&decision, 10_000).await;
        assert_eq!(provider, Provider::OpenAi);
        assert!(reason.contains("falling back to openai") || reason.contains("openai"));
    }
}
