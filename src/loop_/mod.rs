//! Agent Loop (C9): one invocation's full contract — gather state and
//! context, build a prompt, execute via the session pool with bounded
//! retry, parse the result, dispatch actions, persist state (§4.9).
//!
//! Implements [`crate::scheduler::LoopRunner`] so the scheduler can drive
//! it without a circular module dependency, the same seam the cache and
//! provider modules use for their pluggable collaborators.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};

use crate::actions::{parse_loop_result, Action};
use crate::agent::{AgentProfile, AgentType};
use crate::bus::{channels, Bus, Message, MessageType, Priority, Recipient};
use crate::cache::DataCache;
use crate::decision::DecisionEngine;
use crate::error::{AgencyError, Result};
use crate::llm::provider::backoff_sleep;
use crate::llm::SessionPool;
use crate::quota::QuotaManager;
use crate::router::{Router, TaskComplexity, TaskContext, TaskType};
use crate::scheduler::{LoopRunner, TriggerKind};
use crate::store::agent_history::{ActionType, Embedder};
use crate::store::decisions::Decision;
use crate::store::tasks::AgentTask;
use crate::store::Store;
use crate::utils::truncate::{truncate_text, TruncationPolicy};

/// Rough chars-per-token ratio used only to estimate quota consumption;
/// the provider CLI reports no token counts over the stream protocol.
const CHARS_PER_TOKEN: usize = 4;

const RAG_TOP_K: usize = 5;
const RAG_BUDGET: TruncationPolicy = TruncationPolicy::Bytes(1000);
const MAX_SEND_ATTEMPTS: u32 = 3;

/// Whether `decision` is still awaiting this agent's vote (§4.9 step 3:
/// "pending decisions addressed to this agent"), not whether this agent
/// proposed it.
fn decision_awaits_vote_from(decision: &Decision, agent_type: AgentType) -> bool {
    match agent_type {
        AgentType::Ceo => decision.tier.requires_ceo() && decision.ceo_vote.is_none(),
        AgentType::Dao => decision.tier.requires_dao() && decision.dao_vote.is_none(),
        other => !decision.c_level_votes.contains_key(other.as_str()),
    }
}
const LOW_PRIORITY_CEILING: u8 = 1;

pub struct AgentLoop {
    store: Store,
    bus: Arc<Bus>,
    cache: Arc<DataCache>,
    session_pool: Arc<SessionPool>,
    decisions: Arc<DecisionEngine>,
    embedder: Arc<dyn Embedder>,
    profiles: HashMap<AgentType, AgentProfile>,
    llm_call_timeout: Duration,
    router: Arc<Router>,
    quota: Arc<QuotaManager>,
}

impl AgentLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        bus: Arc<Bus>,
        cache: Arc<DataCache>,
        session_pool: Arc<SessionPool>,
        decisions: Arc<DecisionEngine>,
        embedder: Arc<dyn Embedder>,
        profiles: HashMap<AgentType, AgentProfile>,
        llm_call_timeout: Duration,
        router: Arc<Router>,
        quota: Arc<QuotaManager>,
    ) -> Self {
        Self {
            store,
            bus,
            cache,
            session_pool,
            decisions,
            embedder,
            profiles,
            llm_call_timeout,
            router,
            quota,
        }
    }

    fn build_prompt(
        &self,
        agent_type: AgentType,
        trigger: TriggerKind,
        essential: &crate::store::agent_state::EssentialState,
        data_context: &str,
        rag_context: &str,
        pending_tasks: &[AgentTask],
        pending_decisions: &[crate::store::decisions::Decision],
        kanban: &HashMap<String, i64>,
    ) -> String {
        let trigger_label = match trigger {
            TriggerKind::Cadence => "cadence",
            TriggerKind::EventWakeup => "event_wakeup",
        };
        let tasks_section = pending_tasks
            .iter()
            .filter(|t| t.priority > LOW_PRIORITY_CEILING)
            .map(|t| format!("- [{}] {} (priority {})", t.id, t.title, t.priority))
            .collect::<Vec<_>>()
            .join("\n");
        let decisions_section = pending_decisions
            .iter()
            .map(|d| format!("- [{}] {} ({:?})", d.id, d.title, d.tier))
            .collect::<Vec<_>>()
            .join("\n");
        let kanban_section = kanban
            .iter()
            .map(|(status, count)| format!("- {status}: {count}"))
            .collect::<Vec<_>>()
            .join("\n");
        let instructions = self
            .profiles
            .get(&agent_type)
            .map(|p| p.system_prompt.as_str())
            .unwrap_or("Act within your role. Respond with a JSON object of the form {\"actions\": [...], \"summary\": \"...\"}.");

        format!(
            "# Trigger\ntype: {trigger_label}\nagent: {agent_type}\n\n\
             # Current State\nloop_count: {}\nlast_loop_at: {:?}\nlast_loop_result: {:?}\ncurrent_focus: {:?}\nerror_count: {}\nsuccess_count: {}\n\n\
             # Relevant Context\n{data_context}\n\n{rag_context}\n\n\
             # Priority Pending Tasks\n{tasks_section}\n\n\
             # Pending Decisions\n{decisions_section}\n\n\
             # Kanban Status\n{kanban_section}\n\n\
             # Date/Time (UTC)\n{}\n\n\
             # Instructions\n{instructions}\n",
            essential.loop_count,
            essential.last_loop_at,
            essential.last_loop_result,
            essential.current_focus,
            essential.error_count,
            essential.success_count,
            Utc::now().to_rfc3339(),
        )
    }

    async fn dispatch(&self, agent_id: &str, action: Action) -> Result<()> {
        match action {
            Action::CreateTask { title, description, assigned_to, priority } => {
                self.store.tasks.create(&title, &description, &assigned_to, agent_id, priority).await?;
                Ok(())
            }
            Action::EnqueueMessage { channel, payload } => {
                self.bus
                    .publish(
                        channel,
                        Message::new(MessageType::Direct, agent_id, Recipient::All, payload, Priority::Normal),
                    )
                    .await;
                Ok(())
            }
            Action::ProposeDecision { title, description, tier } => {
                self.decisions.propose(&title, &description, agent_id, tier).await?;
                Ok(())
            }
            Action::SpawnWorker { task_type, payload } => {
                self.bus
                    .publish(
                        channels::ORCHESTRATOR,
                        Message::new(MessageType::Task, agent_id, Recipient::All, json!({ "task_type": task_type, "payload": payload }), Priority::Normal)
                            .requiring_response(None),
                    )
                    .await;
                Ok(())
            }
            Action::Unknown => Ok(()),
        }
    }
}

#[async_trait]
impl LoopRunner for AgentLoop {
    /// The scheduler already holds the per-agent semaphore permit before
    /// calling this, so step 1 of §4.9 ("acquire agent semaphore") is the
    /// caller's responsibility here, not this method's.
    async fn run_loop(&self, agent_type: AgentType, trigger: TriggerKind) -> Result<()> {
        let Some(agent) = self.store.agents.get_by_type(agent_type).await? else {
            warn!(agent_type = %agent_type, "no agent row registered for this type, skipping loop");
            return Ok(());
        };

        let essential = self.store.agent_state.get_essential(&agent.id).await?;

        let data_context = self.cache.build_data_context().await;
        let query_embedding = self.embedder.embed(essential.current_focus.as_deref().unwrap_or("")).await;
        let history = self.store.agent_history.search(&agent.id, query_embedding.as_deref(), RAG_TOP_K).await?;
        let rag_context = {
            let joined = history.iter().map(|h| format!("- {}", h.summary)).collect::<Vec<_>>().join("\n");
            truncate_text(&joined, RAG_BUDGET)
        };
        let pending_tasks = self.store.tasks.pending_for_agent(&agent.id).await?;
        let pending_decisions: Vec<_> = self
            .store
            .decisions
            .pending()
            .await?
            .into_iter()
            .filter(|d| decision_awaits_vote_from(d, agent_type))
            .collect();
        let kanban = self.store.tasks.kanban_counts(&agent.id).await?;

        let prompt = self.build_prompt(agent_type, trigger, &essential, &data_context, &format!("## Related History\n{rag_context}"), &pending_tasks, &pending_decisions, &kanban);

        let profile_text = self
            .profiles
            .get(&agent_type)
            .map(|p| p.system_prompt.clone())
            .unwrap_or_default();
        let session = self.session_pool.get_session(agent_type, &profile_text).await?;

        let task_context = TaskContext {
            agent_type: Some(agent_type),
            task_type: Some(TaskType::Loop),
            priority: None,
            requires_reasoning: false,
            estimated_complexity: Some(TaskComplexity::Simple),
        };
        let route_decision = self.router.route(&task_context);
        let estimated_input_tokens = (prompt.len() / CHARS_PER_TOKEN) as u64;
        let (provider, route_reason) = self.router.resolve_with_quota(&route_decision, estimated_input_tokens).await;
        info!(agent_type = %agent_type, provider = provider.as_str(), reason = %route_reason, "routed loop invocation");

        let mut raw_result = None;
        let mut last_err = None;
        let started_at = Instant::now();
        for attempt in 0..MAX_SEND_ATTEMPTS {
            match session.send_message(&prompt, self.llm_call_timeout).await {
                Ok(text) => {
                    raw_result = Some(text);
                    break;
                }
                Err(e) => {
                    let retryable = e.is_retryable();
                    warn!(agent_type = %agent_type, attempt, retryable, error = %e, "loop send_message failed");
                    last_err = Some(e);
                    if !retryable || attempt + 1 == MAX_SEND_ATTEMPTS {
                        break;
                    }
                    backoff_sleep(attempt).await;
                }
            }
        }
        let duration_ms = started_at.elapsed().as_millis() as u64;

        let Some(raw) = raw_result else {
            self.quota.record_usage(provider, estimated_input_tokens, 0, duration_ms, false).await;
            return self.record_failure(&agent.id, last_err.unwrap_or(AgencyError::Fatal("no attempts made".to_string()))).await;
        };
        let estimated_output_tokens = (raw.len() / CHARS_PER_TOKEN) as u64;
        self.quota.record_usage(provider, estimated_input_tokens, estimated_output_tokens, duration_ms, true).await;

        match parse_loop_result(&raw) {
            Ok((actions, summary)) => {
                for action in actions {
                    if let Err(e) = self.dispatch(&agent.id, action).await {
                        warn!(agent_type = %agent_type, error = %e, "action dispatch failed, continuing with remaining actions");
                    }
                }
                self.record_success(&agent, &essential, &summary).await
            }
            Err(e) => self.record_failure(&agent.id, e).await,
        }
    }

    /// Scheduler hook for a hard-timed-out invocation (§4.8): the loop
    /// body above never got to run to completion, so there is no
    /// `AgencyError` to hand `record_failure` — synthesize one and
    /// recycle the session, since the process that hung may still be
    /// stuck mid-response.
    async fn record_timeout(&self, agent_type: AgentType) {
        let Ok(Some(agent)) = self.store.agents.get_by_type(agent_type).await else {
            warn!(agent_type = %agent_type, "hard-timeout recorded for an agent with no registered row");
            return;
        };
        let _ = self.record_failure(&agent.id, AgencyError::Fatal("agent loop exceeded its hard timeout".to_string())).await;
        self.session_pool.force_recycle(agent_type).await;
    }
}

impl AgentLoop {
    async fn record_success(&self, agent: &crate::agent::Agent, essential: &crate::store::agent_state::EssentialState, summary: &str) -> Result<()> {
        self.store.agent_state.set(&agent.id, "loop_count", &json!(essential.loop_count + 1)).await?;
        self.store.agent_state.set(&agent.id, "last_loop_at", &json!(Utc::now().to_rfc3339())).await?;
        self.store.agent_state.set(&agent.id, "last_loop_result", &json!(summary)).await?;
        self.store.agent_state.set(&agent.id, "success_count", &json!(essential.success_count + 1)).await?;
        let embedding = self.embedder.embed(summary).await;
        self.store.agent_history.append(&agent.id, ActionType::Task, summary, json!({}), embedding).await?;
        info!(agent_id = %agent.id, "loop completed");
        Ok(())
    }

    /// Non-retryable (or retry-exhausted) failures never propagate to the
    /// scheduler (§4.9 failure semantics): increment `error_count`, record
    /// an error-type history entry, and return `Ok(())`.
    async fn record_failure(&self, agent_id: &str, err: AgencyError) -> Result<()> {
        error!(agent_id = %agent_id, error = %err, "agent loop failed");
        let essential = self.store.agent_state.get_essential(agent_id).await.unwrap_or_default();
        let _ = self.store.agent_state.set(agent_id, "error_count", &json!(essential.error_count + 1)).await;
        let _ = self.store.agent_state.set(agent_id, "last_loop_at", &json!(Utc::now().to_rfc3339())).await;
        let _ = self
            .store
            .agent_history
            .append(agent_id, ActionType::Error, &err.to_string(), json!({}), None)
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::config::{DecisionTimeouts, EscalationTimeouts, QueueDelays};
    use crate::llm::session::{BackendFactory, SessionBackend};
    use crate::store::agent_history::NullEmbedder;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct ScriptedBackend {
        response: String,
        alive: AtomicBool,
    }

    #[async_trait]
    impl SessionBackend for ScriptedBackend {
        async fn start(&self) -> Result<()> {
            Ok(())
        }

        async fn send(&self, _content: &str, _session_id: Option<&str>) -> Result<String> {
            Ok(self.response.clone())
        }

        async fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn stop(&self) {
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    struct ScriptedFactory {
        response: String,
    }

    impl BackendFactory for ScriptedFactory {
        fn create(&self, _agent_type: AgentType) -> Arc<dyn SessionBackend> {
            Arc::new(ScriptedBackend { response: self.response.clone(), alive: AtomicBool::new(true) })
        }
    }

    async fn test_loop(response: &str) -> (AgentLoop, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("test.sqlite3")).await.unwrap();
        std::mem::forget(dir);
        let bus = Bus::new(QueueDelays { critical: 0, urgent: 0, high: 0, normal: 0, low: 0, operational: 0 });
        let cache = DataCache::new(Arc::new(NoopSource), vec![]);
        let session_pool = Arc::new(SessionPool::new(Arc::new(ScriptedFactory { response: response.to_string() }), 1000));
        let decisions = Arc::new(DecisionEngine::new(
            store.clone(),
            bus.clone(),
            3,
            DecisionTimeouts { operational: 0, minor: 1, major: 1, critical: 1 },
            EscalationTimeouts { low: 1, medium: 1, high: 1 },
        ));
        let quota = QuotaManager::new(bus.clone(), HashMap::new());
        let router = Arc::new(Router::new(crate::router::RoutingStrategy::AgentRole, true, quota.clone()));
        let agent_loop = AgentLoop::new(
            store.clone(),
            bus,
            cache,
            session_pool,
            decisions,
            Arc::new(NullEmbedder),
            HashMap::new(),
            Duration::from_secs(5),
            router,
            quota,
        );
        (agent_loop, store)
    }

    struct NoopSource;

    #[async_trait]
    impl crate::cache::MarketDataSource for NoopSource {
        async fn fetch_crypto_news(&self, _page_size: usize) -> anyhow::Result<Vec<crate::cache::CryptoNewsItem>> {
            anyhow::bail!("no feed in this test")
        }
        async fn fetch_token_market(&self, _symbols: &[String]) -> anyhow::Result<Vec<crate::cache::TokenMarket>> {
            anyhow::bail!("no feed in this test")
        }
        async fn fetch_global_market(&self) -> anyhow::Result<crate::cache::GlobalMarketOverview> {
            anyhow::bail!("no feed in this test")
        }
        async fn fetch_fear_greed(&self) -> anyhow::Result<crate::cache::FearGreedIndex> {
            anyhow::bail!("no feed in this test")
        }
    }

    #[tokio::test]
    async fn successful_loop_creates_task_and_updates_state() {
        let response = r#"{"actions":[{"type":"create_task","title":"ship it","description":"d","assigned_to":"someone"}],"summary":"did a thing"}"#;
        let (agent_loop, store) = test_loop(response).await;
        let agent = Agent::new(AgentType::Cmo, "Marketing", "profiles/cmo.md");
        store.agents.create(&agent).await.unwrap();

        agent_loop.run_loop(AgentType::Cmo, TriggerKind::Cadence).await.unwrap();

        let essential = store.agent_state.get_essential(&agent.id).await.unwrap();
        assert_eq!(essential.loop_count, 1);
        assert_eq!(essential.success_count, 1);
        let pending = store.tasks.pending_for_agent("someone").await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn unparseable_result_increments_error_count_without_propagating() {
        let (agent_loop, store) = test_loop("not json at all").await;
        let agent = Agent::new(AgentType::Cto, "Engineering", "profiles/cto.md");
        store.agents.create(&agent).await.unwrap();

        let result = agent_loop.run_loop(AgentType::Cto, TriggerKind::Cadence).await;
        assert!(result.is_ok());

        let essential = store.agent_state.get_essential(&agent.id).await.unwrap();
        assert_eq!(essential.error_count, 1);
        assert_eq!(essential.success_count, 0);
    }

    #[tokio::test]
    async fn missing_agent_row_is_skipped_without_error() {
        let (agent_loop, _store) = test_loop("{}").await;
        let result = agent_loop.run_loop(AgentType::Dao, TriggerKind::Cadence).await;
        assert!(result.is_ok());
    }
}
