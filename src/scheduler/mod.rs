//! Scheduler (C8): fires each agent's loop on cadence and on event
//! wake-ups, enforces the per-agent concurrency cap, and runs the three
//! always-on system jobs (§4.8).
//!
//! Builds on the `tokio-cron-scheduler` dependency already present for
//! digest/health jobs, generalized from a single-purpose scheduler into
//! a per-agent registry keyed by job id — the same registry shape
//! `orchestrator::event_bus` uses for subscriber bookkeeping.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::agent::AgentType;
use crate::bus::{channels, Bus, Message, MessageType, Priority, Recipient};
use crate::container::ContainerApi;
use crate::decision::DecisionEngine;
use crate::error::{AgencyError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Cadence,
    EventWakeup,
}

/// The scheduler's only dependency on the agent loop (C9), kept as a
/// trait so this module builds and tests independently of `loop_`, the
/// same pluggable-collaborator shape as [`crate::cache::MarketDataSource`].
#[async_trait]
pub trait LoopRunner: Send + Sync {
    async fn run_loop(&self, agent_type: AgentType, trigger: TriggerKind) -> Result<()>;

    /// Called when a loop invocation is abandoned after exceeding the
    /// hard timeout (§4.8): records the failure the same way an
    /// in-loop error would and recycles the agent's session so the
    /// next invocation doesn't inherit a process that may be wedged.
    /// Default no-op so test runners that don't model this stay simple.
    async fn record_timeout(&self, _agent_type: AgentType) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Active,
    Paused,
}

struct JobRecord {
    status: JobStatus,
    cron_uuid: Uuid,
}

/// Converts a cadence in seconds to the smallest six-field cron
/// expression that hits it (§4.8). Falls back to hourly for cadences
/// that don't divide evenly into a clean minute/hour boundary.
fn interval_to_cron(interval_secs: u64) -> String {
    if interval_secs == 0 {
        return "* * * * * *".to_string();
    }
    if interval_secs < 60 {
        return format!("*/{interval_secs} * * * * *");
    }
    let minutes = interval_secs / 60;
    if interval_secs % 60 == 0 && minutes < 60 {
        return format!("0 */{minutes} * * * *");
    }
    let hours = (interval_secs / 3600).max(1);
    format!("0 0 */{hours} * * *")
}

pub struct Scheduler {
    cron: JobScheduler,
    runner: Arc<dyn LoopRunner>,
    container: Arc<dyn ContainerApi>,
    decisions: Arc<DecisionEngine>,
    bus: Arc<Bus>,
    semaphores: HashMap<AgentType, Arc<Semaphore>>,
    loop_hard_timeout: Duration,
    jobs: Arc<RwLock<HashMap<String, JobRecord>>>,
    wakeup_listeners: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub async fn new(
        runner: Arc<dyn LoopRunner>,
        container: Arc<dyn ContainerApi>,
        decisions: Arc<DecisionEngine>,
        bus: Arc<Bus>,
        max_concurrent_per_agent: usize,
        loop_hard_timeout: Duration,
    ) -> Result<Self> {
        let cron = JobScheduler::new()
            .await
            .map_err(|e| AgencyError::Fatal(format!("failed to start cron scheduler: {e}")))?;
        let semaphores = AgentType::ALL
            .into_iter()
            .map(|t| (t, Arc::new(Semaphore::new(max_concurrent_per_agent))))
            .collect();
        Ok(Self {
            cron,
            runner,
            container,
            decisions,
            bus,
            semaphores,
            loop_hard_timeout,
            jobs: Arc::new(RwLock::new(HashMap::new())),
            wakeup_listeners: Vec::new(),
        })
    }

    /// Registers one cron-driven job per active agent plus the three
    /// always-on system jobs, and starts the event-wake-up listeners.
    pub async fn start(&mut self, intervals: &HashMap<AgentType, u64>, health_check_interval: Duration) -> Result<()> {
        for (&agent_type, &interval_secs) in intervals {
            self.add_agent_job(agent_type, interval_secs).await?;
        }
        self.add_health_check_job(health_check_interval).await?;
        self.add_escalation_sweep_job().await?;
        self.add_daily_digest_job().await?;
        for &agent_type in AgentType::ALL.iter() {
            self.spawn_wakeup_listener(agent_type);
        }
        self.cron
            .start()
            .await
            .map_err(|e| AgencyError::Fatal(format!("cron scheduler failed to start: {e}")))?;
        Ok(())
    }

    async fn add_agent_job(&mut self, agent_type: AgentType, interval_secs: u64) -> Result<String> {
        let job_id = format!("agent-loop:{agent_type}");
        let jobs = self.jobs.clone();
        let runner = self.runner.clone();
        let semaphore = self.semaphores.get(&agent_type).cloned().expect("every agent type has a semaphore");
        let timeout = self.loop_hard_timeout;
        let job_key = job_id.clone();

        let job = Job::new_async(interval_to_cron(interval_secs).as_str(), move |_uuid, _l| {
            let jobs = jobs.clone();
            let runner = runner.clone();
            let semaphore = semaphore.clone();
            let job_key = job_key.clone();
            Box::pin(async move {
                if matches!(jobs.read().await.get(&job_key).map(|j| j.status), Some(JobStatus::Paused)) {
                    return;
                }
                run_one_loop(runner, semaphore, timeout, agent_type, TriggerKind::Cadence).await;
            })
        })
        .map_err(|e| AgencyError::Fatal(format!("failed to build cron job for {agent_type}: {e}")))?;

        let cron_uuid = self
            .cron
            .add(job)
            .await
            .map_err(|e| AgencyError::Fatal(format!("failed to register cron job for {agent_type}: {e}")))?;
        self.jobs.write().await.insert(job_id.clone(), JobRecord { status: JobStatus::Active, cron_uuid });
        Ok(job_id)
    }

    async fn add_health_check_job(&mut self, interval: Duration) -> Result<()> {
        let container = self.container.clone();
        let job = Job::new_repeated_async(interval, move |_uuid, _l| {
            let container = container.clone();
            Box::pin(async move {
                match container.list_unhealthy().await {
                    Ok(handles) => {
                        for handle in handles {
                            info!(handle = %handle, "health check: restarting unhealthy container");
                            if let Err(e) = container.restart(&handle).await {
                                error!(handle = %handle, error = %e, "failed to restart unhealthy container");
                            }
                        }
                    }
                    Err(e) => error!(error = %e, "health check: failed to list unhealthy containers"),
                }
            })
        })
        .map_err(|e| AgencyError::Fatal(format!("failed to build health check job: {e}")))?;
        let cron_uuid = self
            .cron
            .add(job)
            .await
            .map_err(|e| AgencyError::Fatal(format!("failed to register health check job: {e}")))?;
        self.jobs.write().await.insert("system:health-check".to_string(), JobRecord { status: JobStatus::Active, cron_uuid });
        Ok(())
    }

    async fn add_escalation_sweep_job(&mut self) -> Result<()> {
        let decisions = self.decisions.clone();
        let job = Job::new_repeated_async(Duration::from_secs(60), move |_uuid, _l| {
            let decisions = decisions.clone();
            Box::pin(async move {
                if let Err(e) = decisions.sweep_timeouts().await {
                    error!(error = %e, "escalation sweep job failed");
                }
            })
        })
        .map_err(|e| AgencyError::Fatal(format!("failed to build escalation sweep job: {e}")))?;
        let cron_uuid = self
            .cron
            .add(job)
            .await
            .map_err(|e| AgencyError::Fatal(format!("failed to register escalation sweep job: {e}")))?;
        self.jobs.write().await.insert("system:escalation-sweep".to_string(), JobRecord { status: JobStatus::Active, cron_uuid });
        Ok(())
    }

    async fn add_daily_digest_job(&mut self) -> Result<()> {
        let bus = self.bus.clone();
        let job = Job::new_async("0 0 9 * * *", move |_uuid, _l| {
            let bus = bus.clone();
            Box::pin(async move {
                bus.publish(
                    channels::ORCHESTRATOR,
                    Message::new(
                        MessageType::Broadcast,
                        "scheduler",
                        Recipient::Agent(AgentType::Ceo.as_str().to_string()),
                        serde_json::json!({ "kind": "daily_digest" }),
                        Priority::Operational,
                    ),
                )
                .await;
            })
        })
        .map_err(|e| AgencyError::Fatal(format!("failed to build daily digest job: {e}")))?;
        let cron_uuid = self
            .cron
            .add(job)
            .await
            .map_err(|e| AgencyError::Fatal(format!("failed to register daily digest job: {e}")))?;
        self.jobs.write().await.insert("system:daily-digest".to_string(), JobRecord { status: JobStatus::Active, cron_uuid });
        Ok(())
    }

    /// Subscribes to an agent's channel and fires an out-of-band loop run
    /// on `task_queued` or any message at `High` priority or above,
    /// subject to the same per-agent concurrency cap (§4.8).
    fn spawn_wakeup_listener(&mut self, agent_type: AgentType) {
        let bus = self.bus.clone();
        let runner = self.runner.clone();
        let semaphore = self.semaphores.get(&agent_type).cloned().expect("every agent type has a semaphore");
        let timeout = self.loop_hard_timeout;
        let jobs = self.jobs.clone();
        let job_key = format!("agent-loop:{agent_type}");

        let handle = tokio::spawn(async move {
            let mut stream = bus.subscribe(channels::agent(agent_type.as_str())).await;
            while let Some(Ok(message)) = stream.next().await {
                let wakes = message.message_type == MessageType::TaskQueued || message.priority >= Priority::High;
                if !wakes {
                    continue;
                }
                if matches!(jobs.read().await.get(&job_key).map(|j| j.status), Some(JobStatus::Paused)) {
                    continue;
                }
                run_one_loop(runner.clone(), semaphore.clone(), timeout, agent_type, TriggerKind::EventWakeup).await;
            }
        });
        self.wakeup_listeners.push(handle);
    }

    pub async fn pause_job(&self, job_id: &str) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(job_id) {
            Some(record) => {
                record.status = JobStatus::Paused;
                Ok(())
            }
            None => Err(AgencyError::Fatal(format!("unknown job id {job_id}"))),
        }
    }

    pub async fn resume_job(&self, job_id: &str) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(job_id) {
            Some(record) => {
                record.status = JobStatus::Active;
                Ok(())
            }
            None => Err(AgencyError::Fatal(format!("unknown job id {job_id}"))),
        }
    }

    pub async fn stop_job(&self, job_id: &str) -> Result<()> {
        let cron_uuid = {
            let mut jobs = self.jobs.write().await;
            jobs.remove(job_id).map(|r| r.cron_uuid)
        };
        match cron_uuid {
            Some(uuid) => self
                .cron
                .remove(&uuid)
                .await
                .map_err(|e| AgencyError::Fatal(format!("failed to remove job {job_id}: {e}"))),
            None => Err(AgencyError::Fatal(format!("unknown job id {job_id}"))),
        }
    }

    pub async fn get_scheduled_jobs(&self) -> Vec<(String, JobStatus)> {
        self.jobs.read().await.iter().map(|(id, record)| (id.clone(), record.status)).collect()
    }

    /// Stops all jobs, cancels the wake-up listeners, and waits for the
    /// cron driver to shut down (§4.8 cancellation semantics). In-flight
    /// loop invocations are left to their own per-call hard timeout
    /// rather than forcibly aborted, since cooperative cancellation runs
    /// through the context propagated into every I/O call (§5).
    pub async fn stop(mut self) -> Result<()> {
        for handle in self.wakeup_listeners.drain(..) {
            handle.abort();
        }
        self.cron
            .shutdown()
            .await
            .map_err(|e| AgencyError::Fatal(format!("cron scheduler failed to shut down cleanly: {e}")))
    }
}

async fn run_one_loop(runner: Arc<dyn LoopRunner>, semaphore: Arc<Semaphore>, timeout: Duration, agent_type: AgentType, trigger: TriggerKind) {
    let permit = match semaphore.try_acquire() {
        Ok(permit) => permit,
        Err(_) => {
            warn!(agent_type = %agent_type, "agent concurrency cap reached, skipping this invocation");
            return;
        }
    };
    match tokio::time::timeout(timeout, runner.run_loop(agent_type, trigger)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(agent_type = %agent_type, error = %e, "agent loop failed"),
        Err(_) => {
            warn!(agent_type = %agent_type, "agent loop exceeded its hard timeout and was abandoned");
            runner.record_timeout(agent_type).await;
        }
    }
    drop(permit);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DecisionTimeouts, EscalationTimeouts, QueueDelays};
    use crate::container::InMemoryContainerApi;
    use crate::store::Store;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn interval_conversion_picks_the_tightest_cron_field() {
        assert_eq!(interval_to_cron(10), "*/10 * * * * *");
        assert_eq!(interval_to_cron(120), "0 */2 * * * *");
        assert_eq!(interval_to_cron(7200), "0 0 */2 * * *");
    }

    struct CountingRunner {
        calls: AtomicU32,
    }

    #[async_trait]
    impl LoopRunner for CountingRunner {
        async fn run_loop(&self, _agent_type: AgentType, _trigger: TriggerKind) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        }
    }

    async fn test_scheduler(runner: Arc<dyn LoopRunner>) -> Scheduler {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("test.sqlite3")).await.unwrap();
        let bus = Bus::new(QueueDelays { critical: 0, urgent: 0, high: 0, normal: 0, low: 0, operational: 0 });
        let decisions = Arc::new(DecisionEngine::new(
            store,
            bus.clone(),
            3,
            DecisionTimeouts { operational: 0, minor: 1, major: 1, critical: 1 },
            EscalationTimeouts { low: 1, medium: 1, high: 1 },
        ));
        let container = Arc::new(InMemoryContainerApi::new(vec![]));
        Scheduler::new(runner, container, decisions, bus, 1, Duration::from_secs(5)).await.unwrap()
    }

    #[tokio::test]
    async fn concurrency_cap_of_one_skips_an_overlapping_invocation() {
        let runner = Arc::new(CountingRunner { calls: AtomicU32::new(0) });
        let scheduler = test_scheduler(runner.clone()).await;
        let semaphore = scheduler.semaphores.get(&AgentType::Cto).unwrap().clone();

        let r1 = runner.clone();
        let s1 = semaphore.clone();
        let first = tokio::spawn(async move { run_one_loop(r1, s1, Duration::from_secs(1), AgentType::Cto, TriggerKind::Cadence).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        run_one_loop(runner.clone(), semaphore, Duration::from_secs(1), AgentType::Cto, TriggerKind::EventWakeup).await;
        first.await.unwrap();

        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pause_resume_and_stop_job_require_a_known_id() {
        let runner = Arc::new(CountingRunner { calls: AtomicU32::new(0) });
        let scheduler = test_scheduler(runner).await;
        assert!(scheduler.pause_job("nonexistent").await.is_err());
        assert!(scheduler.resume_job("nonexistent").await.is_err());
        assert!(scheduler.stop_job("nonexistent").await.is_err());
    }

    struct HangingRunner {
        timeouts: AtomicU32,
    }

    #[async_trait]
    impl LoopRunner for HangingRunner {
        async fn run_loop(&self, _agent_type: AgentType, _trigger: TriggerKind) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }

        async fn record_timeout(&self, _agent_type: AgentType) {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn hard_timeout_invokes_record_timeout() {
        let runner = Arc::new(HangingRunner { timeouts: AtomicU32::new(0) });
        let semaphore = Arc::new(Semaphore::new(1));
        run_one_loop(runner.clone(), semaphore, Duration::from_millis(20), AgentType::Cto, TriggerKind::Cadence).await;
        assert_eq!(runner.timeouts.load(Ordering::SeqCst), 1);
    }
}
