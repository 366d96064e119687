//! LLM Session Pool (C6): one long-lived session per agent type,
//! exactly-once profile injection, single-in-flight enforcement, and
//! age/error/loop-count recycling (§4.6).
//!
//! `orchestrator::session::SessionManager` persists conversation state
//! to disk across process restarts; this pool needs a live in-memory
//! state machine over a running child process instead, so only the
//! module's name and its `tempfile`-backed test style carry over — the
//! implementation is new, grounded in the session lifecycle's state
//! diagram.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::AgentType;
use crate::error::{AgencyError, Result};

use super::protocol::{decode_line, encode, InboundFrame, OutboundFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Idle,
    Busy,
    Error,
    Recycling,
}

/// A session's process backend: starts a child process, speaks the
/// newline-delimited JSON protocol (§4.6), and reports liveness. Tests
/// supply a hand-rolled fake instead of a real subprocess.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn send(&self, content: &str, session_id: Option<&str>) -> Result<String>;
    async fn is_alive(&self) -> bool;
    async fn stop(&self);
}

/// Spawns the provider CLI over stdio with `stream-json` in/out and a
/// permissions-skip flag, per §4.6.
pub struct ChildProcessBackend {
    command: String,
    args: Vec<String>,
    child: Mutex<Option<Child>>,
    alive: AtomicBool,
}

impl ChildProcessBackend {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            child: Mutex::new(None),
            alive: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl SessionBackend for ChildProcessBackend {
    async fn start(&self) -> Result<()> {
        let child = Command::new(&self.command)
            .args(&self.args)
            .arg("--input-format")
            .arg("stream-json")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--permissions-skip")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| AgencyError::Transient(format!("failed to spawn provider process: {e}")))?;
        *self.child.lock().await = Some(child);
        self.alive.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, content: &str, session_id: Option<&str>) -> Result<String> {
        let mut guard = self.child.lock().await;
        let child = guard.as_mut().ok_or(AgencyError::SessionDead)?;
        let stdin = child.stdin.as_mut().ok_or(AgencyError::SessionDead)?;
        let frame = OutboundFrame::User { content: content.to_string(), session_id: session_id.map(str::to_string) };
        let line = encode(&frame)?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|_| AgencyError::SessionDead)?;

        let stdout = child.stdout.take().ok_or(AgencyError::SessionDead)?;
        let mut reader = BufReader::new(stdout).lines();
        let result = loop {
            match reader.next_line().await {
                Ok(Some(line)) => match decode_line(&line) {
                    Some(InboundFrame::Result { content, .. }) => break Ok(content),
                    _ => continue,
                },
                Ok(None) => break Err(AgencyError::SessionDead),
                Err(_) => break Err(AgencyError::SessionDead),
            }
        };
        child.stdout = Some(reader.into_inner().into_inner());
        if result.is_err() {
            self.alive.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            let _ = child.kill().await;
        }
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// One long-lived conversational session, owned exclusively by the pool.
pub struct Session {
    pub id: String,
    pub agent_type: AgentType,
    state: RwLock<SessionState>,
    loop_count: AtomicU32,
    profile_injected: AtomicBool,
    last_activity_at: RwLock<Instant>,
    backend: Arc<dyn SessionBackend>,
    in_flight: Mutex<()>,
}

impl Session {
    async fn new(agent_type: AgentType, backend: Arc<dyn SessionBackend>) -> Result<Arc<Self>> {
        let session = Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            agent_type,
            state: RwLock::new(SessionState::Starting),
            loop_count: AtomicU32::new(0),
            profile_injected: AtomicBool::new(false),
            last_activity_at: RwLock::new(Instant::now()),
            backend,
            in_flight: Mutex::new(()),
        });
        match session.backend.start().await {
            Ok(()) => *session.state.write().await = SessionState::Idle,
            Err(e) => {
                *session.state.write().await = SessionState::Error;
                return Err(e);
            }
        }
        Ok(session)
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    /// Profile injection is performed exactly once per session;
    /// subsequent calls short-circuit (§4.6).
    pub async fn inject_profile(&self, profile: &str) -> Result<()> {
        if self.profile_injected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.backend.send(profile, Some(&self.id)).await.map(|_| ())
    }

    /// Enforces single in-flight: a second call while busy fails fast
    /// with [`AgencyError::SessionBusy`] (§8 property 1: must fail
    /// within <=50ms, which `try_lock` guarantees since it never waits).
    pub async fn send_message(&self, prompt: &str, timeout: Duration) -> Result<String> {
        let _permit = self.in_flight.try_lock().map_err(|_| AgencyError::SessionBusy)?;
        *self.state.write().await = SessionState::Busy;

        let result = tokio::time::timeout(timeout, self.backend.send(prompt, Some(&self.id))).await;

        *self.last_activity_at.write().await = Instant::now();
        match result {
            Ok(Ok(output)) => {
                self.loop_count.fetch_add(1, Ordering::SeqCst);
                *self.state.write().await = SessionState::Idle;
                Ok(output)
            }
            Ok(Err(e)) => {
                *self.state.write().await = SessionState::Error;
                Err(e)
            }
            Err(_) => {
                *self.state.write().await = SessionState::Error;
                Err(AgencyError::ProviderTimeout(timeout.as_millis() as u64))
            }
        }
    }

    /// `true` when `loopCount >= maxLoops`, state is `error`, or the
    /// child process is dead (§4.6).
    pub async fn should_recycle(&self, max_loops: u32) -> bool {
        self.loop_count.load(Ordering::SeqCst) >= max_loops
            || self.state().await == SessionState::Error
            || !self.backend.is_alive().await
    }

    pub async fn stop(&self) {
        *self.state.write().await = SessionState::Recycling;
        self.backend.stop().await;
    }
}

/// Factory for a fresh backend per agent type, supplied at pool
/// construction so tests can inject fakes without touching real
/// subprocesses.
pub trait BackendFactory: Send + Sync {
    fn create(&self, agent_type: AgentType) -> Arc<dyn SessionBackend>;
}

/// Maps each agent type to a provider CLI command, matching the
/// `agent-role` routing default (ceo/dao/cto on claude, the rest on
/// gemini), and spawns a fresh [`ChildProcessBackend`] per session.
pub struct ProviderCliBackendFactory {
    claude_command: String,
    gemini_command: String,
    mcp_config_path: Option<String>,
}

impl ProviderCliBackendFactory {
    pub fn new(claude_command: impl Into<String>, gemini_command: impl Into<String>, mcp_config_path: Option<String>) -> Self {
        Self {
            claude_command: claude_command.into(),
            gemini_command: gemini_command.into(),
            mcp_config_path,
        }
    }

    fn command_for(&self, agent_type: AgentType) -> &str {
        match agent_type {
            AgentType::Ceo | AgentType::Dao | AgentType::Cto => &self.claude_command,
            _ => &self.gemini_command,
        }
    }
}

impl BackendFactory for ProviderCliBackendFactory {
    fn create(&self, agent_type: AgentType) -> Arc<dyn SessionBackend> {
        let mut args = Vec::new();
        if let Some(path) = &self.mcp_config_path {
            args.push("--mcp-config".to_string());
            args.push(path.clone());
        }
        Arc::new(ChildProcessBackend::new(self.command_for(agent_type), args))
    }
}

/// Owns at most one [`Session`] per agent type (§3 invariant (a)).
/// Cross-agent calls run in parallel; within one agent type, calls are
/// serialised through that session's `in_flight` lock.
pub struct SessionPool {
    sessions: RwLock<HashMap<AgentType, Arc<Session>>>,
    factory: Arc<dyn BackendFactory>,
    max_loops: u32,
    /// Bounds "start process, wait for readiness" (§4.6).
    start_timeout: Duration,
    /// Bounds "inject profile, await profile-ack" (§4.6) — the initial
    /// handshake that follows a successful start.
    connect_timeout: Duration,
}

impl SessionPool {
    pub fn new(factory: Arc<dyn BackendFactory>, max_loops: u32) -> Self {
        Self::with_timeouts(factory, max_loops, Duration::from_secs(60), Duration::from_secs(2))
    }

    pub fn with_timeouts(factory: Arc<dyn BackendFactory>, max_loops: u32, start_timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            factory,
            max_loops,
            start_timeout,
            connect_timeout,
        }
    }

    /// Returns the existing healthy session or synchronously creates
    /// one: start process, wait for readiness, inject profile once,
    /// await profile-ack (§4.6).
    pub async fn get_session(&self, agent_type: AgentType, profile: &str) -> Result<Arc<Session>> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(&agent_type) {
                if !session.should_recycle(self.max_loops).await {
                    return Ok(session.clone());
                }
            }
        }

        let mut sessions = self.sessions.write().await;
        if let Some(stale) = sessions.remove(&agent_type) {
            info!(agent_type = %agent_type, "recycling stale session");
            stale.stop().await;
        }

        let backend = self.factory.create(agent_type);
        let session = tokio::time::timeout(self.start_timeout, Session::new(agent_type, backend))
            .await
            .map_err(|_| AgencyError::ProviderTimeout(self.start_timeout.as_millis() as u64))??;
        tokio::time::timeout(self.connect_timeout, session.inject_profile(profile))
            .await
            .map_err(|_| AgencyError::ProviderTimeout(self.connect_timeout.as_millis() as u64))??;
        sessions.insert(agent_type, session.clone());
        Ok(session)
    }

    /// Forces the next [`Self::get_session`] call for `agent_type` to
    /// start a fresh process, regardless of `max_loops` (§4.8: a
    /// hard-timed-out loop may have left the underlying process wedged).
    pub async fn force_recycle(&self, agent_type: AgentType) {
        let stale = self.sessions.write().await.remove(&agent_type);
        if let Some(stale) = stale {
            info!(agent_type = %agent_type, "recycling session after hard timeout");
            stale.stop().await;
        }
    }

    pub async fn stop_all(&self) {
        let mut sessions = self.sessions.write().await;
        for (_, session) in sessions.drain() {
            session.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as TestCounter;

    struct FakeBackend {
        calls: TestCounter,
        alive: AtomicBool,
    }

    impl FakeBackend {
        fn new() -> Self {
            Self { calls: TestCounter::new(0), alive: AtomicBool::new(true) }
        }
    }

    #[async_trait]
    impl SessionBackend for FakeBackend {
        async fn start(&self) -> Result<()> {
            Ok(())
        }

        async fn send(&self, content: &str, _session_id: Option<&str>) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("echo: {content}"))
        }

        async fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn stop(&self) {
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    struct FakeFactory;

    impl BackendFactory for FakeFactory {
        fn create(&self, _agent_type: AgentType) -> Arc<dyn SessionBackend> {
            Arc::new(FakeBackend::new())
        }
    }

    #[tokio::test]
    async fn profile_injection_is_idempotent() {
        let backend = Arc::new(FakeBackend::new());
        let session = Session::new(AgentType::Cmo, backend.clone()).await.unwrap();
        session.inject_profile("profile text").await.unwrap();
        session.inject_profile("profile text").await.unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_concurrent_send_fails_fast_as_busy() {
        let backend = Arc::new(FakeBackend::new());
        let session = Arc::new(Session::new(AgentType::Cto, backend).await.unwrap());

        let s1 = session.clone();
        let first = tokio::spawn(async move { s1.send_message("long task", Duration::from_millis(200)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = session.send_message("interrupt", Duration::from_millis(200)).await;
        assert!(matches!(second, Err(AgencyError::SessionBusy)));
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn recycles_after_max_loops_with_a_fresh_process_handle() {
        let pool = SessionPool::new(Arc::new(FakeFactory), 2);
        let first = pool.get_session(AgentType::Ceo, "profile").await.unwrap();
        first.send_message("one", Duration::from_secs(1)).await.unwrap();
        first.send_message("two", Duration::from_secs(1)).await.unwrap();
        assert!(first.should_recycle(2).await);

        let second = pool.get_session(AgentType::Ceo, "profile").await.unwrap();
        assert_ne!(first.id, second.id);
    }
}
