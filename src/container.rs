//! Container API (§6): pluggable process/container lifecycle used by the
//! scheduler's health-check job. Grounded in the same duck-typed
//! collaborator shape as [`crate::llm::session::BackendFactory`] and
//! [`crate::cache::MarketDataSource`] — a trait plus a test double, with
//! the real Docker/Portainer/Kubernetes backend left for deployment-time
//! wiring.

use async_trait::async_trait;

use crate::agent::AgentType;
use crate::error::Result;

#[async_trait]
pub trait ContainerApi: Send + Sync {
    async fn start(&self, agent_type: AgentType, env: &[(String, String)]) -> Result<String>;
    async fn stop(&self, handle: &str) -> Result<()>;
    async fn restart(&self, handle: &str) -> Result<()>;
    async fn list_unhealthy(&self) -> Result<Vec<String>>;
}

/// No-op backend for deployments with no container runtime to manage:
/// agents run as plain long-lived processes, so there is nothing to
/// start/stop/restart and nothing is ever reported unhealthy.
pub struct NoopContainerApi;

#[async_trait]
impl ContainerApi for NoopContainerApi {
    async fn start(&self, agent_type: AgentType, _env: &[(String, String)]) -> Result<String> {
        Ok(format!("noop-{agent_type}"))
    }

    async fn stop(&self, _handle: &str) -> Result<()> {
        Ok(())
    }

    async fn restart(&self, _handle: &str) -> Result<()> {
        Ok(())
    }

    async fn list_unhealthy(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
pub struct InMemoryContainerApi {
    pub unhealthy: std::sync::Mutex<Vec<String>>,
    pub restarted: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl InMemoryContainerApi {
    pub fn new(unhealthy: Vec<String>) -> Self {
        Self {
            unhealthy: std::sync::Mutex::new(unhealthy),
            restarted: std::sync::Mutex::new(Vec::new()),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl ContainerApi for InMemoryContainerApi {
    async fn start(&self, agent_type: AgentType, _env: &[(String, String)]) -> Result<String> {
        Ok(format!("handle-{agent_type}"))
    }

    async fn stop(&self, _handle: &str) -> Result<()> {
        Ok(())
    }

    async fn restart(&self, handle: &str) -> Result<()> {
        self.restarted.lock().unwrap().push(handle.to_string());
        self.unhealthy.lock().unwrap().retain(|h| h != handle);
        Ok(())
    }

    async fn list_unhealthy(&self) -> Result<Vec<String>> {
        Ok(self.unhealthy.lock().unwrap().clone())
    }
}
