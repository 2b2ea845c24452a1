//! HTTP client for the registry surface.
//!
//! Used by runtime processes: registration retries with exponential
//! backoff until the startup timeout (registry unreachable past that is
//! fatal), heartbeats are fire-and-log.

use std::time::Duration;

use reqwest::StatusCode;
use tokio::time::Instant;
use tracing::{debug, warn};

use qc_types::registry::{
    AgentHeartbeat, AgentInfo, AgentListResponse, AgentRegistration, RegistryStats,
};
use qc_types::{QcError, Result};

/// Initial backoff between registration attempts.
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Backoff ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Client for the registry HTTP surface.
#[derive(Clone)]
pub struct RegistryClient {
    base_url: String,
    http: reqwest::Client,
}

impl RegistryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// One registration attempt.
    pub async fn register(&self, registration: &AgentRegistration) -> Result<()> {
        let response = self
            .http
            .post(self.url("/agents/register"))
            .json(registration)
            .send()
            .await
            .map_err(|e| QcError::RegistryTransport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(QcError::RegistryTransport(format!(
                "register returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Register with exponential backoff until `startup_timeout` elapses.
    ///
    /// Past the deadline the error is fatal: the process is expected to
    /// exit non-zero and be restarted by orchestration.
    pub async fn register_with_retry(
        &self,
        registration: &AgentRegistration,
        startup_timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + startup_timeout;
        let mut backoff = INITIAL_BACKOFF;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            match self.register(registration).await {
                Ok(()) => {
                    debug!(agent_id = %registration.agent_id, attempts, "registration accepted");
                    return Ok(());
                }
                Err(err) if Instant::now() + backoff < deadline => {
                    warn!(
                        agent_id = %registration.agent_id,
                        attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "registration failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(err) => {
                    return Err(QcError::RegistryUnreachable(format!(
                        "{} after {attempts} attempts: {err}",
                        self.base_url
                    )));
                }
            }
        }
    }

    /// Send a heartbeat. `Ok(false)` means the registry no longer knows
    /// this agent (re-registration is warranted).
    pub async fn heartbeat(&self, agent_id: &str, heartbeat: &AgentHeartbeat) -> Result<bool> {
        let response = self
            .http
            .post(self.url(&format!("/agents/{agent_id}/heartbeat")))
            .json(heartbeat)
            .send()
            .await
            .map_err(|e| QcError::RegistryTransport(e.to_string()))?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(QcError::RegistryTransport(format!(
                "heartbeat returned {status}"
            ))),
        }
    }

    /// List agents with optional filters.
    pub async fn list_agents(
        &self,
        healthy_only: bool,
        hotpath_only: bool,
    ) -> Result<AgentListResponse> {
        let response = self
            .http
            .get(self.url("/agents"))
            .query(&[
                ("healthy_only", healthy_only),
                ("hotpath_only", hotpath_only),
            ])
            .send()
            .await
            .map_err(|e| QcError::RegistryTransport(e.to_string()))?;
        response
            .json()
            .await
            .map_err(|e| QcError::RegistryTransport(e.to_string()))
    }

    /// Fetch one record; `Ok(None)` for 404.
    pub async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentInfo>> {
        let response = self
            .http
            .get(self.url(&format!("/agents/{agent_id}")))
            .send()
            .await
            .map_err(|e| QcError::RegistryTransport(e.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        response
            .json()
            .await
            .map(Some)
            .map_err(|e| QcError::RegistryTransport(e.to_string()))
    }

    /// Remove a record. `hotpath_agent` conflicts surface as a
    /// [`QcError::Tool`]-shaped schema error so callers can report them to
    /// the LLM verbatim.
    pub async fn remove_agent(&self, agent_id: &str, force: bool) -> Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("/agents/{agent_id}")))
            .query(&[("force", force)])
            .send()
            .await
            .map_err(|e| QcError::RegistryTransport(e.to_string()))?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::CONFLICT => Err(QcError::Schema("hotpath_agent".into())),
            StatusCode::NOT_FOUND => Err(QcError::Schema("agent_not_found".into())),
            status => Err(QcError::RegistryTransport(format!(
                "remove returned {status}"
            ))),
        }
    }

    /// Flip the hotpath flag on a record.
    pub async fn set_hotpath(&self, agent_id: &str, hotpath: bool) -> Result<AgentInfo> {
        let response = self
            .http
            .post(self.url(&format!("/agents/{agent_id}/hotpath")))
            .json(&serde_json::json!({ "hotpath": hotpath }))
            .send()
            .await
            .map_err(|e| QcError::RegistryTransport(e.to_string()))?;
        match response.status() {
            status if status.is_success() => response
                .json()
                .await
                .map_err(|e| QcError::RegistryTransport(e.to_string())),
            StatusCode::NOT_FOUND => Err(QcError::Schema("agent_not_found".into())),
            status => Err(QcError::RegistryTransport(format!(
                "set_hotpath returned {status}"
            ))),
        }
    }

    /// Aggregate stats snapshot.
    pub async fn stats(&self) -> Result<RegistryStats> {
        let response = self
            .http
            .get(self.url("/stats"))
            .send()
            .await
            .map_err(|e| QcError::RegistryTransport(e.to_string()))?;
        response
            .json()
            .await
            .map_err(|e| QcError::RegistryTransport(e.to_string()))
    }
}
