//! Registry service layer.
//!
//! Applies the rules the raw store does not know about: effective health
//! is recomputed at request time from `agent_timeout`, and hotpath records
//! refuse removal without `force`.

use chrono::Utc;
use tracing::info;

use qc_types::registry::{
    AgentHeartbeat, AgentInfo, AgentListResponse, AgentRegistration, RegistryStats,
};

use crate::error::RegistryError;
use crate::store::AgentStore;

/// Business rules over the [`AgentStore`].
pub struct RegistryService {
    store: AgentStore,
    agent_timeout_secs: u64,
}

impl RegistryService {
    pub fn new(store: AgentStore, agent_timeout_secs: u64) -> Self {
        Self {
            store,
            agent_timeout_secs,
        }
    }

    /// Register (or refresh) an agent. Idempotent on `agent_id`.
    pub async fn register(&self, registration: &AgentRegistration) -> Result<AgentInfo, RegistryError> {
        let now = Utc::now();
        self.store.upsert_agent(registration, now).await?;
        info!(
            agent_id = %registration.agent_id,
            host = %registration.host,
            port = registration.port,
            hotpath = registration.hotpath,
            "agent registered"
        );
        self.store
            .fetch_agent(&registration.agent_id)
            .await?
            .ok_or(RegistryError::NotFound)
    }

    /// Record a heartbeat. Returns `false` for unknown agents.
    pub async fn heartbeat(
        &self,
        agent_id: &str,
        heartbeat: &AgentHeartbeat,
    ) -> Result<bool, RegistryError> {
        let at = heartbeat.reported_at.unwrap_or_else(Utc::now);
        self.store.update_heartbeat(agent_id, heartbeat.status, at).await
    }

    /// List agents, recomputing effective health when filtering.
    pub async fn list_agents(
        &self,
        healthy_only: bool,
        hotpath_only: bool,
    ) -> Result<AgentListResponse, RegistryError> {
        let mut agents = self.store.fetch_agents(hotpath_only).await?;
        if healthy_only {
            let now = Utc::now();
            agents.retain(|agent| agent.is_effectively_healthy(now, self.agent_timeout_secs));
        }
        Ok(AgentListResponse {
            agents,
            healthy_only,
            hotpath_only,
        })
    }

    /// Fetch a single record.
    pub async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentInfo>, RegistryError> {
        self.store.fetch_agent(agent_id).await
    }

    /// Remove a record. Hotpath records require `force=true`.
    pub async fn remove_agent(&self, agent_id: &str, force: bool) -> Result<(), RegistryError> {
        if let Some(agent) = self.store.fetch_agent(agent_id).await? {
            if agent.hotpath && !force {
                return Err(RegistryError::HotpathAgent);
            }
        }
        if self.store.delete_agent(agent_id).await? {
            info!(agent_id, force, "agent removed");
            Ok(())
        } else {
            Err(RegistryError::NotFound)
        }
    }

    /// Flip the hotpath flag on an existing record.
    pub async fn set_hotpath(&self, agent_id: &str, hotpath: bool) -> Result<AgentInfo, RegistryError> {
        if !self.store.set_hotpath(agent_id, hotpath).await? {
            return Err(RegistryError::NotFound);
        }
        self.store
            .fetch_agent(agent_id)
            .await?
            .ok_or(RegistryError::NotFound)
    }

    /// Aggregate snapshot.
    pub async fn stats(&self) -> Result<RegistryStats, RegistryError> {
        let agents = self.store.fetch_agents(false).await?;
        let now = Utc::now();
        let healthy = agents
            .iter()
            .filter(|agent| agent.is_effectively_healthy(now, self.agent_timeout_secs))
            .count();
        Ok(RegistryStats {
            total_agents: agents.len(),
            healthy_agents: healthy,
            unhealthy_agents: agents.len() - healthy,
            last_updated: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use qc_types::registry::AgentStatus;

    fn registration(agent_id: &str, hotpath: bool) -> AgentRegistration {
        AgentRegistration {
            agent_id: agent_id.into(),
            host: "10.0.0.5".into(),
            port: 9200,
            hotpath,
        }
    }

    async fn service() -> (RegistryService, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = AgentStore::open(dir.path().join("agents.db")).await.unwrap();
        (RegistryService::new(store, 60), dir)
    }

    #[tokio::test]
    async fn register_twice_same_post_state() {
        let (service, _dir) = service().await;
        let first = service.register(&registration("agent-00000001", false)).await.unwrap();
        let second = service.register(&registration("agent-00000001", false)).await.unwrap();

        assert_eq!(first.agent_id, second.agent_id);
        assert_eq!(first.host, second.host);
        assert_eq!(first.port, second.port);
        assert_eq!(first.status, second.status);
        assert_eq!(first.hotpath, second.hotpath);
    }

    #[tokio::test]
    async fn healthy_only_filters_stale_heartbeats() {
        let (service, _dir) = service().await;
        service.register(&registration("agent-00000001", false)).await.unwrap();
        service.register(&registration("agent-00000002", false)).await.unwrap();

        // Push one agent's heartbeat past the timeout by reporting an old
        // time onto a record whose heartbeat we first clear via direct
        // unhealthy status.
        let stale = AgentHeartbeat {
            status: AgentStatus::Unhealthy,
            reported_at: Some(Utc::now()),
        };
        service.heartbeat("agent-00000002", &stale).await.unwrap();

        let listed = service.list_agents(true, false).await.unwrap();
        assert!(listed.healthy_only);
        assert_eq!(listed.agents.len(), 1);
        assert_eq!(listed.agents[0].agent_id, "agent-00000001");
    }

    #[tokio::test]
    async fn remove_hotpath_requires_force() {
        let (service, _dir) = service().await;
        service.register(&registration("alpha", true)).await.unwrap();

        let err = service.remove_agent("alpha", false).await.unwrap_err();
        assert!(matches!(err, RegistryError::HotpathAgent));
        assert!(service.get_agent("alpha").await.unwrap().is_some(), "record remains");

        service.remove_agent("alpha", true).await.unwrap();
        assert!(service.get_agent("alpha").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_missing_is_not_found() {
        let (service, _dir) = service().await;
        let err = service.remove_agent("agent-ffffffff", false).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound));
    }

    #[tokio::test]
    async fn hotpath_listing_after_reregistration() {
        let (service, _dir) = service().await;
        service.register(&registration("alpha", true)).await.unwrap();
        service.remove_agent("alpha", true).await.unwrap();
        // Fresh registration without hotpath: flag starts clear again.
        service.register(&registration("alpha", false)).await.unwrap();
        service.register(&registration("beta", true)).await.unwrap();

        let hot = service.list_agents(false, true).await.unwrap();
        assert_eq!(hot.agents.len(), 1);
        assert_eq!(hot.agents[0].agent_id, "beta");
    }

    #[tokio::test]
    async fn stats_snapshot_counts() {
        let (service, _dir) = service().await;
        service.register(&registration("agent-00000001", false)).await.unwrap();
        service.register(&registration("agent-00000002", false)).await.unwrap();
        let unhealthy = AgentHeartbeat {
            status: AgentStatus::Unhealthy,
            reported_at: Some(Utc::now()),
        };
        service.heartbeat("agent-00000002", &unhealthy).await.unwrap();

        let stats = service.stats().await.unwrap();
        assert_eq!(stats.total_agents, 2);
        assert_eq!(stats.healthy_agents, 1);
        assert_eq!(stats.unhealthy_agents, 1);
    }

    #[tokio::test]
    async fn heartbeat_monotonic_per_agent() {
        let (service, _dir) = service().await;
        service.register(&registration("agent-00000001", false)).await.unwrap();

        let t1 = Utc::now() + Duration::seconds(5);
        let t0 = Utc::now();
        service
            .heartbeat(
                "agent-00000001",
                &AgentHeartbeat { status: AgentStatus::Healthy, reported_at: Some(t1) },
            )
            .await
            .unwrap();
        service
            .heartbeat(
                "agent-00000001",
                &AgentHeartbeat { status: AgentStatus::Healthy, reported_at: Some(t0) },
            )
            .await
            .unwrap();

        let agent = service.get_agent("agent-00000001").await.unwrap().unwrap();
        assert!(agent.last_heartbeat.unwrap() >= t1 - Duration::seconds(1));
    }
}
