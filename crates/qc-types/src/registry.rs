//! Agent registry schemas.
//!
//! These types are the contract between the registry service and its
//! clients (agents and the orchestrator). They are intentionally minimal:
//! a registration, a heartbeat, the stored record, the list envelope, and
//! a stats snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health status of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Responsive and heartbeating.
    #[default]
    Healthy,
    /// Missed heartbeats or self-reported degraded.
    Unhealthy,
}

/// Payload sent by an agent when registering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    /// Unique identifier for the agent.
    pub agent_id: String,

    /// Hostname or IP reachable by the orchestrator.
    pub host: String,

    /// Primary service port exposed by the agent.
    pub port: u16,

    /// Whether the agent is on the hotpath (undeletable without force).
    /// Sticky up: once set, re-registration cannot clear it.
    #[serde(default)]
    pub hotpath: bool,
}

/// Heartbeat payload reported by an agent to indicate liveness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHeartbeat {
    /// Reported health status.
    #[serde(default)]
    pub status: AgentStatus,

    /// Heartbeat timestamp; defaults to receipt time when absent.
    #[serde(default)]
    pub reported_at: Option<DateTime<Utc>>,
}

impl Default for AgentHeartbeat {
    fn default() -> Self {
        Self {
            status: AgentStatus::Healthy,
            reported_at: None,
        }
    }
}

/// Full registry record for an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: String,
    pub host: String,
    pub port: u16,
    pub status: AgentStatus,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub hotpath: bool,
}

impl AgentInfo {
    /// Effective health at `now`: reported healthy AND heartbeat within
    /// `agent_timeout` seconds.
    pub fn is_effectively_healthy(&self, now: DateTime<Utc>, agent_timeout_secs: u64) -> bool {
        if self.status != AgentStatus::Healthy {
            return false;
        }
        match self.last_heartbeat {
            // A heartbeat from the future (clock skew) counts as fresh.
            Some(beat) => {
                now.signed_duration_since(beat).num_seconds() <= agent_timeout_secs as i64
            }
            None => false,
        }
    }
}

/// Response envelope for agent listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentListResponse {
    pub agents: Vec<AgentInfo>,
    #[serde(default)]
    pub healthy_only: bool,
    #[serde(default)]
    pub hotpath_only: bool,
}

/// Aggregate registry statistics snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_agents: usize,
    pub healthy_agents: usize,
    pub unhealthy_agents: usize,
    pub last_updated: DateTime<Utc>,
}
