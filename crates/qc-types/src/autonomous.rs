//! Autonomous-mode routing contracts.
//!
//! When the orchestrator runs without a human in the loop, response
//! routing is governed by an [`AutonomousRoutingDirective`] carried in the
//! payload, bounded by [`AutonomousSettings`] guardrails, and escalations
//! are captured as [`AutonomousEscalation`] records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::wire_timestamp;

/// Routing instructions emitted during autonomous orchestration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AutonomousRoutingDirective {
    /// The orchestrator intends to notify the human (e.g. final report).
    #[serde(default)]
    pub deliver_to_human: bool,

    /// A fatal condition must be escalated to the human.
    #[serde(default)]
    pub escalate: bool,

    /// Short explanation for the delivery/escalation request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Recovery attempts taken before requesting escalation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recovery_attempts: Vec<String>,
}

impl AutonomousRoutingDirective {
    /// Build a directive from an arbitrary payload value.
    ///
    /// Lenient by design: a full strict decode is attempted first; if that
    /// fails, only the recognized fields are retained and decoding is
    /// retried. Returns `None` when nothing usable is present.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let obj = payload.as_object()?;

        if let Ok(directive) = serde_json::from_value::<Self>(payload.clone()) {
            return Some(directive);
        }

        let mut filtered = serde_json::Map::new();
        for field in ["deliver_to_human", "escalate", "reason", "recovery_attempts"] {
            if let Some(value) = obj.get(field) {
                filtered.insert(field.to_string(), value.clone());
            }
        }
        if filtered.is_empty() {
            return None;
        }
        serde_json::from_value(Value::Object(filtered)).ok()
    }

    /// Whether this directive permits routing to the human.
    pub fn wants_human(&self) -> bool {
        self.deliver_to_human || self.escalate
    }
}

/// Guardrail settings for an autonomous run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutonomousSettings {
    /// Hard cap on graph iterations before escalation.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u64,

    /// Hard cap on wall-clock hours before escalation.
    #[serde(default = "default_max_hours")]
    pub max_hours: f64,

    /// Hard cap on concurrently spawned worker agents.
    #[serde(default = "default_max_agents")]
    pub max_agents: u64,
}

impl Default for AutonomousSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_hours: default_max_hours(),
            max_agents: default_max_agents(),
        }
    }
}

fn default_max_iterations() -> u64 {
    50
}

fn default_max_hours() -> f64 {
    4.0
}

fn default_max_agents() -> u64 {
    8
}

/// Escalation event captured when contacting the human.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutonomousEscalation {
    pub error_type: String,
    pub description: String,
    #[serde(default)]
    pub recovery_attempts: Vec<String>,
    #[serde(default = "default_is_fatal")]
    pub is_fatal: bool,
    #[serde(default = "wire_timestamp")]
    pub timestamp: String,
}

fn default_is_fatal() -> bool {
    true
}

/// Control action extracted from an inbound payload, if any.
///
/// Only `emergency_stop` is recognized today; unknown actions are ignored
/// so the wire format can grow without breaking older processes.
pub fn emergency_stop_requested(payload: &serde_json::Map<String, Value>) -> bool {
    payload
        .get("autonomous_control")
        .and_then(Value::as_object)
        .and_then(|control| control.get("action"))
        .and_then(Value::as_str)
        .map(|action| action == "emergency_stop")
        .unwrap_or(false)
}
