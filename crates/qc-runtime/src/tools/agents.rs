//! `manage_agents` tool: fleet management against the registry.
//!
//! Spawning registers a fresh agent id and posts the task envelope to the
//! new agent's mailbox; the actual process launch is the platform's
//! concern (containers, supervisors) and out of scope here. Removal goes
//! through the registry so hotpath protection applies.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use qc_fabric::Mailbox;
use qc_registry::RegistryClient;
use qc_types::agent_id::generate_agent_id;
use qc_types::envelope::MessageEnvelope;
use qc_types::registry::AgentRegistration;
use qc_types::QcError;

use qc_engine::state::ChatState;

use super::{Tool, ToolEffects, ToolError, ToolOutcome};

/// The tool.
pub struct ManageAgentsTool {
    registry: RegistryClient,
    mailbox: Mailbox,
    /// Identity used as envelope sender when delegating.
    identity: String,
    /// Host/port advertised for spawned agents.
    spawn_host: String,
    spawn_port: u16,
    /// Hard cap on concurrently healthy agents.
    max_agents: u64,
}

impl ManageAgentsTool {
    pub fn new(
        registry: RegistryClient,
        mailbox: Mailbox,
        identity: impl Into<String>,
        spawn_host: impl Into<String>,
        spawn_port: u16,
        max_agents: u64,
    ) -> Self {
        Self {
            registry,
            mailbox,
            identity: identity.into(),
            spawn_host: spawn_host.into(),
            spawn_port,
            max_agents,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AgentsArgs {
    operation: String,
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    task: Option<String>,
    #[serde(default)]
    hotpath: bool,
    #[serde(default)]
    force: bool,
    #[serde(default)]
    healthy_only: bool,
    #[serde(default)]
    hotpath_only: bool,
}

#[async_trait]
impl Tool for ManageAgentsTool {
    fn name(&self) -> &str {
        "manage_agents"
    }

    fn description(&self) -> &str {
        "Spawn, list, remove, or hotpath-flag worker agents via the registry."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "operation": {
                    "type": "string",
                    "enum": ["spawn_agent", "list_agents", "remove_agent", "set_hotpath"]
                },
                "agent_id": { "type": "string" },
                "task": { "type": "string", "description": "Task text delivered to a spawned agent" },
                "hotpath": { "type": "boolean" },
                "force": { "type": "boolean" },
                "healthy_only": { "type": "boolean" },
                "hotpath_only": { "type": "boolean" }
            },
            "required": ["operation"]
        })
    }

    async fn execute(&self, args: Value, state: &mut ChatState) -> Result<ToolOutcome, ToolError> {
        let args: AgentsArgs =
            serde_json::from_value(args).map_err(|e| ToolError::InvalidArgs(e.to_string()))?;

        match args.operation.as_str() {
            "spawn_agent" => {
                let task = args
                    .task
                    .as_deref()
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| {
                        ToolError::InvalidArgs("task is required when spawning".into())
                    })?;

                let healthy = self
                    .registry
                    .list_agents(true, false)
                    .await
                    .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
                let budget = state
                    .autonomous_settings
                    .as_ref()
                    .map(|s| s.max_agents)
                    .unwrap_or(self.max_agents);
                if healthy.agents.len() as u64 >= budget {
                    return Err(ToolError::Refused(format!(
                        "agent budget exhausted ({budget} healthy agents)"
                    )));
                }

                let agent_id = args.agent_id.unwrap_or_else(generate_agent_id);
                self.registry
                    .register(&AgentRegistration {
                        agent_id: agent_id.clone(),
                        host: self.spawn_host.clone(),
                        port: self.spawn_port,
                        hotpath: args.hotpath,
                    })
                    .await
                    .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

                let envelope = MessageEnvelope::new(&self.identity, &agent_id, task)
                    .with_payload("chat_id", json!(state.chat_id))
                    .with_payload("reply_to", json!([self.identity]));
                self.mailbox
                    .post(&envelope)
                    .await
                    .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

                info!(agent_id = %agent_id, "agent spawned and task delegated");
                state.push_telemetry(
                    "agent_spawned",
                    json!({ "agent_id": agent_id, "hotpath": args.hotpath }),
                );

                Ok(ToolOutcome {
                    output: json!({
                        "status": "success",
                        "agent_id": agent_id,
                        "delegated": true,
                    }),
                    effects: ToolEffects {
                        delegated: true,
                        test_failure: false,
                    },
                })
            }
            "list_agents" => {
                let listed = self
                    .registry
                    .list_agents(args.healthy_only, args.hotpath_only)
                    .await
                    .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
                Ok(ToolOutcome::ok(json!({
                    "status": "success",
                    "agents": listed.agents,
                    "healthy_only": listed.healthy_only,
                    "hotpath_only": listed.hotpath_only,
                })))
            }
            "remove_agent" => {
                let agent_id = args
                    .agent_id
                    .as_deref()
                    .ok_or_else(|| ToolError::InvalidArgs("agent_id is required".into()))?;
                match self.registry.remove_agent(agent_id, args.force).await {
                    Ok(()) => Ok(ToolOutcome::ok(json!({
                        "status": "success",
                        "removed": agent_id,
                    }))),
                    // Hotpath refusal is structured output so the LLM can
                    // decide whether to retry with force.
                    Err(QcError::Schema(reason)) => Ok(ToolOutcome::ok(json!({
                        "status": "rejected",
                        "reason": reason,
                        "agent_id": agent_id,
                    }))),
                    Err(other) => Err(ToolError::ExecutionFailed(other.to_string())),
                }
            }
            "set_hotpath" => {
                let agent_id = args
                    .agent_id
                    .as_deref()
                    .ok_or_else(|| ToolError::InvalidArgs("agent_id is required".into()))?;
                let agent = self
                    .registry
                    .set_hotpath(agent_id, args.hotpath)
                    .await
                    .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
                Ok(ToolOutcome::ok(json!({
                    "status": "success",
                    "agent_id": agent.agent_id,
                    "hotpath": agent.hotpath,
                })))
            }
            other => Err(ToolError::InvalidArgs(format!(
                "unknown operation '{other}'"
            ))),
        }
    }
}
