//! Tool surface: trait, registry, and dispatch.
//!
//! Tools mutate chat state directly (ledger operations, test evidence)
//! and/or perform external side effects (registry writes, workspace
//! commands, mailbox posts). Failures are reported back to the LLM as
//! tool output with `status: "failed"`; they do not abort the graph.

pub mod agents;
pub mod ledger;
pub mod testing;
pub mod workspace;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, error};

use qc_engine::state::ChatState;
use qc_types::exhaustion::ExhaustionMode;

use crate::driver::ToolSchema;

/// Error type for tool execution.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// The requested tool was not found in the registry.
    #[error("tool not found: {0}")]
    NotFound(String),

    /// The arguments provided to the tool are invalid.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// The tool execution failed at runtime.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// The operation was refused by policy (hotpath protection, agent
    /// budget, review gate).
    #[error("refused: {0}")]
    Refused(String),
}

/// Side effects a tool reports back to the runtime beyond its output.
#[derive(Debug, Clone, Default)]
pub struct ToolEffects {
    /// The tool dispatched work to peer agents; the runtime should hold
    /// the human-facing reply until those agents respond.
    pub delegated: bool,
    /// Tests failed during this call; the exhaustion classifier routes
    /// the next transition through hypothesize.
    pub test_failure: bool,
}

/// Output + effects of one tool call.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub output: Value,
    pub effects: ToolEffects,
}

impl ToolOutcome {
    pub fn ok(output: Value) -> Self {
        Self {
            output,
            effects: ToolEffects::default(),
        }
    }
}

/// A tool callable by the LLM.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Registry name (what the LLM calls).
    fn name(&self) -> &str;

    /// One-line description for the schema advertisement.
    fn description(&self) -> &str;

    /// JSON schema of the arguments object.
    fn schema(&self) -> Value;

    /// Execute against the chat state.
    async fn execute(&self, args: Value, state: &mut ChatState) -> Result<ToolOutcome, ToolError>;
}

/// Holds registered tools and dispatches execution requests by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool; later registrations with the same name win.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        debug!(tool = tool.name(), "tool registered");
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Schema advertisements for the driver.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools
            .values()
            .map(|tool| ToolSchema {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.schema(),
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Dispatch one call. Errors become `status: "failed"` output for the
    /// LLM and set the test-failure effect so the exhaustion classifier
    /// reacts; they never propagate.
    pub async fn dispatch(&self, name: &str, args: Value, state: &mut ChatState) -> ToolOutcome {
        let Some(tool) = self.tools.get(name) else {
            return ToolOutcome {
                output: json!({
                    "status": "failed",
                    "error": format!("tool not found: {name}"),
                }),
                effects: ToolEffects::default(),
            };
        };

        match tool.execute(args, state).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(tool = name, error = %err, "tool execution failed");
                let stderr_snippet: String = err.to_string().chars().take(400).collect();
                state.exhaustion_mode = ExhaustionMode::TestFailure;
                ToolOutcome {
                    output: json!({
                        "status": "failed",
                        "error": stderr_snippet,
                    }),
                    effects: ToolEffects {
                        delegated: false,
                        test_failure: true,
                    },
                }
            }
        }
    }
}
