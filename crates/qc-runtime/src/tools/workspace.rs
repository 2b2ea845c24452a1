//! Workspace tools.
//!
//! The core treats workspaces as opaque: a [`WorkspaceBackend`] provisions
//! them and runs commands; the tools translate between LLM arguments,
//! backend calls, chat state, and the per-workspace event stream. A
//! process-local backend is provided for development and tests.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use qc_engine::state::ChatState;
use qc_engine::workspace_integrity;
use qc_fabric::Mailbox;
use qc_types::envelope::{workspace_events_stream, wire_timestamp, MessageEnvelope};
use qc_types::workspace::{
    collect_environment_keys, normalize_workspace_name, WorkspaceCommandResult,
    WorkspaceCopyResult, WorkspaceDescriptor, DEFAULT_WORKSPACE_MOUNT,
};

use super::{Tool, ToolError, ToolOutcome};

/// Provisions workspaces and executes commands in them.
#[async_trait]
pub trait WorkspaceBackend: Send + Sync {
    async fn create(&self, workspace_id: &str) -> Result<WorkspaceDescriptor, ToolError>;

    async fn exec(
        &self,
        workspace: &WorkspaceDescriptor,
        command: &str,
        working_dir: Option<&str>,
        env: &BTreeMap<String, String>,
    ) -> Result<WorkspaceCommandResult, ToolError>;

    async fn copy_to(
        &self,
        workspace: &WorkspaceDescriptor,
        source: &str,
        destination: &str,
    ) -> Result<WorkspaceCopyResult, ToolError>;

    async fn copy_from(
        &self,
        workspace: &WorkspaceDescriptor,
        source: &str,
        destination: &str,
    ) -> Result<WorkspaceCopyResult, ToolError>;

    async fn destroy(
        &self,
        workspace: &WorkspaceDescriptor,
        delete_volume: bool,
    ) -> Result<(), ToolError>;
}

/// Backend that runs workspaces as plain directories with shell commands
/// on the local host. Suitable for development and tests; production
/// deployments plug in a container backend.
pub struct LocalWorkspaceBackend {
    root: PathBuf,
}

impl LocalWorkspaceBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn host_path(&self, descriptor: &WorkspaceDescriptor) -> PathBuf {
        descriptor
            .extra
            .get("host_path")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .unwrap_or_else(|| self.root.join(&descriptor.workspace_id))
    }
}

#[async_trait]
impl WorkspaceBackend for LocalWorkspaceBackend {
    async fn create(&self, workspace_id: &str) -> Result<WorkspaceDescriptor, ToolError> {
        let slug = normalize_workspace_name(workspace_id)
            .map_err(|e| ToolError::InvalidArgs(e.to_string()))?;
        let host_path = self.root.join(&slug);
        tokio::fs::create_dir_all(&host_path)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        let mut extra = BTreeMap::new();
        extra.insert(
            "host_path".to_string(),
            Value::String(host_path.display().to_string()),
        );
        Ok(WorkspaceDescriptor {
            workspace_id: workspace_id.to_string(),
            volume: format!("qc-vol-{slug}"),
            container: format!("qc-ws-{slug}"),
            mount_path: DEFAULT_WORKSPACE_MOUNT.to_string(),
            image: "local/dir".to_string(),
            created_at: wire_timestamp(),
            extra,
        })
    }

    async fn exec(
        &self,
        workspace: &WorkspaceDescriptor,
        command: &str,
        working_dir: Option<&str>,
        env: &BTreeMap<String, String>,
    ) -> Result<WorkspaceCommandResult, ToolError> {
        let base = self.host_path(workspace);
        let cwd = match working_dir {
            Some(dir) if dir != DEFAULT_WORKSPACE_MOUNT => base.join(dir.trim_start_matches('/')),
            _ => base,
        };

        let started = Utc::now();
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&cwd)
            .envs(env)
            .output()
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        let finished = Utc::now();

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        Ok(WorkspaceCommandResult {
            workspace: workspace.clone(),
            command: command.to_string(),
            working_dir: working_dir.unwrap_or(DEFAULT_WORKSPACE_MOUNT).to_string(),
            environment_keys: collect_environment_keys(Some(env)),
            started_at: started.to_rfc3339(),
            finished_at: finished.to_rfc3339(),
            duration_seconds: (finished - started).num_milliseconds() as f64 / 1000.0,
            returncode: output.status.code().unwrap_or(-1),
            stdout_bytes: stdout.len(),
            stderr_bytes: stderr.len(),
            stdout,
            stderr,
        })
    }

    async fn copy_to(
        &self,
        workspace: &WorkspaceDescriptor,
        source: &str,
        destination: &str,
    ) -> Result<WorkspaceCopyResult, ToolError> {
        let target = self
            .host_path(workspace)
            .join(destination.trim_start_matches('/'));
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        }
        let bytes = tokio::fs::copy(source, &target)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(WorkspaceCopyResult {
            workspace: workspace.clone(),
            source: source.to_string(),
            destination: destination.to_string(),
            bytes_transferred: Some(bytes),
        })
    }

    async fn copy_from(
        &self,
        workspace: &WorkspaceDescriptor,
        source: &str,
        destination: &str,
    ) -> Result<WorkspaceCopyResult, ToolError> {
        let origin = self.host_path(workspace).join(source.trim_start_matches('/'));
        let bytes = tokio::fs::copy(&origin, destination)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(WorkspaceCopyResult {
            workspace: workspace.clone(),
            source: source.to_string(),
            destination: destination.to_string(),
            bytes_transferred: Some(bytes),
        })
    }

    async fn destroy(
        &self,
        workspace: &WorkspaceDescriptor,
        delete_volume: bool,
    ) -> Result<(), ToolError> {
        if delete_volume {
            let path = self.host_path(workspace);
            if path.exists() {
                tokio::fs::remove_dir_all(&path)
                    .await
                    .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
            }
        }
        Ok(())
    }
}

/// One tool covering the workspace operation set.
pub struct WorkspaceTool {
    backend: Arc<dyn WorkspaceBackend>,
    mailbox: Mailbox,
    identity: String,
}

impl WorkspaceTool {
    pub fn new(
        backend: Arc<dyn WorkspaceBackend>,
        mailbox: Mailbox,
        identity: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            mailbox,
            identity: identity.into(),
        }
    }

    async fn publish_event(&self, workspace_id: &str, event: &str, payload: Value) {
        let envelope = MessageEnvelope::new(&self.identity, "workspace-events", event)
            .with_payload("workspace_id", json!(workspace_id))
            .with_payload("event", payload);
        // Event publication is best effort; failures are logged upstream.
        let _ = self
            .mailbox
            .post_to_stream(&workspace_events_stream(workspace_id), &envelope)
            .await;
    }

    fn current_workspace(state: &ChatState) -> Result<WorkspaceDescriptor, ToolError> {
        state
            .workspace
            .clone()
            .ok_or_else(|| ToolError::InvalidArgs("no workspace attached to this chat".into()))
    }
}

#[derive(Debug, Deserialize)]
struct WorkspaceArgs {
    operation: String,
    #[serde(default)]
    workspace_id: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    destination: Option<String>,
    #[serde(default)]
    delete_volume: bool,
    #[serde(default)]
    auto_restore: bool,
}

#[async_trait]
impl Tool for WorkspaceTool {
    fn name(&self) -> &str {
        "workspace"
    }

    fn description(&self) -> &str {
        "Create, exec in, copy to/from, or destroy the chat workspace."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "operation": {
                    "type": "string",
                    "enum": ["create", "exec", "copy_to", "copy_from", "destroy", "validate"]
                },
                "workspace_id": { "type": "string" },
                "command": { "type": "string" },
                "working_dir": { "type": "string" },
                "env": { "type": "object", "additionalProperties": { "type": "string" } },
                "source": { "type": "string" },
                "destination": { "type": "string" },
                "delete_volume": { "type": "boolean" },
                "auto_restore": { "type": "boolean" }
            },
            "required": ["operation"]
        })
    }

    async fn execute(&self, args: Value, state: &mut ChatState) -> Result<ToolOutcome, ToolError> {
        let args: WorkspaceArgs =
            serde_json::from_value(args).map_err(|e| ToolError::InvalidArgs(e.to_string()))?;

        match args.operation.as_str() {
            "create" => {
                let workspace_id = args
                    .workspace_id
                    .clone()
                    .unwrap_or_else(|| state.chat_id.clone());
                let descriptor = self.backend.create(&workspace_id).await?;
                state.workspace = Some(descriptor.clone());
                self.publish_event(&workspace_id, "workspace_created", json!(descriptor))
                    .await;
                info!(workspace_id = %workspace_id, "workspace created");
                Ok(ToolOutcome::ok(json!({
                    "success": true,
                    "workspace": descriptor,
                })))
            }
            "exec" => {
                let workspace = Self::current_workspace(state)?;
                let command = args
                    .command
                    .as_deref()
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| ToolError::InvalidArgs("command is required".into()))?;
                let result = self
                    .backend
                    .exec(&workspace, command, args.working_dir.as_deref(), &args.env)
                    .await?;
                self.publish_event(
                    &workspace.workspace_id,
                    "workspace_exec",
                    json!({
                        "command": command,
                        "returncode": result.returncode,
                        "duration_seconds": result.duration_seconds,
                    }),
                )
                .await;
                let success = result.returncode == 0;
                if success {
                    // Snapshot after each mutating command so drift is
                    // attributable and restorable.
                    if let Err(err) =
                        workspace_integrity::capture_workspace_snapshot(state, command, "exec")
                    {
                        tracing::warn!(error = %err, "workspace snapshot failed");
                    }
                }
                Ok(ToolOutcome::ok(json!({
                    "success": success,
                    "workspace_command": result,
                })))
            }
            "validate" => {
                let _workspace = Self::current_workspace(state)?;
                let report = workspace_integrity::validate_workspace_integrity(
                    state,
                    "tool_request",
                    args.auto_restore,
                )
                .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
                match report {
                    Some(report) => Ok(ToolOutcome::ok(json!({
                        "success": true,
                        "valid": report.valid,
                        "drifted": report.drifted,
                        "extraneous": report.extraneous,
                        "missing": report.missing,
                        "restored": report.restored,
                    }))),
                    None => Ok(ToolOutcome::ok(json!({
                        "success": false,
                        "error": "no snapshot exists for this workspace",
                    }))),
                }
            }
            "copy_to" | "copy_from" => {
                let workspace = Self::current_workspace(state)?;
                let source = args
                    .source
                    .as_deref()
                    .ok_or_else(|| ToolError::InvalidArgs("source is required".into()))?;
                let destination = args
                    .destination
                    .as_deref()
                    .ok_or_else(|| ToolError::InvalidArgs("destination is required".into()))?;
                let result = if args.operation == "copy_to" {
                    self.backend.copy_to(&workspace, source, destination).await?
                } else {
                    self.backend.copy_from(&workspace, source, destination).await?
                };
                Ok(ToolOutcome::ok(json!({
                    "success": true,
                    "workspace_copy": result,
                })))
            }
            "destroy" => {
                let workspace = Self::current_workspace(state)?;
                self.backend.destroy(&workspace, args.delete_volume).await?;
                self.publish_event(
                    &workspace.workspace_id,
                    "workspace_destroyed",
                    json!({ "delete_volume": args.delete_volume }),
                )
                .await;
                state.workspace = None;
                Ok(ToolOutcome::ok(json!({ "success": true })))
            }
            other => Err(ToolError::InvalidArgs(format!(
                "unknown operation '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qc_fabric::{Fabric, MemoryFabric};

    fn tool(root: &std::path::Path) -> (WorkspaceTool, Arc<MemoryFabric>) {
        let fabric = Arc::new(MemoryFabric::new());
        let backend = Arc::new(LocalWorkspaceBackend::new(root));
        (
            WorkspaceTool::new(backend, Mailbox::new(fabric.clone()), "orchestrator"),
            fabric,
        )
    }

    #[tokio::test]
    async fn create_then_exec_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (tool, fabric) = tool(dir.path());
        let mut state = ChatState::new("c1", 1024);

        let created = tool
            .execute(json!({"operation": "create"}), &mut state)
            .await
            .unwrap();
        assert_eq!(created.output["success"], true);
        assert!(state.workspace.is_some());

        let ran = tool
            .execute(
                json!({"operation": "exec", "command": "echo hello-workspace"}),
                &mut state,
            )
            .await
            .unwrap();
        assert_eq!(ran.output["success"], true);
        let stdout = ran.output["workspace_command"]["stdout"].as_str().unwrap();
        assert!(stdout.contains("hello-workspace"));
        assert_eq!(ran.output["workspace_command"]["returncode"], 0);

        // Event stream saw both operations.
        let events = fabric
            .rev_range(&workspace_events_stream("c1"), 10)
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn exec_without_workspace_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let (tool, _fabric) = tool(dir.path());
        let mut state = ChatState::new("c1", 1024);

        let err = tool
            .execute(json!({"operation": "exec", "command": "true"}), &mut state)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgs(_)));
    }

    #[tokio::test]
    async fn failing_command_reports_nonzero() {
        let dir = tempfile::tempdir().unwrap();
        let (tool, _fabric) = tool(dir.path());
        let mut state = ChatState::new("c1", 1024);
        tool.execute(json!({"operation": "create"}), &mut state)
            .await
            .unwrap();

        let ran = tool
            .execute(
                json!({"operation": "exec", "command": "ls /definitely-not-here-qc"}),
                &mut state,
            )
            .await
            .unwrap();
        assert_eq!(ran.output["success"], false);
        assert!(ran.output["workspace_command"]["stderr"]
            .as_str()
            .unwrap()
            .len() > 0);
    }

    #[tokio::test]
    async fn copy_to_and_from() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let (tool, _fabric) = tool(dir.path());
        let mut state = ChatState::new("c1", 1024);
        tool.execute(json!({"operation": "create"}), &mut state)
            .await
            .unwrap();

        let source = outside.path().join("input.txt");
        std::fs::write(&source, "payload").unwrap();
        let copied = tool
            .execute(
                json!({
                    "operation": "copy_to",
                    "source": source.display().to_string(),
                    "destination": "input.txt",
                }),
                &mut state,
            )
            .await
            .unwrap();
        assert_eq!(copied.output["workspace_copy"]["bytes_transferred"], 7);

        let back = outside.path().join("output.txt");
        tool.execute(
            json!({
                "operation": "copy_from",
                "source": "input.txt",
                "destination": back.display().to_string(),
            }),
            &mut state,
        )
        .await
        .unwrap();
        assert_eq!(std::fs::read_to_string(&back).unwrap(), "payload");
    }

    #[tokio::test]
    async fn destroy_clears_state_and_optionally_files() {
        let dir = tempfile::tempdir().unwrap();
        let (tool, _fabric) = tool(dir.path());
        let mut state = ChatState::new("c1", 1024);
        tool.execute(json!({"operation": "create"}), &mut state)
            .await
            .unwrap();
        let host_path = state.workspace.as_ref().unwrap().extra["host_path"]
            .as_str()
            .unwrap()
            .to_string();

        tool.execute(
            json!({"operation": "destroy", "delete_volume": true}),
            &mut state,
        )
        .await
        .unwrap();
        assert!(state.workspace.is_none());
        assert!(!std::path::Path::new(&host_path).exists());
    }
}
