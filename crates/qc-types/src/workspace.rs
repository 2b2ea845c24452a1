//! Workspace tool contracts.
//!
//! Workspaces are opaque to the core: the runtime only sees descriptors
//! and structured command/copy results. Extra fields on a descriptor are
//! preserved so backend-specific metadata survives a round-trip.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Mount point used when a workspace does not specify one.
pub const DEFAULT_WORKSPACE_MOUNT: &str = "/workspace";

/// Descriptor for a provisioned workspace container/volume pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceDescriptor {
    /// Stable workspace identifier (usually the chat id).
    pub workspace_id: String,

    /// Named volume backing the workspace.
    pub volume: String,

    /// Running workspace container name.
    pub container: String,

    /// Mount point inside the container.
    #[serde(default = "default_mount")]
    pub mount_path: String,

    /// Image used for the workspace container.
    pub image: String,

    /// ISO-8601 creation timestamp.
    pub created_at: String,

    /// Backend-specific fields, preserved on round-trip.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn default_mount() -> String {
    DEFAULT_WORKSPACE_MOUNT.to_string()
}

/// Structured result of a command executed inside a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceCommandResult {
    pub workspace: WorkspaceDescriptor,
    pub command: String,
    #[serde(default = "default_mount")]
    pub working_dir: String,
    #[serde(default)]
    pub environment_keys: Vec<String>,
    pub started_at: String,
    pub finished_at: String,
    pub duration_seconds: f64,
    pub returncode: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub stdout_bytes: usize,
    #[serde(default)]
    pub stderr_bytes: usize,
}

/// Structured result of a copy into or out of a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceCopyResult {
    pub workspace: WorkspaceDescriptor,
    pub source: String,
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_transferred: Option<u64>,
}

/// Derive a container-safe resource suffix from a workspace identifier.
///
/// Collapses anything outside `[A-Za-z0-9_.-]` to dashes, trims leading and
/// trailing separators, and lowercases. Empty input (or input that reduces
/// to nothing) is rejected.
pub fn normalize_workspace_name(identifier: &str) -> Result<String, crate::QcError> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        return Err(crate::QcError::Schema(
            "workspace identifier cannot be empty".into(),
        ));
    }
    let mut slug = String::with_capacity(trimmed.len());
    let mut last_dash = false;
    for c in trimmed.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_matches(|c| c == '-' || c == '.' || c == '_').to_string();
    if slug.is_empty() {
        return Err(crate::QcError::Schema(
            "workspace identifier produced empty slug".into(),
        ));
    }
    Ok(slug)
}

/// Environment variable keys in deterministic (sorted, deduped) order.
pub fn collect_environment_keys(env: Option<&BTreeMap<String, String>>) -> Vec<String> {
    match env {
        Some(env) => env.keys().cloned().collect(),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_unsafe_characters() {
        assert_eq!(normalize_workspace_name("Chat 42 / main").unwrap(), "chat-42-main");
        assert_eq!(normalize_workspace_name("ws_ok.v2").unwrap(), "ws_ok.v2");
    }

    #[test]
    fn normalize_rejects_empty() {
        assert!(normalize_workspace_name("   ").is_err());
        assert!(normalize_workspace_name("///").is_err());
    }

    #[test]
    fn descriptor_preserves_extra_fields() {
        let json = r#"{
            "workspace_id": "c1",
            "volume": "qc-vol-c1",
            "container": "qc-ws-c1",
            "image": "qc-workspace:latest",
            "created_at": "2026-01-01T00:00:00Z",
            "host_path": "/var/lib/qc/c1"
        }"#;
        let descriptor: WorkspaceDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(descriptor.mount_path, DEFAULT_WORKSPACE_MOUNT);
        assert!(descriptor.extra.contains_key("host_path"));

        let round = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(
            round.get("host_path").and_then(Value::as_str),
            Some("/var/lib/qc/c1")
        );
    }

    #[test]
    fn environment_keys_sorted() {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), "/bin".to_string());
        env.insert("CARGO_HOME".to_string(), "/cargo".to_string());
        assert_eq!(
            collect_environment_keys(Some(&env)),
            vec!["CARGO_HOME".to_string(), "PATH".to_string()]
        );
        assert!(collect_environment_keys(None).is_empty());
    }
}
