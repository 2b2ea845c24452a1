//! Workspace integrity snapshots.
//!
//! A snapshot is a sha256 manifest of the workspace tree plus, from the
//! second snapshot on, a diff against the previous manifest. Validation
//! compares the live tree against the last snapshot and can restore
//! drifted or extraneous files from the archived copies.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use walkdir::WalkDir;

use qc_types::envelope::wire_timestamp;
use qc_types::Result;

use crate::state::ChatState;

/// One file in a manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestEntry {
    pub path: String,
    pub sha256: String,
    pub size: u64,
}

/// Result of capturing a snapshot.
#[derive(Debug, Clone)]
pub struct WorkspaceSnapshot {
    pub manifest_path: PathBuf,
    /// Present from the second snapshot on.
    pub diff_path: Option<PathBuf>,
    pub archive_dir: PathBuf,
}

/// Result of an integrity validation.
#[derive(Debug, Clone)]
pub struct IntegrityReport {
    pub valid: bool,
    pub drifted: Vec<String>,
    pub extraneous: Vec<String>,
    pub missing: Vec<String>,
    pub restored: bool,
}

fn workspace_host_path(state: &ChatState) -> Option<PathBuf> {
    state
        .workspace
        .as_ref()
        .and_then(|ws| ws.extra.get("host_path"))
        .and_then(Value::as_str)
        .map(PathBuf::from)
}

fn integrity_root(workspace: &Path) -> PathBuf {
    workspace
        .parent()
        .unwrap_or(workspace)
        .join(".qc-integrity")
        .join(workspace.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default())
}

fn hash_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

fn build_manifest(workspace: &Path) -> Result<Vec<ManifestEntry>> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(workspace)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let relative = entry
            .path()
            .strip_prefix(workspace)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .to_string();
        entries.push(ManifestEntry {
            sha256: hash_file(entry.path())?,
            size: entry.metadata().map(|m| m.len()).unwrap_or(0),
            path: relative,
        });
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

fn latest_snapshot_dir(root: &Path) -> Option<PathBuf> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(root)
        .ok()?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .map(|e| e.path())
        .collect();
    dirs.sort();
    dirs.pop()
}

fn manifest_diff(previous: &[ManifestEntry], current: &[ManifestEntry]) -> String {
    let old: BTreeMap<&str, &ManifestEntry> =
        previous.iter().map(|e| (e.path.as_str(), e)).collect();
    let new: BTreeMap<&str, &ManifestEntry> =
        current.iter().map(|e| (e.path.as_str(), e)).collect();

    let mut lines = Vec::new();
    for (path, entry) in &new {
        match old.get(path) {
            None => lines.push(format!("+ {path}")),
            Some(before) if before.sha256 != entry.sha256 => lines.push(format!("~ {path}")),
            _ => {}
        }
    }
    for path in old.keys() {
        if !new.contains_key(path) {
            lines.push(format!("- {path}"));
        }
    }
    lines.join("\n")
}

/// Capture a snapshot of the workspace attached to the state.
///
/// Returns `None` when no workspace with a host path is attached. The
/// manifest and a full file archive land under the integrity root; a diff
/// against the previous manifest is written from the second snapshot on.
pub fn capture_workspace_snapshot(
    state: &mut ChatState,
    reason: &str,
    stage: &str,
) -> Result<Option<WorkspaceSnapshot>> {
    let Some(workspace) = workspace_host_path(state) else {
        return Ok(None);
    };
    let root = integrity_root(&workspace);
    let previous_dir = latest_snapshot_dir(&root);

    let stamp = format!(
        "{}-{stage}",
        chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f")
    );
    let archive_dir = root.join(&stamp);
    fs::create_dir_all(&archive_dir)?;

    let manifest = build_manifest(&workspace)?;
    let manifest_path = archive_dir.join("manifest.json");
    fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)?;

    // Archive file contents for restoration.
    let files_dir = archive_dir.join("files");
    for entry in &manifest {
        let source = workspace.join(&entry.path);
        let target = files_dir.join(&entry.path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&source, &target)?;
    }

    let diff_path = match previous_dir {
        Some(previous) => {
            let previous_manifest: Vec<ManifestEntry> =
                serde_json::from_str(&fs::read_to_string(previous.join("manifest.json"))?)?;
            let diff = manifest_diff(&previous_manifest, &manifest);
            let path = archive_dir.join("diff.txt");
            fs::write(&path, diff)?;
            Some(path)
        }
        None => None,
    };

    state.push_metric(
        "workspace_snapshot",
        json!({
            "reason": reason,
            "stage": stage,
            "files": manifest.len(),
            "archive": archive_dir.display().to_string(),
            "captured_at": wire_timestamp(),
        }),
    );
    debug!(files = manifest.len(), stage, "workspace snapshot captured");

    Ok(Some(WorkspaceSnapshot {
        manifest_path,
        diff_path,
        archive_dir,
    }))
}

/// Validate the live workspace against the most recent snapshot.
///
/// With `auto_restore`, drifted files are rewritten from the archive,
/// extraneous files are deleted, and missing files are recreated.
pub fn validate_workspace_integrity(
    state: &mut ChatState,
    reason: &str,
    auto_restore: bool,
) -> Result<Option<IntegrityReport>> {
    let Some(workspace) = workspace_host_path(state) else {
        return Ok(None);
    };
    let root = integrity_root(&workspace);
    let Some(snapshot_dir) = latest_snapshot_dir(&root) else {
        return Ok(None);
    };

    let expected: Vec<ManifestEntry> =
        serde_json::from_str(&fs::read_to_string(snapshot_dir.join("manifest.json"))?)?;
    let current = build_manifest(&workspace)?;

    let expected_map: BTreeMap<&str, &ManifestEntry> =
        expected.iter().map(|e| (e.path.as_str(), e)).collect();
    let current_map: BTreeMap<&str, &ManifestEntry> =
        current.iter().map(|e| (e.path.as_str(), e)).collect();

    let mut drifted = Vec::new();
    let mut extraneous = Vec::new();
    let mut missing = Vec::new();

    for (path, entry) in &current_map {
        match expected_map.get(path) {
            None => extraneous.push((*path).to_string()),
            Some(exp) if exp.sha256 != entry.sha256 => drifted.push((*path).to_string()),
            _ => {}
        }
    }
    for path in expected_map.keys() {
        if !current_map.contains_key(path) {
            missing.push((*path).to_string());
        }
    }

    let valid = drifted.is_empty() && extraneous.is_empty() && missing.is_empty();
    let mut restored = false;

    if !valid && auto_restore {
        let files_dir = snapshot_dir.join("files");
        for path in drifted.iter().chain(missing.iter()) {
            let source = files_dir.join(path);
            let target = workspace.join(path);
            if source.exists() {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(&source, &target)?;
                restored = true;
            }
        }
        for path in &extraneous {
            let target = workspace.join(path);
            if target.exists() {
                fs::remove_file(&target)?;
                restored = true;
            }
        }
        info!(
            drifted = drifted.len(),
            extraneous = extraneous.len(),
            missing = missing.len(),
            "workspace restored from snapshot"
        );
    }

    state.push_metric(
        "workspace_integrity",
        json!({
            "reason": reason,
            "valid": valid,
            "drifted": drifted,
            "extraneous": extraneous,
            "missing": missing,
            "restored": restored,
        }),
    );

    Ok(Some(IntegrityReport {
        valid,
        drifted,
        extraneous,
        missing,
        restored,
    }))
}
