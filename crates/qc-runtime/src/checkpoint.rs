//! Checkpoint store.
//!
//! One JSON blob per `chat_id`, written atomically (temp file + rename),
//! carrying the chat state plus the last acknowledged mailbox entry so a
//! restarted process can resume its tail with bounded replay. Corrupt
//! blobs are a fatal error: the process is expected to exit and be
//! restarted with operator attention.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use qc_engine::state::ChatState;
use qc_fabric::EntryId;
use qc_types::{QcError, Result};

/// A persisted checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub state: ChatState,
    /// Last mailbox entry fully processed for this chat.
    #[serde(default)]
    pub last_acked_entry: EntryId,
}

/// Durable per-chat state storage.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, chat_id: &str) -> Result<Option<CheckpointRecord>>;
    async fn save(&self, chat_id: &str, record: &CheckpointRecord) -> Result<()>;
    /// All chat ids with a stored checkpoint.
    async fn list(&self) -> Result<Vec<String>>;
}

/// Filesystem-backed store: `<dir>/<encoded chat_id>.json`.
pub struct FsCheckpointStore {
    dir: PathBuf,
}

impl FsCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn encode(chat_id: &str) -> String {
        chat_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    fn path(&self, chat_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", Self::encode(chat_id)))
    }
}

#[async_trait]
impl CheckpointStore for FsCheckpointStore {
    async fn load(&self, chat_id: &str) -> Result<Option<CheckpointRecord>> {
        let path = self.path(chat_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(QcError::Io(err)),
        };
        let record = serde_json::from_str(&content).map_err(|err| {
            QcError::CheckpointCorrupt(format!("{}: {err}", path.display()))
        })?;
        Ok(Some(record))
    }

    async fn save(&self, chat_id: &str, record: &CheckpointRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path(chat_id);
        let temp = path.with_extension("json.tmp");
        let blob = serde_json::to_string(record)?;
        tokio::fs::write(&temp, &blob).await?;
        tokio::fs::rename(&temp, &path).await?;
        debug!(chat_id, bytes = blob.len(), "checkpoint written");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(err) => return Err(QcError::Io(err)),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(stem) = name.strip_suffix(".json") {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}
