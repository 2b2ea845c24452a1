//! Envelope-aware mailbox layer over the raw stream fabric.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use qc_types::envelope::{mailbox_key, MessageEnvelope};
use qc_types::Result;

use crate::stream::{EntryId, Fabric};

/// Writer handle for posting envelopes to recipient mailboxes.
#[derive(Clone)]
pub struct Mailbox {
    fabric: Arc<dyn Fabric>,
}

impl Mailbox {
    pub fn new(fabric: Arc<dyn Fabric>) -> Self {
        Self { fabric }
    }

    /// Append an envelope to its recipient's mailbox stream.
    pub async fn post(&self, envelope: &MessageEnvelope) -> Result<EntryId> {
        let stream = mailbox_key(&envelope.recipient);
        let fields = envelope
            .to_stream_fields()
            .into_iter()
            .collect::<BTreeMap<_, _>>();
        let id = self.fabric.append(&stream, fields).await?;
        debug!(
            recipient = %envelope.recipient,
            sender = %envelope.sender,
            entry_id = %id,
            "posted envelope"
        );
        Ok(id)
    }

    /// Append an envelope to an explicit stream (event streams).
    pub async fn post_to_stream(
        &self,
        stream: &str,
        envelope: &MessageEnvelope,
    ) -> Result<EntryId> {
        let fields = envelope
            .to_stream_fields()
            .into_iter()
            .collect::<BTreeMap<_, _>>();
        self.fabric.append(stream, fields).await
    }

    /// Underlying fabric handle.
    pub fn fabric(&self) -> &Arc<dyn Fabric> {
        &self.fabric
    }
}

/// Cursor-tracking reader for a single recipient's mailbox.
///
/// The cursor advances as entries are read; [`MailboxReader::cursor`]
/// exposes the last delivered id so callers can persist it and
/// [`MailboxReader::seek`] back after a restart for bounded replay.
pub struct MailboxReader {
    fabric: Arc<dyn Fabric>,
    stream: String,
    cursor: EntryId,
}

impl MailboxReader {
    /// Reader starting at the head of history (delivers everything).
    pub fn new(fabric: Arc<dyn Fabric>, recipient: &str) -> Self {
        Self {
            fabric,
            stream: mailbox_key(recipient),
            cursor: EntryId::ZERO,
        }
    }

    /// Reader resuming from a persisted cursor.
    pub fn resume(fabric: Arc<dyn Fabric>, recipient: &str, cursor: EntryId) -> Self {
        Self {
            fabric,
            stream: mailbox_key(recipient),
            cursor,
        }
    }

    /// Last delivered entry id.
    pub fn cursor(&self) -> EntryId {
        self.cursor
    }

    /// Move the cursor explicitly.
    pub fn seek(&mut self, cursor: EntryId) {
        self.cursor = cursor;
    }

    /// Blocking read of the next batch of envelopes, advancing the cursor.
    /// An empty result means the timeout elapsed.
    pub async fn read(
        &mut self,
        max_count: usize,
        block_timeout: Duration,
    ) -> Result<Vec<(EntryId, MessageEnvelope)>> {
        let mut cursors = BTreeMap::new();
        cursors.insert(self.stream.clone(), self.cursor);

        let batches = self
            .fabric
            .tail_read(&cursors, max_count, block_timeout)
            .await?;

        let mut envelopes = Vec::new();
        for (_, entries) in batches {
            for entry in entries {
                let envelope = MessageEnvelope::from_stream_fields(
                    entry.fields.iter().map(|(k, v)| (k.as_str(), v.as_str())),
                );
                self.cursor = self.cursor.max(entry.id);
                envelopes.push((entry.id, envelope));
            }
        }
        Ok(envelopes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryFabric;
    use qc_types::envelope::ORCHESTRATOR_RECIPIENT;
    use serde_json::json;

    fn setup() -> (Mailbox, Arc<MemoryFabric>) {
        let fabric = Arc::new(MemoryFabric::new());
        (Mailbox::new(fabric.clone()), fabric)
    }

    #[tokio::test]
    async fn post_then_read_round_trips_envelope() {
        let (mailbox, fabric) = setup();
        let envelope = MessageEnvelope::new("human", ORCHESTRATOR_RECIPIENT, "hello")
            .with_payload("chat_id", json!("c1"));
        mailbox.post(&envelope).await.unwrap();

        let mut reader = MailboxReader::new(fabric, ORCHESTRATOR_RECIPIENT);
        let batch = reader.read(16, Duration::from_millis(50)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].1, envelope);
        assert_eq!(reader.cursor(), batch[0].0);
    }

    #[tokio::test]
    async fn reader_does_not_redeliver() {
        let (mailbox, fabric) = setup();
        let envelope = MessageEnvelope::new("a", "b", "first");
        mailbox.post(&envelope).await.unwrap();

        let mut reader = MailboxReader::new(fabric, "b");
        let first = reader.read(16, Duration::from_millis(20)).await.unwrap();
        assert_eq!(first.len(), 1);

        let second = reader.read(16, Duration::from_millis(20)).await.unwrap();
        assert!(second.is_empty());

        mailbox.post(&MessageEnvelope::new("a", "b", "next")).await.unwrap();
        let third = reader.read(16, Duration::from_millis(50)).await.unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].1.message, "next");
    }

    #[tokio::test]
    async fn resume_skips_acknowledged_entries() {
        let (mailbox, fabric) = setup();
        for text in ["one", "two", "three"] {
            mailbox.post(&MessageEnvelope::new("a", "b", text)).await.unwrap();
        }

        let mut reader = MailboxReader::resume(fabric, "b", EntryId(2));
        let batch = reader.read(16, Duration::from_millis(20)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].1.message, "three");
    }

    #[tokio::test]
    async fn delivery_order_matches_append_order() {
        let (mailbox, fabric) = setup();
        for i in 0..10 {
            mailbox
                .post(&MessageEnvelope::new("a", "b", format!("m{i}")))
                .await
                .unwrap();
        }

        let mut reader = MailboxReader::new(fabric, "b");
        let batch = reader.read(100, Duration::from_millis(20)).await.unwrap();
        let messages: Vec<&str> = batch.iter().map(|(_, e)| e.message.as_str()).collect();
        let expected: Vec<String> = (0..10).map(|i| format!("m{i}")).collect();
        assert_eq!(messages, expected.iter().map(String::as_str).collect::<Vec<_>>());
    }
}
