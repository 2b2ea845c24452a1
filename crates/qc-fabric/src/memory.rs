//! In-process fabric backed by tokio primitives.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use qc_types::Result;

use crate::stream::{EntryId, Fabric, StreamEntry};

/// In-memory [`Fabric`] implementation.
///
/// Streams are created lazily on first append. Entry ids are per-stream
/// monotonic counters starting at 1. Appends are non-blocking; tail
/// readers park on a [`Notify`] that every append wakes.
#[derive(Default)]
pub struct MemoryFabric {
    streams: Mutex<HashMap<String, Vec<StreamEntry>>>,
    wakeup: Notify,
}

impl MemoryFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect entries newer than each cursor, capped per stream.
    fn collect(
        &self,
        cursors: &BTreeMap<String, EntryId>,
        max_count: usize,
    ) -> Vec<(String, Vec<StreamEntry>)> {
        let streams = self.streams.lock().expect("fabric lock poisoned");
        let mut batches = Vec::new();
        for (name, cursor) in cursors {
            if let Some(entries) = streams.get(name) {
                let fresh: Vec<StreamEntry> = entries
                    .iter()
                    .filter(|entry| entry.id > *cursor)
                    .take(max_count)
                    .cloned()
                    .collect();
                if !fresh.is_empty() {
                    batches.push((name.clone(), fresh));
                }
            }
        }
        batches
    }
}

#[async_trait]
impl Fabric for MemoryFabric {
    async fn append(&self, stream: &str, fields: BTreeMap<String, String>) -> Result<EntryId> {
        let id = {
            let mut streams = self.streams.lock().expect("fabric lock poisoned");
            let entries = streams.entry(stream.to_string()).or_default();
            let id = entries
                .last()
                .map(|entry| entry.id.next())
                .unwrap_or(EntryId(1));
            entries.push(StreamEntry { id, fields });
            id
        };
        trace!(stream, id = %id, "appended stream entry");
        self.wakeup.notify_waiters();
        Ok(id)
    }

    async fn tail_read(
        &self,
        cursors: &BTreeMap<String, EntryId>,
        max_count: usize,
        block_timeout: Duration,
    ) -> Result<Vec<(String, Vec<StreamEntry>)>> {
        let deadline = Instant::now() + block_timeout;
        loop {
            // Register interest before checking so an append between the
            // check and the await cannot be lost.
            let notified = self.wakeup.notified();

            let batches = self.collect(cursors, max_count);
            if !batches.is_empty() {
                return Ok(batches);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    async fn range(
        &self,
        stream: &str,
        from: EntryId,
        to: EntryId,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let streams = self.streams.lock().expect("fabric lock poisoned");
        Ok(streams
            .get(stream)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| entry.id >= from && entry.id <= to)
                    .take(count)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn rev_range(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>> {
        let streams = self.streams.lock().expect("fabric lock poisoned");
        Ok(streams
            .get(stream)
            .map(|entries| entries.iter().rev().take(count).cloned().collect())
            .unwrap_or_default())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        let streams = self.streams.lock().expect("fabric lock poisoned");
        let mut names: Vec<String> = streams
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fields(value: &str) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("message".to_string(), value.to_string());
        map
    }

    #[tokio::test]
    async fn append_assigns_monotonic_ids() {
        let fabric = MemoryFabric::new();
        let a = fabric.append("s", fields("a")).await.unwrap();
        let b = fabric.append("s", fields("b")).await.unwrap();
        let c = fabric.append("other", fields("c")).await.unwrap();
        assert_eq!(a, EntryId(1));
        assert_eq!(b, EntryId(2));
        assert_eq!(c, EntryId(1), "ids are per stream");
    }

    #[tokio::test]
    async fn tail_read_returns_only_entries_past_cursor() {
        let fabric = MemoryFabric::new();
        fabric.append("s", fields("a")).await.unwrap();
        fabric.append("s", fields("b")).await.unwrap();

        let mut cursors = BTreeMap::new();
        cursors.insert("s".to_string(), EntryId(1));
        let batches = fabric
            .tail_read(&cursors, 16, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].1.len(), 1);
        assert_eq!(batches[0].1[0].fields.get("message").unwrap(), "b");
    }

    #[tokio::test]
    async fn tail_read_times_out_empty() {
        let fabric = MemoryFabric::new();
        let mut cursors = BTreeMap::new();
        cursors.insert("quiet".to_string(), EntryId::ZERO);
        let start = std::time::Instant::now();
        let batches = fabric
            .tail_read(&cursors, 16, Duration::from_millis(30))
            .await
            .unwrap();
        assert!(batches.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn tail_read_wakes_on_append() {
        let fabric = Arc::new(MemoryFabric::new());
        let reader = fabric.clone();
        let handle = tokio::spawn(async move {
            let mut cursors = BTreeMap::new();
            cursors.insert("s".to_string(), EntryId::ZERO);
            reader
                .tail_read(&cursors, 16, Duration::from_secs(5))
                .await
                .unwrap()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        fabric.append("s", fields("wake")).await.unwrap();

        let batches = handle.await.unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].1[0].fields.get("message").unwrap(), "wake");
    }

    #[tokio::test]
    async fn range_and_rev_range() {
        let fabric = MemoryFabric::new();
        for i in 0..5 {
            fabric.append("s", fields(&format!("m{i}"))).await.unwrap();
        }

        let slice = fabric.range("s", EntryId(2), EntryId(4), 10).await.unwrap();
        assert_eq!(slice.len(), 3);
        assert_eq!(slice[0].id, EntryId(2));

        let newest = fabric.rev_range("s", 2).await.unwrap();
        assert_eq!(newest.len(), 2);
        assert_eq!(newest[0].id, EntryId(5));

        let capped = fabric.range("s", EntryId(1), EntryId(5), 2).await.unwrap();
        assert_eq!(capped.len(), 2);
    }

    #[tokio::test]
    async fn scan_filters_by_prefix() {
        let fabric = MemoryFabric::new();
        fabric.append("qc:mailbox/human", fields("x")).await.unwrap();
        fabric
            .append("qc:mailbox/orchestrator", fields("y"))
            .await
            .unwrap();
        fabric.append("qc:context:metrics", fields("z")).await.unwrap();

        let mailboxes = fabric.scan("qc:mailbox/").await.unwrap();
        assert_eq!(
            mailboxes,
            vec![
                "qc:mailbox/human".to_string(),
                "qc:mailbox/orchestrator".to_string()
            ]
        );
    }
}
