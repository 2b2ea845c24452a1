//! The [`Fabric`] contract: append-only ordered streams.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use qc_types::Result;

/// Monotonic entry id within a single stream. Ids start at 1; `EntryId(0)`
/// is the cursor position "before the first entry".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct EntryId(pub u64);

impl EntryId {
    /// Cursor position before the first entry.
    pub const ZERO: EntryId = EntryId(0);

    /// The id following this one.
    pub fn next(self) -> EntryId {
        EntryId(self.0 + 1)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for EntryId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(EntryId(s.parse()?))
    }
}

/// One entry in a stream: its id plus flat string fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEntry {
    pub id: EntryId,
    pub fields: BTreeMap<String, String>,
}

/// Append-only, totally-ordered, per-stream message fabric.
///
/// Writers never block. Readers track a cursor per stream and receive only
/// entries strictly newer than it. `tail_read` blocks until at least one
/// stream has news or the timeout elapses.
#[async_trait]
pub trait Fabric: Send + Sync {
    /// Append flat fields to a stream; returns the assigned entry id.
    async fn append(&self, stream: &str, fields: BTreeMap<String, String>) -> Result<EntryId>;

    /// Blocking tail read across several streams.
    ///
    /// `cursors` maps stream name to the last-seen entry id. Returns one
    /// `(stream, entries)` pair per stream that has entries newer than its
    /// cursor, at most `max_count` entries per stream. An empty result
    /// means the timeout elapsed with no news.
    async fn tail_read(
        &self,
        cursors: &BTreeMap<String, EntryId>,
        max_count: usize,
        block_timeout: Duration,
    ) -> Result<Vec<(String, Vec<StreamEntry>)>>;

    /// Entries with `from <= id <= to`, capped at `count`.
    async fn range(
        &self,
        stream: &str,
        from: EntryId,
        to: EntryId,
        count: usize,
    ) -> Result<Vec<StreamEntry>>;

    /// The newest `count` entries, newest first.
    async fn rev_range(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>>;

    /// Names of existing streams starting with `prefix`.
    async fn scan(&self, prefix: &str) -> Result<Vec<String>>;
}
