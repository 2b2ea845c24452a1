//! Time-travel recording.
//!
//! Every pipeline stage can be recorded as a JSONL event in a per-thread
//! log. The log supports replaying a single cycle and diffing two cycle
//! snapshots (token, tool-call, and status deltas).

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tracing::warn;

use qc_types::envelope::wire_timestamp;

use crate::state::ChatState;

/// Appends stage events to `<base_dir>/<chat_id>.jsonl`.
pub struct TimeTravelRecorder {
    base_dir: PathBuf,
}

impl TimeTravelRecorder {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Path of the log for a chat.
    pub fn log_path(&self, chat_id: &str) -> PathBuf {
        self.base_dir.join(format!("{chat_id}.jsonl"))
    }

    fn append(&self, chat_id: &str, entry: &Value) {
        if let Err(err) = fs::create_dir_all(&self.base_dir) {
            warn!(error = %err, "time travel dir creation failed");
            return;
        }
        let path = self.log_path(chat_id);
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| writeln!(file, "{entry}"));
        if let Err(err) = result {
            warn!(error = %err, path = %path.display(), "time travel append failed");
        }
    }

    /// Record a stage event with the window/quality snapshot.
    pub fn log_stage(&self, state: &ChatState, stage: &str, payload: Value) {
        let cycle_id = format!("cycle-{:04}", state.prp_cycle_count.max(1));
        let mut merged = json!({
            "context_window_used": state.context_window_used,
            "quality_score": state.context_quality_score,
            "context_segments_count": state.context_segments.len(),
        });
        if let (Some(target), Some(extra)) = (merged.as_object_mut(), payload.as_object()) {
            for (key, value) in extra {
                target.insert(key.clone(), value.clone());
            }
        }
        let entry = json!({
            "timestamp": wire_timestamp(),
            "event": format!("stage.{stage}"),
            "cycle_id": cycle_id,
            "prp_state": state.prp_state.as_str(),
            "exhaustion_mode": state.exhaustion_mode.as_str(),
            "payload": merged,
        });
        self.append(&state.chat_id, &entry);
    }

    /// Record a whole-cycle snapshot (status + usage metrics).
    pub fn log_cycle_snapshot(&self, state: &ChatState, cycle_id: &str, payload: Value) {
        let entry = json!({
            "timestamp": wire_timestamp(),
            "event": "cycle_snapshot",
            "cycle_id": cycle_id,
            "payload": payload,
        });
        self.append(&state.chat_id, &entry);
    }
}

fn read_entries(path: &Path) -> Vec<Value> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

/// All events recorded for a cycle, in order.
pub fn replay_cycle(path: &Path, cycle_id: &str) -> Vec<Value> {
    read_entries(path)
        .into_iter()
        .filter(|entry| entry.get("cycle_id").and_then(Value::as_str) == Some(cycle_id))
        .collect()
}

fn cycle_snapshot(path: &Path, cycle_id: &str) -> Option<Value> {
    read_entries(path)
        .into_iter()
        .filter(|entry| {
            entry.get("event").and_then(Value::as_str) == Some("cycle_snapshot")
                && entry.get("cycle_id").and_then(Value::as_str) == Some(cycle_id)
        })
        .next_back()
}

/// Diff two cycle snapshots: token and tool-call deltas plus the status
/// change.
pub fn diff_cycles(path: &Path, from_cycle: &str, to_cycle: &str) -> Value {
    let from = cycle_snapshot(path, from_cycle);
    let to = cycle_snapshot(path, to_cycle);

    let metric = |snapshot: &Option<Value>, key: &str| -> i64 {
        snapshot
            .as_ref()
            .and_then(|s| s.get("payload"))
            .and_then(|p| p.get("cycle_metrics"))
            .and_then(|m| m.get(key))
            .and_then(Value::as_i64)
            .unwrap_or(0)
    };
    let status = |snapshot: &Option<Value>| -> String {
        snapshot
            .as_ref()
            .and_then(|s| s.get("payload"))
            .and_then(|p| p.get("status"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string()
    };

    json!({
        "from": from_cycle,
        "to": to_cycle,
        "delta": {
            "tokens_delta": metric(&to, "total_tokens") - metric(&from, "total_tokens"),
            "tool_calls_delta": metric(&to, "tool_calls") - metric(&from, "tool_calls"),
            "status_change": { "from": status(&from), "to": status(&to) },
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prp::PrpState;

    #[test]
    fn stage_events_land_in_per_thread_log() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = TimeTravelRecorder::new(dir.path());
        let mut state = ChatState::new("test-thread", 1000);
        state.prp_state = PrpState::Hypothesize;

        recorder.log_stage(&state, "pre_process", json!({"quality": 0.8}));

        let path = recorder.log_path("test-thread");
        assert!(path.exists());
        let entries = read_entries(&path);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["event"], "stage.pre_process");
        assert_eq!(entries[0]["prp_state"], "hypothesize");

        let cycle_id = entries[0]["cycle_id"].as_str().unwrap();
        let replayed = replay_cycle(&path, cycle_id);
        assert_eq!(replayed.len(), 1);
    }

    #[test]
    fn diff_reports_token_and_status_deltas() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = TimeTravelRecorder::new(dir.path());
        let state = ChatState::new("session", 1000);

        recorder.log_cycle_snapshot(
            &state,
            "cycle-1",
            json!({
                "status": "in_progress",
                "cycle_metrics": {"total_tokens": 1000, "tool_calls": 2},
            }),
        );
        recorder.log_cycle_snapshot(
            &state,
            "cycle-2",
            json!({
                "status": "succeeded",
                "cycle_metrics": {"total_tokens": 1500, "tool_calls": 3},
            }),
        );

        let path = recorder.log_path("session");
        let diff = diff_cycles(&path, "cycle-1", "cycle-2");
        assert_eq!(diff["delta"]["tokens_delta"], 500);
        assert_eq!(diff["delta"]["tool_calls_delta"], 1);
        assert_eq!(diff["delta"]["status_change"]["to"], "succeeded");
    }

    #[test]
    fn replay_of_unknown_cycle_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = TimeTravelRecorder::new(dir.path());
        let state = ChatState::new("session", 1000);
        recorder.log_stage(&state, "pre_process", json!({}));

        let replayed = replay_cycle(&recorder.log_path("session"), "cycle-9999");
        assert!(replayed.is_empty());
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.jsonl");
        fs::write(&path, "{\"event\": \"stage.x\", \"cycle_id\": \"c\"}\nnot json\n").unwrap();
        let entries = read_entries(&path);
        assert_eq!(entries.len(), 1);
    }
}
