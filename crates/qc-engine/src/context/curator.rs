//! Context curation: compress, externalize, discard.
//!
//! Segments are scored `priority × relevance × freshness`; low scorers get
//! compressed in place, then segments are externalized (full content to
//! durable storage, short pointer left behind) until the window fits the
//! target, and as a last resort old low-priority segments are discarded.
//! Every action emits a metrics event with before/after token counts.

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;

use chrono::Utc;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use qc_types::config::ContextEngineConfig;
use qc_types::envelope::wire_timestamp;

use crate::context::reducer::reduce_content;
use crate::state::{estimate_tokens, ChatState, ContextSegment};

/// Curation score below which an eligible segment is compressed.
const COMPRESS_SCORE_THRESHOLD: f64 = 0.10;

/// Priority at or below which a segment may be discarded.
const DISCARD_PRIORITY_CEILING: u8 = 3;

/// The curator.
pub struct ContextCurator {
    config: ContextEngineConfig,
}

impl ContextCurator {
    pub fn new(config: ContextEngineConfig) -> Self {
        Self { config }
    }

    /// Curation score for a segment: normalized priority × relevance to
    /// the task goal (neutral 0.5 without one) × exponential freshness.
    fn curation_score(&self, segment: &ContextSegment, state: &ChatState) -> f64 {
        let priority = segment.priority as f64 / 10.0;
        let relevance = if state.task_goal.trim().is_empty() {
            0.5
        } else {
            let goal: BTreeSet<String> = tokenize(&state.task_goal);
            let content = tokenize(&segment.content);
            if content.is_empty() || goal.is_empty() {
                0.25
            } else {
                let hits = content.intersection(&goal).count() as f64;
                (hits / goal.len() as f64).clamp(0.05, 1.0)
            }
        };
        let age_hours = (Utc::now() - segment.timestamp).num_seconds().max(0) as f64 / 3600.0;
        let freshness = (-segment.decay_rate * age_hours).exp();
        priority * relevance * freshness
    }

    /// Run the three curation stages against the state.
    pub fn optimize(&self, state: &mut ChatState) {
        self.compress_low_scorers(state);
        self.externalize_until_fit(state);
        self.discard_until_fit(state);
        state.recompute_window_used();
    }

    fn compress_low_scorers(&self, state: &mut ChatState) {
        let scores: Vec<(usize, f64)> = state
            .context_segments
            .iter()
            .enumerate()
            .filter(|(_, segment)| segment.compression_eligible && !segment.is_pointer())
            .map(|(index, segment)| (index, self.curation_score(segment, state)))
            .collect();

        let mut events = Vec::new();
        for (index, score) in scores {
            if score >= COMPRESS_SCORE_THRESHOLD {
                continue;
            }
            let segment = &mut state.context_segments[index];
            let before = segment.token_count;
            let target = (before / 2).min(self.config.reducer_target_tokens).max(1);
            let reduced = reduce_content(&segment.content, target);
            segment.content = reduced;
            segment.token_count = estimate_tokens(&segment.content).min(before / 2);
            segment.compression_eligible = false;
            events.push(json!({
                "action": "compress",
                "segment_id": segment.id,
                "segment_type": segment.segment_type,
                "before_tokens": before,
                "after_tokens": segment.token_count,
                "reason": format!("curation score {score:.3} below threshold"),
                "stage": "curate",
            }));
        }
        for event in events {
            state.push_metric("compress", event);
        }
    }

    fn externalize_until_fit(&self, state: &mut ChatState) {
        loop {
            state.recompute_window_used();
            if state.context_window_used <= self.config.target_context_size {
                return;
            }
            // Lowest-value content leaves the window first.
            let candidate = state
                .context_segments
                .iter()
                .enumerate()
                .filter(|(_, segment)| !segment.is_pointer())
                .map(|(index, segment)| (index, self.curation_score(segment, state)))
                .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            let Some((index, score)) = candidate else {
                return;
            };

            let segment = state.context_segments[index].clone();
            let before = segment.token_count;
            let (pointer, reference_id, path) = self.externalize_segment(&segment);
            let after = pointer.token_count;
            state.context_segments[index] = pointer;
            state
                .external_memory_index
                .insert(reference_id.clone(), path);
            state.push_metric(
                "externalize",
                json!({
                    "action": "externalize",
                    "segment_id": segment.id,
                    "segment_type": segment.segment_type,
                    "before_tokens": before,
                    "after_tokens": after,
                    "reason": format!("over target window (score {score:.3})"),
                    "stage": "curate",
                }),
            );
        }
    }

    fn discard_until_fit(&self, state: &mut ChatState) {
        loop {
            state.recompute_window_used();
            if state.context_window_used <= self.config.target_context_size {
                return;
            }
            // Oldest low-priority segment goes first.
            let candidate = state
                .context_segments
                .iter()
                .enumerate()
                .filter(|(_, segment)| segment.priority <= DISCARD_PRIORITY_CEILING)
                .min_by_key(|(_, segment)| segment.timestamp)
                .map(|(index, _)| index);
            let Some(index) = candidate else {
                return;
            };
            let removed = state.context_segments.remove(index);
            state.push_metric(
                "discard",
                json!({
                    "action": "discard",
                    "segment_id": removed.id,
                    "segment_type": removed.segment_type,
                    "before_tokens": removed.token_count,
                    "after_tokens": 0,
                    "reason": "over target window after externalization",
                    "stage": "curate",
                }),
            );
        }
    }

    /// Externalize a single segment.
    ///
    /// Returns the pointer replacement, the reference id, and the durable
    /// path. The file write is skipped when `externalize_write_enabled` is
    /// off; the path is still computed so the index stays resolvable.
    pub fn externalize_segment(&self, segment: &ContextSegment) -> (ContextSegment, String, String) {
        let short = Uuid::new_v4().simple().to_string();
        let reference_id = format!("ref-{}-{}", &short[..8], segment.id);
        let path: PathBuf = PathBuf::from(&self.config.external_memory_path)
            .join(format!("{reference_id}.json"));
        let path_text = path.to_string_lossy().to_string();

        if self.config.externalize_write_enabled {
            let payload = json!({
                "reference_id": reference_id,
                "archived_at": wire_timestamp(),
                "segment": segment,
            });
            if let Some(parent) = path.parent() {
                if let Err(err) = fs::create_dir_all(parent) {
                    debug!(error = %err, "external memory dir creation failed");
                }
            }
            match serde_json::to_string_pretty(&payload) {
                Ok(text) => {
                    if let Err(err) = fs::write(&path, text) {
                        debug!(error = %err, path = %path_text, "externalize write failed");
                    }
                }
                Err(err) => debug!(error = %err, "externalize serialization failed"),
            }
        }

        let content = format!(
            "[externalized {} segment {}; ref {}]",
            segment.segment_type, segment.id, reference_id
        );
        let pointer = ContextSegment {
            id: segment.id.clone(),
            token_count: estimate_tokens(&content),
            content,
            segment_type: format!("pointer:{}", segment.segment_type),
            priority: segment.priority,
            timestamp: segment.timestamp,
            decay_rate: segment.decay_rate,
            compression_eligible: false,
            restorable_reference: Some(reference_id.clone()),
        };
        (pointer, reference_id, path_text)
    }

    /// Post-decision pruning: drop segments stale beyond the configured
    /// age unless they are high priority or pointers.
    pub fn prune_stale(&self, state: &mut ChatState) {
        let now = Utc::now();
        let max_age = self.config.stale_segment_max_age_secs as i64;
        let mut pruned = Vec::new();
        state.context_segments.retain(|segment| {
            let age = (now - segment.timestamp).num_seconds();
            let stale = age > max_age && segment.priority < 8 && !segment.is_pointer();
            if stale {
                pruned.push(json!({
                    "action": "prune",
                    "segment_id": segment.id,
                    "segment_type": segment.segment_type,
                    "before_tokens": segment.token_count,
                    "after_tokens": 0,
                    "reason": format!("stale beyond {max_age}s"),
                    "stage": "post_process",
                }));
            }
            !stale
        });
        for event in pruned {
            state.push_metric("prune", event);
        }
        state.recompute_window_used();
    }
}

fn tokenize(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.len() > 2)
        .map(str::to_string)
        .collect()
}
