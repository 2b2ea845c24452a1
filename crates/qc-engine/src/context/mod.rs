//! The context engine.
//!
//! Wraps every LLM call with three stages. Pre-process ingests new
//! transcript turns as segments, runs the progressive loader, scores the
//! window, curates when over budget or below quality, applies the
//! governor plan, fires the context reset when triggered, and updates the
//! exhaustion mode. Tool-response handling truncates oversized payloads
//! (externalizing the full content) and books a tool-output segment.
//! Post-process re-scores, reflects, maintains the playbook and curation
//! rules, and prunes stale segments.
//!
//! The pipeline is deliberately straight-line: pure state mutation with
//! explicit file I/O at named points, no hidden suspension.

pub mod curator;
pub mod governor;
pub mod loader;
pub mod reducer;
pub mod reset;
pub mod scorer;

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;

use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use qc_types::config::{ContextEngineConfig, ExhaustionConfig};
use qc_types::envelope::wire_timestamp;

use crate::exhaustion::{update_exhaustion_mode, ExhaustionPredictor};
use crate::invariants;
use crate::state::{
    estimate_tokens, ChatState, ContextSegment, CurationRule, PlaybookReflection, Reflection,
};

use curator::ContextCurator;
use governor::ContextGovernor;
use loader::ProgressiveLoader;
use reset::{ContextReset, HeuristicSummarizer, TranscriptSummarizer};
use scorer::ContextScorer;

/// Priority for ingested conversation segments.
const CONVERSATION_PRIORITY: u8 = 5;

/// Priority for tool-output segments.
const TOOL_OUTPUT_PRIORITY: u8 = 6;

/// The engine facade owning all pipeline stages.
pub struct ContextEngine {
    config: ContextEngineConfig,
    scorer: ContextScorer,
    curator: ContextCurator,
    loader: ProgressiveLoader,
    governor: ContextGovernor,
    reset: ContextReset,
    predictor: ExhaustionPredictor,
    summarizer: Box<dyn TranscriptSummarizer>,
}

impl ContextEngine {
    pub fn new(config: ContextEngineConfig, exhaustion: &ExhaustionConfig) -> Self {
        Self {
            scorer: ContextScorer::new(config.clone()),
            curator: ContextCurator::new(config.clone()),
            loader: ProgressiveLoader::new(config.clone()),
            governor: ContextGovernor::new(config.clone()),
            reset: ContextReset::new(config.clone()),
            predictor: ExhaustionPredictor::new(exhaustion.threshold),
            summarizer: Box::new(HeuristicSummarizer),
            config,
        }
    }

    /// Swap in a different transcript summarizer (e.g. LLM-backed).
    pub fn with_summarizer(mut self, summarizer: Box<dyn TranscriptSummarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    /// Attach a workspace root for loader file scans.
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.loader = ProgressiveLoader::new(self.config.clone()).with_workspace_root(root);
        self
    }

    pub fn config(&self) -> &ContextEngineConfig {
        &self.config
    }

    /// Stage (a): pre-process before the LLM call.
    pub fn pre_process(&self, state: &mut ChatState) -> qc_types::Result<()> {
        self.ingest_new_messages(state);
        self.loader.prepare(state);
        state.recompute_window_used();

        let quality = self.scorer.evaluate(state);
        if state.context_window_used > self.config.optimal_context_size
            || quality < self.config.quality_threshold
        {
            debug!(
                used = state.context_window_used,
                quality, "curator engaged"
            );
            self.curator.optimize(state);
            self.scorer.evaluate(state);
        }

        let plan = self.governor.resolve_plan(state);
        self.governor.apply(state, &plan);

        self.reset.maybe_reset(state, self.summarizer.as_ref())?;

        update_exhaustion_mode(state, &self.config, &self.predictor, "pre_process");
        invariants::mark_context_updated(state);

        state.push_metric(
            "pre_process",
            json!({
                "context_window_used": state.context_window_used,
                "quality_score": state.context_quality_score,
                "context_segments_count": state.context_segments.len(),
            }),
        );
        Ok(())
    }

    /// Stage (b): ingest a tool response.
    ///
    /// Payloads beyond `max_tool_payload_chars` are truncated; the full
    /// payload is externalized and indexed so nothing is lost.
    pub fn handle_tool_response(
        &self,
        state: &mut ChatState,
        tool_name: &str,
        payload: &Value,
    ) -> qc_types::Result<()> {
        let rendered = match payload {
            Value::String(text) => text.clone(),
            other => serde_json::to_string(other)?,
        };

        let limit = self.config.max_tool_payload_chars;
        let (content, truncated_ref) = if rendered.chars().count() > limit {
            let reference = self.externalize_payload(state, tool_name, &rendered)?;
            let truncated: String = rendered.chars().take(limit).collect();
            (
                format!("{truncated}… [truncated; full payload at ref {reference}]"),
                Some(reference),
            )
        } else {
            (rendered, None)
        };

        let value_score = self.scorer.score_tool_output(&content);
        let segment = ContextSegment {
            token_count: estimate_tokens(&content).max(1),
            ..ContextSegment::new(
                format!("tool-{}-{}", tool_name, state.context_segments.len() + 1),
                format!("tool_output:{tool_name}"),
                content,
                TOOL_OUTPUT_PRIORITY,
                0,
            )
        };
        state.context_segments.push(segment);
        state.recompute_window_used();

        state.push_metric(
            "tool_response",
            json!({
                "tool": tool_name,
                "truncated": truncated_ref.is_some(),
                "reference": truncated_ref,
                "value_score": value_score,
                "context_window_used": state.context_window_used,
            }),
        );
        Ok(())
    }

    /// Stage (c): post-process after the LLM reply.
    pub fn post_process(&self, state: &mut ChatState) -> qc_types::Result<()> {
        self.scorer.evaluate(state);
        self.reflect(state);
        self.curator.prune_stale(state);
        update_exhaustion_mode(state, &self.config, &self.predictor, "post_process");

        state.push_metric(
            "post_process",
            json!({
                "context_window_used": state.context_window_used,
                "quality_score": state.context_quality_score,
            }),
        );
        Ok(())
    }

    /// Ingest transcript messages that do not yet have segments.
    fn ingest_new_messages(&self, state: &mut ChatState) {
        let start = state.ingested_message_count.min(state.messages.len());
        let fresh: Vec<(usize, String)> = state.messages[start..]
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_human() || m.is_ai())
            .map(|(offset, m)| (start + offset, m.content().to_string()))
            .collect();

        for (index, content) in fresh {
            if content.trim().is_empty() {
                continue;
            }
            let segment = ContextSegment {
                token_count: estimate_tokens(&content).max(1),
                ..ContextSegment::new(
                    format!("conv-{index}"),
                    "conversation",
                    content,
                    CONVERSATION_PRIORITY,
                    0,
                )
            };
            state.context_segments.push(segment);
        }
        state.ingested_message_count = state.messages.len();
    }

    /// Externalize a full tool payload, returning the reference id.
    fn externalize_payload(
        &self,
        state: &mut ChatState,
        tool_name: &str,
        payload: &str,
    ) -> qc_types::Result<String> {
        let short = Uuid::new_v4().simple().to_string();
        let reference = format!("ref-{}-tool-{tool_name}", &short[..8]);
        let path = PathBuf::from(&self.config.external_memory_path)
            .join(format!("{reference}.json"));

        if self.config.externalize_write_enabled {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(
                &path,
                serde_json::to_string_pretty(&json!({
                    "reference_id": reference,
                    "tool": tool_name,
                    "archived_at": wire_timestamp(),
                    "payload": payload,
                }))?,
            )?;
        }

        state
            .external_memory_index
            .insert(reference.clone(), path.display().to_string());
        Ok(reference)
    }

    /// Post-process reflection: derive issues and deduplicated
    /// recommendations from the quality breakdown, advance the playbook,
    /// and append a curation rule for the weakest focus metric.
    fn reflect(&self, state: &mut ChatState) {
        let mut issues = Vec::new();
        let mut recommendations = Vec::new();

        for (component, value) in state.context_quality_components.clone() {
            if value < 0.5 {
                issues.push(format!("{component} below threshold ({value:.2})"));
                let recommendation = match component.as_str() {
                    "relevance" => "load goal-aligned context before the next call",
                    "completeness" => "load the context types expected for this phase",
                    "freshness" => "refresh or re-fetch stale segments",
                    "diversity" => "broaden the mix of context types",
                    "coherence" => "consolidate segments of mixed types",
                    "efficiency" => "curate aggressively to recover headroom",
                    _ => "rebalance the context window",
                };
                if !recommendations.iter().any(|r| r == recommendation) {
                    recommendations.push(recommendation.to_string());
                }
            }
        }

        if issues.is_empty() && state.context_quality_score < self.config.quality_threshold {
            issues.push(format!(
                "composite quality below threshold ({:.2})",
                state.context_quality_score
            ));
            recommendations.push("curate aggressively to recover headroom".to_string());
        }

        if issues.is_empty() {
            return;
        }

        state.reflection_log.push(Reflection {
            timestamp: wire_timestamp(),
            issues,
            recommendations: recommendations.clone(),
        });

        // Focus metric: the weakest of the actionable trio.
        let focus = ["relevance", "completeness", "diversity"]
            .iter()
            .filter_map(|name| {
                state
                    .context_quality_components
                    .get(*name)
                    .map(|v| (*name, *v))
            })
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        state.context_playbook.iterations += 1;
        if let Some((metric, quality)) = focus {
            state.context_playbook.last_reflection = Some(PlaybookReflection {
                focus_metric: metric.to_string(),
                quality,
                recorded_at: wire_timestamp(),
            });
            state.curation_rules.push(CurationRule {
                metric: metric.to_string(),
                actions: recommendations,
                created_at: wire_timestamp(),
            });
        }
    }
}

/// Validate the pointer invariant: every `pointer:` segment must resolve
/// through the external memory index. Returns offending segment ids.
pub fn dangling_pointers(state: &ChatState) -> Vec<String> {
    state
        .context_segments
        .iter()
        .filter(|segment| segment.is_pointer())
        .filter(|segment| {
            segment
                .restorable_reference
                .as_ref()
                .map(|reference| !state.external_memory_index.contains_key(reference))
                .unwrap_or(true)
        })
        .map(|segment| segment.id.clone())
        .collect()
}

/// Distinct segment types currently loaded (pointers reported under their
/// original type).
pub fn loaded_types(state: &ChatState) -> BTreeSet<String> {
    state
        .context_segments
        .iter()
        .map(|segment| {
            segment
                .segment_type
                .strip_prefix("pointer:")
                .unwrap_or(&segment.segment_type)
                .to_string()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ChatMessage;
    use qc_types::exhaustion::ExhaustionMode;

    fn engine() -> ContextEngine {
        let config = ContextEngineConfig {
            externalize_write_enabled: false,
            ..Default::default()
        };
        ContextEngine::new(config, &ExhaustionConfig::default())
    }

    #[test]
    fn pre_process_ingests_conversation_segments() {
        let engine = engine();
        let mut state = ChatState::new("c1", 120_000);
        state.messages.push(ChatMessage::human("hello there"));
        state.messages.push(ChatMessage::ai("hi, what do you need?"));

        engine.pre_process(&mut state).unwrap();

        let conversation = state
            .context_segments
            .iter()
            .filter(|s| s.segment_type == "conversation")
            .count();
        assert_eq!(conversation, 2);
        assert!(state.invariants.context_updated_in_cycle);
        assert!(state.metrics_log.iter().any(|e| e.event == "pre_process"));

        // Re-running does not double-ingest.
        engine.pre_process(&mut state).unwrap();
        let conversation_after = state
            .context_segments
            .iter()
            .filter(|s| s.segment_type == "conversation")
            .count();
        assert_eq!(conversation_after, 2);
    }

    #[test]
    fn window_accounting_invariant_after_pre_process() {
        let engine = engine();
        let mut state = ChatState::new("c1", 120_000);
        state
            .messages
            .push(ChatMessage::human("implement the thing with an error trace"));

        engine.pre_process(&mut state).unwrap();

        let sum: u64 = state.context_segments.iter().map(|s| s.token_count).sum();
        assert_eq!(state.context_window_used, sum);
    }

    #[test]
    fn tool_response_within_limit_passes_untruncated() {
        let engine = engine();
        let mut state = ChatState::new("c1", 120_000);
        let limit = engine.config().max_tool_payload_chars;
        let payload = Value::String("x".repeat(limit));

        engine
            .handle_tool_response(&mut state, "workspace_exec", &payload)
            .unwrap();

        let segment = state
            .context_segments
            .iter()
            .find(|s| s.segment_type == "tool_output:workspace_exec")
            .unwrap();
        assert!(!segment.content.contains("truncated"));
        assert!(state.external_memory_index.is_empty());
    }

    #[test]
    fn tool_response_over_limit_truncates_and_externalizes() {
        let engine = engine();
        let mut state = ChatState::new("c1", 120_000);
        let limit = engine.config().max_tool_payload_chars;
        let payload = Value::String("y".repeat(limit + 1));

        engine
            .handle_tool_response(&mut state, "workspace_exec", &payload)
            .unwrap();

        let segment = state
            .context_segments
            .iter()
            .find(|s| s.segment_type == "tool_output:workspace_exec")
            .unwrap();
        assert!(segment.content.contains("truncated"));
        assert_eq!(state.external_memory_index.len(), 1);

        let last = state.metrics_log.last().unwrap();
        assert_eq!(last.event, "tool_response");
        assert_eq!(last.payload["truncated"], json!(true));
    }

    #[test]
    fn post_process_reflects_on_weak_quality() {
        let engine = engine();
        let mut state = ChatState::new("c1", 120_000);
        state.context_quality_score = 0.55;
        // One stale low-signal segment so components come out weak.
        state.context_segments.push(ContextSegment::new(
            "s1",
            "tool_outputs",
            "recent code snippet",
            5,
            300,
        ));
        state.context_window_used = 400;

        engine.post_process(&mut state).unwrap();

        assert!(!state.reflection_log.is_empty());
        let last = state.reflection_log.last().unwrap();
        assert!(!last.issues.is_empty());
        assert_eq!(
            last.recommendations.len(),
            last.recommendations
                .iter()
                .collect::<std::collections::BTreeSet<_>>()
                .len(),
            "recommendations are deduplicated"
        );
        assert_eq!(state.context_playbook.iterations, 1);
        let focus = state
            .context_playbook
            .last_reflection
            .as_ref()
            .unwrap()
            .focus_metric
            .clone();
        assert!(["relevance", "completeness", "diversity"].contains(&focus.as_str()));
        assert!(!state.curation_rules.is_empty());
        assert!(!state.curation_rules.last().unwrap().actions.is_empty());
    }

    #[test]
    fn metrics_emitted_across_all_stages() {
        let engine = engine();
        let mut state = ChatState::new("c1", 120_000);
        state.messages.push(ChatMessage::human("do something"));

        engine.pre_process(&mut state).unwrap();
        assert!(state.metrics_log.iter().any(|e| e.event == "pre_process"));

        engine
            .handle_tool_response(&mut state, "shell", &json!({"result": "ok"}))
            .unwrap();
        assert!(state
            .metrics_log
            .iter()
            .any(|e| e.event == "tool_response"));

        engine.post_process(&mut state).unwrap();
        assert_eq!(state.metrics_log.last().unwrap().event, "post_process");
    }

    #[test]
    fn saturation_flows_through_pre_process() {
        let config = ContextEngineConfig {
            context_window_max: 100,
            optimal_context_size: 80,
            target_context_size: 95,
            externalize_write_enabled: false,
            ..Default::default()
        };
        let engine = ContextEngine::new(config, &ExhaustionConfig::default());
        let mut state = ChatState::new("c1", 100);
        state.context_segments.push(ContextSegment {
            compression_eligible: false,
            ..ContextSegment::new("s1", "conversation", "dense", 9, 95)
        });

        engine.pre_process(&mut state).unwrap();
        assert_eq!(state.exhaustion_mode, ExhaustionMode::ContextSaturation);
    }

    #[test]
    fn pointer_index_invariant_helper() {
        let mut state = ChatState::new("c1", 1000);
        let mut pointer = ContextSegment::new("p1", "pointer:memory", "[ref]", 5, 4);
        pointer.restorable_reference = Some("ref-1".into());
        state.context_segments.push(pointer);

        assert_eq!(dangling_pointers(&state), vec!["p1".to_string()]);
        state
            .external_memory_index
            .insert("ref-1".into(), "/tmp/ref-1.json".into());
        assert!(dangling_pointers(&state).is_empty());
    }
}
