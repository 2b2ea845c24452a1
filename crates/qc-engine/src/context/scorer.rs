//! Context quality scoring.
//!
//! Six sub-scores in `[0, 1]` are combined into a weighted composite:
//! relevance (overlap with the task goal and recent user turns, weighted
//! by segment priority), coherence (type-mix penalty), completeness
//! (expected types for the current PRP phase), freshness (exponential
//! decay), diversity (distinct types), and efficiency (headroom).

use std::collections::BTreeSet;

use chrono::Utc;

use qc_types::config::ContextEngineConfig;

use crate::prp::PrpState;
use crate::state::{ChatState, ContextSegment};

const WEIGHTS: [(&str, f64); 6] = [
    ("relevance", 0.30),
    ("coherence", 0.10),
    ("completeness", 0.20),
    ("freshness", 0.15),
    ("diversity", 0.10),
    ("efficiency", 0.15),
];

/// Quality scorer over the current segment set.
pub struct ContextScorer {
    config: ContextEngineConfig,
}

impl ContextScorer {
    pub fn new(config: ContextEngineConfig) -> Self {
        Self { config }
    }

    /// Compute all components, store them on the state, and return the
    /// composite.
    pub fn evaluate(&self, state: &mut ChatState) -> f64 {
        let segments = &state.context_segments;
        let relevance = self.score_relevance(segments, state);
        let coherence = score_coherence(segments);
        let completeness = score_completeness(segments, state.prp_state);
        let freshness = score_freshness(segments);
        let diversity = score_diversity(segments);
        let efficiency = self.score_efficiency(state);

        let components = [
            ("relevance", relevance),
            ("coherence", coherence),
            ("completeness", completeness),
            ("freshness", freshness),
            ("diversity", diversity),
            ("efficiency", efficiency),
        ];

        let mut composite = 0.0;
        for ((name, value), (_, weight)) in components.iter().zip(WEIGHTS.iter()) {
            composite += value * weight;
            state
                .context_quality_components
                .insert((*name).to_string(), *value);
        }
        state.context_quality_score = composite.clamp(0.0, 1.0);
        state.context_quality_score
    }

    /// Priority-weighted token overlap with the goal and recent user text.
    pub fn score_relevance(&self, segments: &[ContextSegment], state: &ChatState) -> f64 {
        if segments.is_empty() {
            return 0.0;
        }
        let mut reference = state.task_goal.clone();
        for message in state.messages.iter().rev().filter(|m| m.is_human()).take(3) {
            reference.push(' ');
            reference.push_str(message.content());
        }
        let reference_tokens = tokenize(&reference);
        if reference_tokens.is_empty() {
            return 0.5;
        }

        let mut weighted = 0.0;
        let mut weight_total = 0.0;
        for segment in segments {
            let weight = (segment.priority.max(1)) as f64;
            let tokens = tokenize(&segment.content);
            let overlap = if tokens.is_empty() {
                0.0
            } else {
                let hits = tokens.intersection(&reference_tokens).count() as f64;
                hits / tokens.len().min(reference_tokens.len()) as f64
            };
            weighted += overlap.min(1.0) * weight;
            weight_total += weight;
        }
        (weighted / weight_total).clamp(0.0, 1.0)
    }

    fn score_efficiency(&self, state: &ChatState) -> f64 {
        let max = if state.context_window_max > 0 {
            state.context_window_max
        } else {
            self.config.context_window_max
        };
        if max == 0 {
            return 0.0;
        }
        (1.0 - state.context_window_used as f64 / max as f64).clamp(0.0, 1.0)
    }

    /// Heuristic value of a tool payload: longer output carries more
    /// signal, saturating around 400 characters.
    pub fn score_tool_output(&self, output: &str) -> f64 {
        if output.trim().is_empty() {
            return 0.0;
        }
        (output.len() as f64 / 400.0).min(1.0)
    }
}

fn tokenize(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.len() > 2)
        .map(str::to_string)
        .collect()
}

/// Fewer distinct types mixed together reads more coherently.
fn score_coherence(segments: &[ContextSegment]) -> f64 {
    if segments.len() <= 1 {
        return 1.0;
    }
    let distinct: BTreeSet<&str> = segments.iter().map(|s| s.segment_type.as_str()).collect();
    (1.0 / (1.0 + 0.12 * (distinct.len().saturating_sub(1)) as f64)).clamp(0.0, 1.0)
}

/// Context types a phase is expected to have loaded.
fn expected_types(phase: PrpState) -> &'static [&'static str] {
    match phase {
        PrpState::Propose => &["conversation"],
        PrpState::Hypothesize => &["conversation", "code_context"],
        PrpState::Execute => &["code_context", "file_structure"],
        PrpState::Test => &["code_context", "test_suite"],
        PrpState::Conclude => &["conversation", "test_suite"],
    }
}

fn score_completeness(segments: &[ContextSegment], phase: PrpState) -> f64 {
    let expected = expected_types(phase);
    if expected.is_empty() {
        return 1.0;
    }
    let present: BTreeSet<&str> = segments
        .iter()
        .map(|s| {
            // A pointer still counts as presence of its original type.
            s.segment_type
                .strip_prefix("pointer:")
                .or_else(|| s.segment_type.strip_prefix("summary:"))
                .unwrap_or(&s.segment_type)
        })
        .collect();
    let hits = expected.iter().filter(|t| present.contains(**t)).count();
    hits as f64 / expected.len() as f64
}

fn score_freshness(segments: &[ContextSegment]) -> f64 {
    if segments.is_empty() {
        return 0.0;
    }
    let now = Utc::now();
    let total: f64 = segments
        .iter()
        .map(|segment| {
            let age_hours = (now - segment.timestamp).num_seconds().max(0) as f64 / 3600.0;
            (-segment.decay_rate * age_hours).exp()
        })
        .sum();
    (total / segments.len() as f64).clamp(0.0, 1.0)
}

fn score_diversity(segments: &[ContextSegment]) -> f64 {
    if segments.is_empty() {
        return 0.0;
    }
    let distinct: BTreeSet<&str> = segments.iter().map(|s| s.segment_type.as_str()).collect();
    (distinct.len() as f64 / 5.0).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn segment(id: &str, segment_type: &str, priority: u8, tokens: u64) -> ContextSegment {
        ContextSegment::new(id, segment_type, format!("{segment_type} content for {id}"), priority, tokens)
    }

    #[test]
    fn evaluate_produces_full_breakdown() {
        let config = ContextEngineConfig::default();
        let scorer = ContextScorer::new(config.clone());
        let mut state = ChatState::new("c1", config.context_window_max);
        state.context_segments = vec![
            segment("s1", "system_prompt", 9, 800),
            segment("s2", "recent_decisions", 7, 400),
            segment("s3", "tool_outputs", 6, 600),
        ];
        state.context_window_used = 1200;
        state.current_phase = "implementation".into();

        let score = scorer.evaluate(&mut state);
        assert!((0.0..=1.0).contains(&score));

        let components = &state.context_quality_components;
        for name in [
            "relevance",
            "coherence",
            "completeness",
            "freshness",
            "diversity",
            "efficiency",
        ] {
            let value = components.get(name).copied().unwrap_or(-1.0);
            assert!((0.0..=1.0).contains(&value), "{name} out of range: {value}");
        }
    }

    #[test]
    fn tool_output_heuristic_is_monotonic() {
        let scorer = ContextScorer::new(ContextEngineConfig::default());
        assert_eq!(scorer.score_tool_output(""), 0.0);
        let short = scorer.score_tool_output("short text");
        let medium = scorer.score_tool_output(&"m".repeat(120));
        let long = scorer.score_tool_output(&"l".repeat(400));
        assert!(short < medium);
        assert!(medium < long || (long - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn relevance_tracks_goal_alignment() {
        let config = ContextEngineConfig::default();
        let scorer = ContextScorer::new(config.clone());
        let mut state = ChatState::new("c1", config.context_window_max);
        state.task_goal = "implement progressive context loader for the codebase".into();

        let mut irrelevant =
            ContextSegment::new("irrelevant", "architecture_docs", "unrelated financial metrics document", 5, 50);
        let relevant = ContextSegment::new(
            "relevant",
            "code_context",
            "progressive context loader implementation details and codebase notes",
            8,
            80,
        );
        state.context_segments = vec![irrelevant.clone(), relevant.clone()];

        let aligned = scorer.score_relevance(&state.context_segments, &state);

        // Flip the priorities so the irrelevant segment dominates.
        irrelevant.priority = 9;
        let mut relevant_low = relevant;
        relevant_low.priority = 1;
        state.context_segments = vec![irrelevant, relevant_low];
        let misaligned = scorer.score_relevance(&state.context_segments, &state);

        assert!(misaligned < aligned);
    }

    #[test]
    fn freshness_decays_with_age() {
        let fresh = segment("new", "conversation", 5, 10);
        let mut stale = segment("old", "conversation", 5, 10);
        stale.timestamp = Utc::now() - Duration::days(30);

        let fresh_score = score_freshness(&[fresh]);
        let stale_score = score_freshness(&[stale]);
        assert!(fresh_score > 0.9);
        assert!(stale_score < 0.05);
    }

    #[test]
    fn completeness_counts_pointers_as_presence() {
        let mut pointer = segment("p", "pointer:test_suite", 6, 8);
        pointer.restorable_reference = Some("ref-1".into());
        let code = segment("c", "code_context", 6, 50);
        let score = score_completeness(&[pointer, code], PrpState::Test);
        assert!((score - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_context_scores_zero_diversity() {
        assert_eq!(score_diversity(&[]), 0.0);
        assert_eq!(score_freshness(&[]), 0.0);
    }
}
