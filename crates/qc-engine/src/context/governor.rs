//! Context governor.
//!
//! Produces a plan of per-segment decisions plus a prompt outline for the
//! driver, then applies it. An externally injected plan override (e.g.
//! from an LLM-backed planner) is honored verbatim; otherwise a
//! deterministic fallback planner runs.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use qc_types::config::ContextEngineConfig;

use crate::context::curator::ContextCurator;
use crate::context::reducer::reduce_content;
use crate::state::{estimate_tokens, ChatState};

/// Decision the governor can take for one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GovernorDecision {
    Retain,
    Compress,
    Summarize,
    Isolate,
    Externalize,
    Discard,
}

/// One planned action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorAction {
    pub segment_id: String,
    pub decision: GovernorDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus: Option<String>,
}

/// Outline the driver uses to order the prompt.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PromptOutline {
    #[serde(default)]
    pub system: String,
    #[serde(default)]
    pub focus: Vec<String>,
    #[serde(default)]
    pub ordered_segments: Vec<String>,
}

/// A full governor plan.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GovernorPlan {
    #[serde(default)]
    pub actions: Vec<GovernorAction>,
    #[serde(default)]
    pub prompt_outline: PromptOutline,
}

/// The governor.
pub struct ContextGovernor {
    config: ContextEngineConfig,
}

impl ContextGovernor {
    pub fn new(config: ContextEngineConfig) -> Self {
        Self { config }
    }

    /// Deterministic fallback plan: keep what is valuable, shrink what is
    /// bulky, drop what is noise, and order the prompt by priority.
    pub fn plan(&self, state: &ChatState) -> GovernorPlan {
        let mut actions = Vec::new();
        let over_budget = state.context_window_used > self.config.optimal_context_size;

        for segment in &state.context_segments {
            let decision = if segment.is_pointer() {
                GovernorDecision::Retain
            } else if segment.priority <= 1 {
                GovernorDecision::Discard
            } else if over_budget && segment.token_count > self.config.reducer_target_tokens * 4 {
                GovernorDecision::Externalize
            } else if segment.token_count > self.config.reducer_target_tokens * 2
                && segment.compression_eligible
            {
                GovernorDecision::Compress
            } else {
                GovernorDecision::Retain
            };
            actions.push(GovernorAction {
                segment_id: segment.id.clone(),
                decision,
                priority: None,
                focus: None,
            });
        }

        let mut ordered: Vec<(&String, u8)> = state
            .context_segments
            .iter()
            .map(|s| (&s.id, s.priority))
            .collect();
        ordered.sort_by(|a, b| b.1.cmp(&a.1));

        let system = if state.task_goal.is_empty() {
            "Work the current request to completion.".to_string()
        } else {
            format!("Stay focused on: {}", state.task_goal)
        };

        GovernorPlan {
            actions,
            prompt_outline: PromptOutline {
                system,
                focus: vec![state.current_phase.clone()]
                    .into_iter()
                    .filter(|f| !f.is_empty())
                    .collect(),
                ordered_segments: ordered.into_iter().map(|(id, _)| id.clone()).collect(),
            },
        }
    }

    /// Apply a plan: execute per-segment actions, reorder segments to
    /// match the outline, publish the plan and outline on the state, and
    /// emit metric events.
    pub fn apply(&self, state: &mut ChatState, plan: &GovernorPlan) {
        let curator = ContextCurator::new(self.config.clone());

        for action in &plan.actions {
            let Some(index) = state
                .context_segments
                .iter()
                .position(|s| s.id == action.segment_id)
            else {
                continue;
            };

            match action.decision {
                GovernorDecision::Retain => {
                    if let Some(priority) = action.priority {
                        state.context_segments[index].priority = priority.min(10);
                    }
                }
                GovernorDecision::Compress | GovernorDecision::Summarize => {
                    let segment = &mut state.context_segments[index];
                    let before = segment.token_count;
                    let target = (before / 2).min(self.config.reducer_target_tokens).max(1);
                    segment.content = reduce_content(&segment.content, target);
                    segment.token_count = estimate_tokens(&segment.content).min(before);
                    segment.compression_eligible = false;
                    if action.decision == GovernorDecision::Summarize
                        && !segment.segment_type.starts_with("summary:")
                    {
                        segment.segment_type = format!("summary:{}", segment.segment_type);
                    }
                    let event = json!({
                        "action": if action.decision == GovernorDecision::Summarize { "summarize" } else { "compress" },
                        "segment_id": action.segment_id,
                        "before_tokens": before,
                        "after_tokens": state.context_segments[index].token_count,
                        "focus": action.focus,
                        "stage": "govern",
                    });
                    state.push_metric(
                        if action.decision == GovernorDecision::Summarize {
                            "summarize"
                        } else {
                            "compress"
                        },
                        event,
                    );
                }
                GovernorDecision::Isolate => {
                    // Parked out of the prompt but kept restorable in
                    // working memory.
                    let segment = state.context_segments.remove(index);
                    state.working_memory.insert(segment.id.clone(), segment.clone());
                    state.push_metric(
                        "isolate",
                        json!({
                            "action": "isolate",
                            "segment_id": segment.id,
                            "before_tokens": segment.token_count,
                            "after_tokens": 0,
                            "stage": "govern",
                        }),
                    );
                }
                GovernorDecision::Externalize => {
                    let segment = state.context_segments[index].clone();
                    if segment.is_pointer() {
                        continue;
                    }
                    let before = segment.token_count;
                    let (pointer, reference, path) = curator.externalize_segment(&segment);
                    let after = pointer.token_count;
                    state.context_segments[index] = pointer;
                    state.external_memory_index.insert(reference, path);
                    state.push_metric(
                        "externalize",
                        json!({
                            "action": "externalize",
                            "segment_id": segment.id,
                            "before_tokens": before,
                            "after_tokens": after,
                            "stage": "govern",
                        }),
                    );
                }
                GovernorDecision::Discard => {
                    let removed = state.context_segments.remove(index);
                    state.push_metric(
                        "discard",
                        json!({
                            "action": "discard",
                            "segment_id": removed.id,
                            "before_tokens": removed.token_count,
                            "after_tokens": 0,
                            "stage": "govern",
                        }),
                    );
                }
            }
        }

        reorder_segments(state, &plan.prompt_outline.ordered_segments);

        state.governor_plan = serde_json::to_value(plan).ok();
        state.governor_prompt_outline = serde_json::to_value(&plan.prompt_outline).ok();
        state.recompute_window_used();
        state.push_metric(
            "governor_plan",
            json!({
                "actions": plan.actions.len(),
                "ordered_segments": plan.prompt_outline.ordered_segments.len(),
            }),
        );
        debug!(actions = plan.actions.len(), "governor plan applied");
    }

    /// Resolve the plan to apply: an override takes precedence over the
    /// deterministic fallback. Malformed overrides are ignored.
    pub fn resolve_plan(&self, state: &mut ChatState) -> GovernorPlan {
        if let Some(raw) = state.governor_plan_override.take() {
            match serde_json::from_value::<GovernorPlan>(raw.clone()) {
                Ok(plan) => return plan,
                Err(err) => {
                    debug!(error = %err, "governor plan override malformed, using fallback");
                    state.push_metric(
                        "governor_override_rejected",
                        json!({ "error": err.to_string() }),
                    );
                }
            }
        }
        self.plan(state)
    }
}

/// Stable reorder: listed segments first in outline order, the rest in
/// their existing order.
fn reorder_segments(state: &mut ChatState, ordered_ids: &[String]) {
    if ordered_ids.is_empty() {
        return;
    }
    let mut leading = Vec::new();
    for id in ordered_ids {
        if let Some(index) = state.context_segments.iter().position(|s| &s.id == id) {
            leading.push(state.context_segments.remove(index));
        }
    }
    let mut rest = std::mem::take(&mut state.context_segments);
    leading.append(&mut rest);
    state.context_segments = leading;
}
