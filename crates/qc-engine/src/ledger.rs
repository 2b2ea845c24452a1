//! Refinement ledger operations.
//!
//! The ledger is the append-only record of hypotheses across PRP cycles.
//! Proposals pass a novelty guard (a near-duplicate of an earlier
//! hypothesis needs an explicit differentiating strategy), conclusions
//! mutate rows in place, and causal chains are resolved on demand by
//! walking `dependencies`; rows never hold references to each other.

use std::collections::BTreeSet;

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::state::{ChatState, LedgerEntry, LedgerStatus};

/// Novelty below this is a duplicate unless a strategy is supplied.
const NOVELTY_THRESHOLD: f64 = 0.25;

/// Outcome of a ledger operation, reported back to the LLM as tool output
/// and to telemetry. Rejections are values, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerOutcome {
    Proposed { cycle_id: String },
    Rejected { reason: String },
    Concluded { cycle_id: String },
    Queried { matches: Vec<Value> },
    CausalChain { report: Value },
}

/// A `propose_hypothesis` request.
#[derive(Debug, Clone, Default)]
pub struct ProposeRequest {
    pub hypothesis: String,
    pub strategy: Option<String>,
    pub summary: Option<String>,
    pub dependencies: Vec<String>,
    pub metadata: Map<String, Value>,
}

fn tokenize(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.len() > 2)
        .map(str::to_string)
        .collect()
}

/// Text distance of a hypothesis to its nearest ledger neighbour:
/// `1 - max Jaccard overlap`. An empty ledger is maximally novel.
pub fn novelty_score(hypothesis: &str, ledger: &[LedgerEntry]) -> f64 {
    let candidate = tokenize(hypothesis);
    if candidate.is_empty() {
        return 0.0;
    }
    let mut best_similarity: f64 = 0.0;
    for entry in ledger {
        let existing = tokenize(&entry.hypothesis);
        if existing.is_empty() {
            continue;
        }
        let intersection = candidate.intersection(&existing).count() as f64;
        let union = candidate.union(&existing).count() as f64;
        best_similarity = best_similarity.max(intersection / union);
    }
    1.0 - best_similarity
}

/// Success rate across the dependency set, 0.5 when nothing concluded yet.
fn dependency_success_rate(dependencies: &[String], ledger: &[LedgerEntry]) -> f64 {
    let mut successes = 0u32;
    let mut concluded = 0u32;
    for dep in dependencies {
        if let Some(entry) = ledger.iter().find(|e| &e.cycle_id == dep) {
            match entry.status {
                LedgerStatus::Succeeded => {
                    successes += 1;
                    concluded += 1;
                }
                LedgerStatus::Failed | LedgerStatus::Abandoned => concluded += 1,
                _ => {}
            }
        }
    }
    if concluded == 0 {
        0.5
    } else {
        successes as f64 / concluded as f64
    }
}

fn next_cycle_id(ledger: &[LedgerEntry]) -> String {
    format!("cycle-{:04}", ledger.len() + 1)
}

/// Propose a hypothesis.
///
/// Duplicates (novelty below threshold) without a differentiating
/// strategy are rejected with a `refinement_ledger_rejected` event and
/// leave the ledger untouched.
pub fn propose_hypothesis(state: &mut ChatState, request: ProposeRequest) -> LedgerOutcome {
    let hypothesis = request.hypothesis.trim().to_string();
    if hypothesis.is_empty() {
        let reason = "hypothesis is required when proposing".to_string();
        state.push_telemetry("refinement_ledger_rejected", json!({ "reason": reason }));
        return LedgerOutcome::Rejected { reason };
    }

    let novelty = novelty_score(&hypothesis, &state.refinement_ledger);
    let strategy = request
        .strategy
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    if novelty < NOVELTY_THRESHOLD && strategy.is_none() {
        let reason = format!(
            "hypothesis duplicates an earlier attempt (novelty {novelty:.2}); \
             provide a differentiating strategy to retry it"
        );
        state.push_telemetry(
            "refinement_ledger_rejected",
            json!({ "reason": reason, "novelty_score": novelty }),
        );
        debug!(novelty, "duplicate hypothesis rejected");
        return LedgerOutcome::Rejected { reason };
    }

    let dependencies: Vec<String> = request
        .dependencies
        .iter()
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
        .collect();

    let success_rate = dependency_success_rate(&dependencies, &state.refinement_ledger);
    let predicted = 0.5 * novelty + 0.5 * success_rate;

    let cycle_id = next_cycle_id(&state.refinement_ledger);
    let mut entry = LedgerEntry::new(cycle_id.clone(), hypothesis);
    entry.strategy = strategy;
    entry.outcome_summary = request
        .summary
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("pending evaluation")
        .to_string();
    entry.dependencies = dependencies;
    entry.novelty_score = Some(novelty);
    entry.predicted_success_probability = Some(predicted);
    entry.metadata = request.metadata;

    state.refinement_ledger.push(entry);
    state.push_telemetry(
        "refinement_ledger_proposed",
        json!({
            "cycle_id": cycle_id,
            "novelty_score": novelty,
            "predicted_success_probability": predicted,
        }),
    );
    LedgerOutcome::Proposed { cycle_id }
}

/// Conclude an existing hypothesis in place.
pub fn conclude_hypothesis(
    state: &mut ChatState,
    cycle_id: &str,
    status: LedgerStatus,
    summary: &str,
) -> LedgerOutcome {
    let Some(entry) = state
        .refinement_ledger
        .iter_mut()
        .find(|entry| entry.cycle_id == cycle_id)
    else {
        let reason = format!("unknown cycle_id '{cycle_id}'");
        state.push_telemetry("refinement_ledger_rejected", json!({ "reason": reason }));
        return LedgerOutcome::Rejected { reason };
    };

    entry.status = status;
    entry.outcome_summary = summary.trim().to_string();
    let concluded = entry.clone();

    state.push_telemetry(
        "refinement_ledger_concluded",
        json!({ "cycle_id": cycle_id, "status": status.as_str() }),
    );

    // Concluded cycles feed long-term memory.
    if matches!(
        status,
        LedgerStatus::Succeeded | LedgerStatus::Failed | LedgerStatus::Abandoned
    ) {
        crate::memory::record_episode_from_ledger(state, &concluded);
        crate::memory::update_memory_guidance(state);
    }

    LedgerOutcome::Concluded {
        cycle_id: cycle_id.to_string(),
    }
}

/// Query concluded failures, newest first.
pub fn query_past_failures(
    state: &ChatState,
    filter: Option<&str>,
    limit: usize,
    include_tests: bool,
) -> Vec<Value> {
    let needle = filter.map(str::to_lowercase);
    state
        .refinement_ledger
        .iter()
        .rev()
        .filter(|entry| {
            matches!(entry.status, LedgerStatus::Failed | LedgerStatus::Abandoned)
        })
        .filter(|entry| match &needle {
            Some(needle) => {
                entry.hypothesis.to_lowercase().contains(needle)
                    || entry.outcome_summary.to_lowercase().contains(needle)
            }
            None => true,
        })
        .take(limit)
        .map(|entry| {
            let mut row = json!({
                "cycle_id": entry.cycle_id,
                "hypothesis": entry.hypothesis,
                "status": entry.status.as_str(),
                "outcome_summary": entry.outcome_summary,
                "exhaustion_trigger": entry.exhaustion_trigger.as_str(),
                "strategy": entry.strategy,
            });
            if include_tests {
                row["test_results"] = Value::Object(entry.test_results.clone());
            }
            row
        })
        .collect()
}

/// Resolve causal chains for the given cycles.
///
/// Walks `dependencies` transitively (depth-first, cycle-safe) and
/// attaches the resolved ancestor summaries to each target entry's
/// `causal_links`.
pub fn infer_causal_chain(state: &mut ChatState, cycle_ids: &[String]) -> LedgerOutcome {
    let mut report = Vec::new();

    for target in cycle_ids {
        let mut chain: Vec<Value> = Vec::new();
        let mut visited: BTreeSet<String> = BTreeSet::new();
        let mut stack: Vec<String> = state
            .refinement_ledger
            .iter()
            .find(|entry| &entry.cycle_id == target)
            .map(|entry| entry.dependencies.clone())
            .unwrap_or_default();

        while let Some(dep) = stack.pop() {
            if !visited.insert(dep.clone()) {
                continue;
            }
            if let Some(ancestor) = state.refinement_ledger.iter().find(|e| e.cycle_id == dep) {
                chain.push(json!({
                    "cycle_id": ancestor.cycle_id,
                    "status": ancestor.status.as_str(),
                    "outcome_summary": ancestor.outcome_summary,
                }));
                stack.extend(ancestor.dependencies.iter().cloned());
            }
        }

        if let Some(entry) = state
            .refinement_ledger
            .iter_mut()
            .find(|entry| &entry.cycle_id == target)
        {
            entry.causal_links = chain.clone();
        }

        report.push(json!({ "cycle_id": target, "causal_links": chain }));
    }

    let report = Value::Array(report);
    state.push_telemetry(
        "refinement_ledger_causal_inference",
        json!({ "cycle_ids": cycle_ids }),
    );
    LedgerOutcome::CausalChain { report }
}
