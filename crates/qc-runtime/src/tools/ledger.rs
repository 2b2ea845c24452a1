//! `manage_refinement_ledger` tool.
//!
//! Exposes the four ledger operations to the LLM with operation-specific
//! argument validation. Rejections (novelty guard, unknown cycle) come
//! back as structured output, not errors.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use qc_engine::invariants;
use qc_engine::ledger::{self, LedgerOutcome, ProposeRequest};
use qc_engine::state::{ChatState, LedgerStatus};

use super::{Tool, ToolError, ToolOutcome};

/// The tool.
pub struct RefinementLedgerTool;

#[derive(Debug, Deserialize)]
struct LedgerArgs {
    operation: String,
    #[serde(default)]
    hypothesis: Option<String>,
    #[serde(default)]
    strategy: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    cycle_id: Option<String>,
    #[serde(default)]
    dependencies: Vec<Value>,
    #[serde(default)]
    filter: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    include_tests: bool,
    #[serde(default)]
    cycle_ids: Vec<Value>,
    #[serde(default)]
    metadata: Map<String, Value>,
}

fn normalize_ids(values: &[Value]) -> Vec<String> {
    values
        .iter()
        .map(|value| match value {
            Value::String(text) => text.trim().to_string(),
            other => other.to_string(),
        })
        .filter(|text| !text.is_empty())
        .collect()
}

#[async_trait]
impl Tool for RefinementLedgerTool {
    fn name(&self) -> &str {
        "manage_refinement_ledger"
    }

    fn description(&self) -> &str {
        "Create, conclude, query, or analyze PRP hypotheses in the refinement ledger."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "operation": {
                    "type": "string",
                    "enum": [
                        "propose_hypothesis",
                        "conclude_hypothesis",
                        "query_past_failures",
                        "infer_causal_chain"
                    ]
                },
                "hypothesis": { "type": "string" },
                "strategy": { "type": "string" },
                "summary": { "type": "string" },
                "status": {
                    "type": "string",
                    "enum": ["succeeded", "failed", "abandoned", "in_progress"]
                },
                "cycle_id": { "type": "string" },
                "dependencies": { "type": "array", "items": { "type": "string" } },
                "filter": { "type": "string" },
                "limit": { "type": "integer", "minimum": 1, "maximum": 25 },
                "include_tests": { "type": "boolean" },
                "cycle_ids": { "type": "array", "items": { "type": "string" } },
                "metadata": { "type": "object" }
            },
            "required": ["operation"]
        })
    }

    async fn execute(&self, args: Value, state: &mut ChatState) -> Result<ToolOutcome, ToolError> {
        let args: LedgerArgs =
            serde_json::from_value(args).map_err(|e| ToolError::InvalidArgs(e.to_string()))?;

        let outcome = match args.operation.as_str() {
            "propose_hypothesis" => {
                let hypothesis = args
                    .hypothesis
                    .as_deref()
                    .map(str::trim)
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| {
                        ToolError::InvalidArgs("hypothesis is required when proposing".into())
                    })?;
                ledger::propose_hypothesis(
                    state,
                    ProposeRequest {
                        hypothesis: hypothesis.to_string(),
                        strategy: args.strategy,
                        summary: args.summary,
                        dependencies: normalize_ids(&args.dependencies),
                        metadata: args.metadata,
                    },
                )
            }
            "conclude_hypothesis" => {
                let cycle_id = args
                    .cycle_id
                    .as_deref()
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .ok_or_else(|| {
                        ToolError::InvalidArgs("cycle_id is required when concluding".into())
                    })?;
                let status = args
                    .status
                    .as_deref()
                    .and_then(LedgerStatus::parse)
                    .ok_or_else(|| {
                        ToolError::InvalidArgs("status is required when concluding".into())
                    })?;
                let summary = args
                    .summary
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| {
                        ToolError::InvalidArgs("summary is required when concluding".into())
                    })?;
                ledger::conclude_hypothesis(state, cycle_id, status, summary)
            }
            "query_past_failures" => {
                // Consulting past failures is the skeptical act the
                // invariant gate watches for.
                invariants::mark_skepticism_challenge(state);
                let matches = ledger::query_past_failures(
                    state,
                    args.filter.as_deref(),
                    args.limit.unwrap_or(5).clamp(1, 25),
                    args.include_tests,
                );
                LedgerOutcome::Queried { matches }
            }
            "infer_causal_chain" => {
                let cycle_ids = normalize_ids(&args.cycle_ids);
                if cycle_ids.is_empty() {
                    return Err(ToolError::InvalidArgs(
                        "cycle_ids must be provided when inferring causal chains".into(),
                    ));
                }
                ledger::infer_causal_chain(state, &cycle_ids)
            }
            other => {
                return Err(ToolError::InvalidArgs(format!(
                    "unknown operation '{other}'"
                )))
            }
        };

        let output = match outcome {
            LedgerOutcome::Proposed { cycle_id } => json!({
                "status": "success",
                "event": "refinement_ledger_proposed",
                "cycle_id": cycle_id,
            }),
            LedgerOutcome::Concluded { cycle_id } => json!({
                "status": "success",
                "event": "refinement_ledger_concluded",
                "cycle_id": cycle_id,
            }),
            LedgerOutcome::Rejected { reason } => json!({
                "status": "rejected",
                "event": "refinement_ledger_rejected",
                "reason": reason,
            }),
            LedgerOutcome::Queried { matches } => json!({
                "status": "success",
                "event": "refinement_ledger_query",
                "matches": matches,
            }),
            LedgerOutcome::CausalChain { report } => json!({
                "status": "success",
                "event": "refinement_ledger_causal_inference",
                "report": report,
            }),
        };
        Ok(ToolOutcome::ok(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(args: Value, state: &mut ChatState) -> Value {
        RefinementLedgerTool
            .execute(args, state)
            .await
            .map(|o| o.output)
            .unwrap_or_else(|e| json!({"status": "failed", "error": e.to_string()}))
    }

    #[tokio::test]
    async fn propose_then_conclude_round_trip() {
        let mut state = ChatState::new("c1", 512);
        let proposed = run(
            json!({
                "operation": "propose_hypothesis",
                "hypothesis": "Improve caching layer latency",
                "strategy": "queue write-through",
            }),
            &mut state,
        )
        .await;
        assert_eq!(proposed["status"], "success");
        let cycle_id = proposed["cycle_id"].as_str().unwrap().to_string();

        let concluded = run(
            json!({
                "operation": "conclude_hypothesis",
                "cycle_id": cycle_id,
                "status": "succeeded",
                "summary": "Executor shipped",
            }),
            &mut state,
        )
        .await;
        assert_eq!(concluded["event"], "refinement_ledger_concluded");
        assert_eq!(state.refinement_ledger[0].status, LedgerStatus::Succeeded);
    }

    #[tokio::test]
    async fn propose_without_hypothesis_is_invalid_args() {
        let mut state = ChatState::new("c1", 512);
        let err = RefinementLedgerTool
            .execute(json!({"operation": "propose_hypothesis"}), &mut state)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgs(_)));
    }

    #[tokio::test]
    async fn duplicate_hypothesis_surfaces_rejection() {
        let mut state = ChatState::new("c1", 512);
        run(
            json!({"operation": "propose_hypothesis", "hypothesis": "Improve caching layer latency"}),
            &mut state,
        )
        .await;
        let rejected = run(
            json!({"operation": "propose_hypothesis", "hypothesis": "Improve caching layer latency"}),
            &mut state,
        )
        .await;
        assert_eq!(rejected["status"], "rejected");
        assert_eq!(state.refinement_ledger.len(), 1);
    }

    #[tokio::test]
    async fn query_marks_skepticism_gate() {
        let mut state = ChatState::new("c1", 512);
        assert!(!state.invariants.skepticism_gate_satisfied);
        let queried = run(
            json!({"operation": "query_past_failures", "limit": 5}),
            &mut state,
        )
        .await;
        assert_eq!(queried["status"], "success");
        assert!(state.invariants.skepticism_gate_satisfied);
    }

    #[tokio::test]
    async fn causal_chain_requires_cycle_ids() {
        let mut state = ChatState::new("c1", 512);
        let err = RefinementLedgerTool
            .execute(json!({"operation": "infer_causal_chain"}), &mut state)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgs(_)));
    }
}
