//! Graph executor.
//!
//! One envelope triggers one graph invocation: a small DAG of uniformly
//! `state → state` nodes expressed as a tagged [`NodeKind`] with a shared
//! transition function. The driver/tool pair loops until the model stops
//! requesting tools (bounded), then the PRP trigger advances the
//! protocol and post-process closes the cycle. Cancellation is honored
//! between nodes; a cancelled invocation reports itself so the caller
//! can skip the checkpoint.

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use qc_engine::context::ContextEngine;
use qc_engine::prp::{apply_prp_transition, PrpState};
use qc_engine::state::{ChatMessage, ChatState};
use qc_engine::time_travel::TimeTravelRecorder;
use qc_types::exhaustion::ExhaustionMode;
use qc_types::Result;

use crate::driver::{build_request, ChatModel};
use crate::tools::ToolRegistry;

/// Upper bound on driver/tool rounds in one invocation.
const DEFAULT_MAX_TOOL_ROUNDS: usize = 8;

/// Node kinds of the invocation DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    PreProcess,
    Driver,
    ToolExec,
    PrpTrigger,
    PostProcess,
}

impl NodeKind {
    fn as_str(&self) -> &'static str {
        match self {
            NodeKind::PreProcess => "pre_process",
            NodeKind::Driver => "driver",
            NodeKind::ToolExec => "tool_exec",
            NodeKind::PrpTrigger => "prp_trigger",
            NodeKind::PostProcess => "post_process",
        }
    }
}

/// Result of one invocation.
#[derive(Debug, Clone, Default)]
pub struct GraphOutcome {
    /// The invocation was aborted between nodes; partial output was
    /// discarded and no checkpoint should be written.
    pub cancelled: bool,
    /// A tool dispatched work to peer agents this invocation.
    pub delegated: bool,
    /// Final assistant text, when one was produced.
    pub reply: Option<String>,
}

struct InvocationCtx {
    rounds: usize,
    delegated: bool,
    /// A supervisor rejection was applied just before this invocation;
    /// the protocol stays in `Hypothesize` until the next envelope.
    hold_prp: bool,
    /// Ledger length at invocation start, to detect fresh proposals.
    ledger_mark: usize,
}

/// Executes the node DAG for one envelope.
pub struct GraphExecutor {
    engine: Arc<ContextEngine>,
    model: Arc<dyn ChatModel>,
    tools: Arc<ToolRegistry>,
    recorder: Option<Arc<TimeTravelRecorder>>,
    system_prompt: String,
    max_tool_rounds: usize,
}

impl GraphExecutor {
    pub fn new(
        engine: Arc<ContextEngine>,
        model: Arc<dyn ChatModel>,
        tools: Arc<ToolRegistry>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            model,
            tools,
            recorder: None,
            system_prompt: system_prompt.into(),
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
        }
    }

    /// Attach a time-travel recorder.
    pub fn with_recorder(mut self, recorder: Arc<TimeTravelRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn with_max_tool_rounds(mut self, rounds: usize) -> Self {
        self.max_tool_rounds = rounds.max(1);
        self
    }

    fn record(&self, state: &ChatState, node: NodeKind) {
        if let Some(recorder) = &self.recorder {
            recorder.log_stage(state, node.as_str(), json!({}));
        }
    }

    /// Run the DAG once against the state.
    pub async fn invoke(
        &self,
        state: &mut ChatState,
        cancel: &CancellationToken,
    ) -> Result<GraphOutcome> {
        self.invoke_gated(state, cancel, false).await
    }

    /// Like [`invoke`](Self::invoke), but with the PRP trigger held: used
    /// for envelopes that already applied a supervisor-driven transition.
    pub async fn invoke_gated(
        &self,
        state: &mut ChatState,
        cancel: &CancellationToken,
        hold_prp: bool,
    ) -> Result<GraphOutcome> {
        let mut ctx = InvocationCtx {
            rounds: 0,
            delegated: false,
            hold_prp,
            ledger_mark: state.refinement_ledger.len(),
        };
        let mut node = Some(NodeKind::PreProcess);

        while let Some(current) = node {
            if cancel.is_cancelled() {
                info!(node = current.as_str(), "graph invocation cancelled between nodes");
                return Ok(GraphOutcome {
                    cancelled: true,
                    delegated: ctx.delegated,
                    reply: None,
                });
            }
            node = self.transition(current, state, &mut ctx).await?;
            self.record(state, current);
        }

        let reply = state
            .messages
            .iter()
            .rev()
            .find(|m| m.is_ai() && !m.content().trim().is_empty())
            .map(|m| m.content().to_string());

        Ok(GraphOutcome {
            cancelled: false,
            delegated: ctx.delegated,
            reply,
        })
    }

    /// The shared transition function: run one node, return the next.
    async fn transition(
        &self,
        node: NodeKind,
        state: &mut ChatState,
        ctx: &mut InvocationCtx,
    ) -> Result<Option<NodeKind>> {
        match node {
            NodeKind::PreProcess => {
                self.engine.pre_process(state)?;
                Ok(Some(NodeKind::Driver))
            }
            NodeKind::Driver => {
                let request = build_request(&self.system_prompt, state, self.tools.schemas());
                let response = self.model.complete(&request).await?;

                if response.is_empty() {
                    state.exhaustion_mode = ExhaustionMode::LlmStop;
                    state.flag_false_stop("llm_stop", "driver", None);
                    debug!("empty model reply classified as llm_stop");
                    state.messages.push(ChatMessage::ai(String::new()));
                    return Ok(Some(NodeKind::PrpTrigger));
                }

                let has_tools = !response.tool_calls.is_empty();
                state.messages.push(ChatMessage::Ai {
                    content: response.content,
                    tool_calls: response.tool_calls,
                });
                if has_tools && ctx.rounds < self.max_tool_rounds {
                    Ok(Some(NodeKind::ToolExec))
                } else {
                    if has_tools {
                        // Saturated: requested tools will not run this
                        // invocation. The next transition routes through
                        // hypothesize.
                        state.exhaustion_mode = ExhaustionMode::ToolBackpressure;
                        state.push_telemetry(
                            "tool_backpressure",
                            json!({ "rounds": ctx.rounds }),
                        );
                    }
                    Ok(Some(NodeKind::PrpTrigger))
                }
            }
            NodeKind::ToolExec => {
                ctx.rounds += 1;
                let calls = match state.messages.last() {
                    Some(ChatMessage::Ai { tool_calls, .. }) => tool_calls.clone(),
                    _ => Vec::new(),
                };
                for call in calls {
                    let outcome = self
                        .tools
                        .dispatch(&call.name, call.arguments.clone(), state)
                        .await;
                    ctx.delegated |= outcome.effects.delegated;
                    self.engine
                        .handle_tool_response(state, &call.name, &outcome.output)?;
                    state.messages.push(ChatMessage::tool(
                        serde_json::to_string(&outcome.output)?,
                        call.name.clone(),
                        call.id.clone(),
                    ));
                }
                Ok(Some(NodeKind::Driver))
            }
            NodeKind::PrpTrigger => {
                self.advance_prp(state, ctx);
                Ok(Some(NodeKind::PostProcess))
            }
            NodeKind::PostProcess => {
                self.engine.post_process(state)?;
                Ok(None)
            }
        }
    }

    /// Advance the protocol by one step based on where the cycle stands,
    /// what happened this invocation, and whether exhaustion is set.
    fn advance_prp(&self, state: &mut ChatState, ctx: &InvocationCtx) {
        if ctx.hold_prp {
            return;
        }
        match state.prp_state {
            PrpState::Propose => {
                // Internal acceptance; rejections arrive via the gate.
                apply_prp_transition(state, PrpState::Execute, false);
            }
            PrpState::Hypothesize => {
                // A fresh ledger proposal is what moves hypothesizing
                // into execution.
                if state.refinement_ledger.len() > ctx.ledger_mark {
                    apply_prp_transition(state, PrpState::Execute, false);
                }
            }
            PrpState::Execute => {
                apply_prp_transition(state, PrpState::Test, false);
            }
            PrpState::Test => {
                if state.exhaustion_mode == ExhaustionMode::None {
                    apply_prp_transition(state, PrpState::Conclude, false);
                } else {
                    apply_prp_transition(state, PrpState::Hypothesize, false);
                }
            }
            PrpState::Conclude => {
                apply_prp_transition(state, PrpState::Propose, false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{ModelResponse, ScriptedModel};
    use qc_types::config::{ContextEngineConfig, ExhaustionConfig};

    fn executor(responses: Vec<ModelResponse>) -> GraphExecutor {
        let config = ContextEngineConfig {
            externalize_write_enabled: false,
            ..Default::default()
        };
        let engine = Arc::new(ContextEngine::new(config, &ExhaustionConfig::default()));
        GraphExecutor::new(
            engine,
            Arc::new(ScriptedModel::new(responses)),
            Arc::new(ToolRegistry::new()),
            "You are a test process.",
        )
    }

    #[tokio::test]
    async fn plain_reply_flows_through_all_nodes() {
        let executor = executor(vec![ModelResponse::text("done")]);
        let mut state = ChatState::new("c1", 120_000);
        state.messages.push(ChatMessage::human("hello"));

        let outcome = executor
            .invoke(&mut state, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!outcome.cancelled);
        assert_eq!(outcome.reply.as_deref(), Some("done"));
        // Propose advanced to Execute through the trigger node.
        assert_eq!(state.prp_state, PrpState::Execute);
        assert!(state.metrics_log.iter().any(|e| e.event == "pre_process"));
        assert!(state.metrics_log.iter().any(|e| e.event == "post_process"));
    }

    #[tokio::test]
    async fn empty_reply_is_llm_stop() {
        let executor = executor(vec![ModelResponse::default()]);
        let mut state = ChatState::new("c1", 120_000);
        state.messages.push(ChatMessage::human("hello"));

        let outcome = executor
            .invoke(&mut state, &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.reply.is_none());
        assert_eq!(state.exhaustion_mode, ExhaustionMode::LlmStop);
        assert_eq!(state.autonomy_counters.false_stop_pending, 1);
    }

    #[tokio::test]
    async fn cancelled_token_aborts_before_work() {
        let executor = executor(vec![ModelResponse::text("never")]);
        let mut state = ChatState::new("c1", 120_000);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = executor.invoke(&mut state, &cancel).await.unwrap();
        assert!(outcome.cancelled);
        assert!(state.messages.is_empty(), "no partial output retained");
    }

    #[tokio::test]
    async fn test_state_with_failure_loops_to_hypothesize() {
        let executor = executor(vec![ModelResponse::text("looking into the failure")]);
        let mut state = ChatState::new("c1", 120_000);
        state.messages.push(ChatMessage::human("tests failed"));
        state.prp_state = PrpState::Test;
        state.exhaustion_mode = ExhaustionMode::TestFailure;

        executor
            .invoke(&mut state, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(state.prp_state, PrpState::Hypothesize);
    }

    #[tokio::test]
    async fn test_state_clean_concludes() {
        let executor = executor(vec![ModelResponse::text("all green")]);
        let mut state = ChatState::new("c1", 120_000);
        state.messages.push(ChatMessage::human("status?"));
        state.prp_state = PrpState::Test;
        state.invariants.context_updated_in_cycle = true;
        state.invariants.skepticism_gate_satisfied = true;

        executor
            .invoke(&mut state, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(state.prp_state, PrpState::Conclude);
    }
}
