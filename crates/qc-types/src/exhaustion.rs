//! Exhaustion-mode classification.
//!
//! An exhaustion mode tags why forward progress has stalled; it travels on
//! the wire inside supervisor triggers and response payloads, and drives
//! the recovery strategy chosen by the PRP state machine.

use serde::{Deserialize, Serialize};

/// Why progress has stalled, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionMode {
    /// Progress is normal.
    #[default]
    None,
    /// The context window is at or past the saturation threshold.
    ContextSaturation,
    /// Retry budget for the current operation is spent.
    RetryDepletion,
    /// Tool dispatch is saturated and applying backpressure.
    ToolBackpressure,
    /// The LLM stopped producing output (empty assistant reply).
    LlmStop,
    /// A test suite or property test failed.
    TestFailure,
    /// The hypothesis space looks spent.
    HypothesisExhausted,
    /// The predictor expects imminent exhaustion and is preempting.
    PredictedExhaustion,
}

impl ExhaustionMode {
    /// Wire string for the mode (`snake_case`, matches serde encoding).
    pub fn as_str(&self) -> &'static str {
        match self {
            ExhaustionMode::None => "none",
            ExhaustionMode::ContextSaturation => "context_saturation",
            ExhaustionMode::RetryDepletion => "retry_depletion",
            ExhaustionMode::ToolBackpressure => "tool_backpressure",
            ExhaustionMode::LlmStop => "llm_stop",
            ExhaustionMode::TestFailure => "test_failure",
            ExhaustionMode::HypothesisExhausted => "hypothesis_exhausted",
            ExhaustionMode::PredictedExhaustion => "predicted_exhaustion",
        }
    }

    /// Parse a wire string, tolerating surrounding whitespace.
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim() {
            "none" => Some(ExhaustionMode::None),
            "context_saturation" => Some(ExhaustionMode::ContextSaturation),
            "retry_depletion" => Some(ExhaustionMode::RetryDepletion),
            "tool_backpressure" => Some(ExhaustionMode::ToolBackpressure),
            "llm_stop" => Some(ExhaustionMode::LlmStop),
            "test_failure" => Some(ExhaustionMode::TestFailure),
            "hypothesis_exhausted" => Some(ExhaustionMode::HypothesisExhausted),
            "predicted_exhaustion" => Some(ExhaustionMode::PredictedExhaustion),
            _ => None,
        }
    }
}
