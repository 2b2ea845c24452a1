//! The Perpetual Refinement Protocol state machine.
//!
//! Five states, a fixed transition table, and a cycle counter that ticks
//! on supervisor-driven restarts. Disallowed transitions never panic and
//! never error: they leave the state untouched and emit a
//! `prp_invalid_transition` event. Allowed transitions that violate a
//! soft invariant still apply, with the violations logged.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use qc_types::exhaustion::ExhaustionMode;

use crate::invariants;
use crate::state::ChatState;

/// PRP phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PrpState {
    #[default]
    Propose,
    Hypothesize,
    Execute,
    Test,
    Conclude,
}

impl PrpState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrpState::Propose => "propose",
            PrpState::Hypothesize => "hypothesize",
            PrpState::Execute => "execute",
            PrpState::Test => "test",
            PrpState::Conclude => "conclude",
        }
    }
}

/// Outcome of a transition attempt. Never an error: rejected transitions
/// are normal control flow with telemetry attached.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    /// Applied cleanly.
    Applied,
    /// Applied, but one or more soft invariants were violated (logged).
    ViolatedButApplied(Vec<Value>),
    /// Disallowed; state unchanged.
    Rejected,
}

impl TransitionOutcome {
    pub fn was_applied(&self) -> bool {
        !matches!(self, TransitionOutcome::Rejected)
    }
}

/// Whether `from → to` is permitted given the trigger context.
fn is_allowed(
    from: PrpState,
    to: PrpState,
    supervisor_triggered: bool,
    exhaustion: ExhaustionMode,
) -> bool {
    match (from, to) {
        // A rejection restarts the refinement loop.
        (PrpState::Propose, PrpState::Hypothesize) => supervisor_triggered,
        // Internal acceptance goes straight to execution.
        (PrpState::Propose, PrpState::Execute) => true,
        (PrpState::Hypothesize, PrpState::Execute) => true,
        (PrpState::Execute, PrpState::Test) => true,
        // Failures and exhaustion loop back for a new hypothesis.
        (PrpState::Test, PrpState::Hypothesize) => {
            supervisor_triggered || exhaustion != ExhaustionMode::None
        }
        // Concluding requires a clean exhaustion slate.
        (PrpState::Test, PrpState::Conclude) => exhaustion == ExhaustionMode::None,
        (PrpState::Conclude, PrpState::Propose) => true,
        _ => false,
    }
}

/// Attempt a PRP transition.
///
/// Allowed transitions update `prp_state`, tick the cycle counter on
/// supervisor-caused entries into `Hypothesize`, check soft invariants on
/// entries into `Conclude`/`Propose`, and emit a `prp_transition` event.
/// Disallowed transitions emit `prp_invalid_transition` (to both the PRP
/// telemetry and the metrics log) and change nothing.
pub fn apply_prp_transition(
    state: &mut ChatState,
    to: PrpState,
    supervisor_triggered: bool,
) -> TransitionOutcome {
    let from = state.prp_state;

    if !is_allowed(from, to, supervisor_triggered, state.exhaustion_mode) {
        let payload = json!({
            "from": from.as_str(),
            "to": to.as_str(),
            "supervisor_triggered": supervisor_triggered,
            "exhaustion_mode": state.exhaustion_mode.as_str(),
        });
        state.push_telemetry("prp_invalid_transition", payload.clone());
        state.push_metric("prp_invalid_transition", payload);
        debug!(from = from.as_str(), to = to.as_str(), "prp transition rejected");
        return TransitionOutcome::Rejected;
    }

    let violations = invariants::check_transition_invariants(state, from, to);

    state.prp_state = to;

    if to == PrpState::Hypothesize && supervisor_triggered {
        state.prp_cycle_count += 1;
    }

    // A new cycle starts when the loop wraps back to Propose.
    if to == PrpState::Propose {
        state.invariants.context_updated_in_cycle = false;
        state.invariants.skepticism_gate_satisfied = false;
    }

    state.push_telemetry(
        "prp_transition",
        json!({
            "from": from.as_str(),
            "to": to.as_str(),
            "supervisor_triggered": supervisor_triggered,
            "cycle": state.prp_cycle_count,
            "violations": violations.len(),
        }),
    );

    if violations.is_empty() {
        TransitionOutcome::Applied
    } else {
        TransitionOutcome::ViolatedButApplied(violations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ChatState {
        let mut state = ChatState::new("c1", 4096);
        // Invariant flags satisfied so the happy path stays clean.
        state.invariants.context_updated_in_cycle = true;
        state.invariants.skepticism_gate_satisfied = true;
        state
    }

    #[test]
    fn happy_path_transitions() {
        let mut state = state();

        assert!(apply_prp_transition(&mut state, PrpState::Execute, false).was_applied());
        assert_eq!(state.prp_state, PrpState::Execute);

        assert!(apply_prp_transition(&mut state, PrpState::Test, false).was_applied());
        assert_eq!(state.prp_state, PrpState::Test);

        state.exhaustion_mode = ExhaustionMode::None;
        assert!(apply_prp_transition(&mut state, PrpState::Conclude, false).was_applied());
        assert_eq!(state.prp_state, PrpState::Conclude);

        assert!(apply_prp_transition(&mut state, PrpState::Propose, false).was_applied());
        assert_eq!(state.prp_state, PrpState::Propose);
    }

    #[test]
    fn restart_requires_supervisor_trigger() {
        let mut state = state();
        let cycles_before = state.prp_cycle_count;

        let outcome = apply_prp_transition(&mut state, PrpState::Hypothesize, false);
        assert_eq!(outcome, TransitionOutcome::Rejected);
        assert_eq!(state.prp_state, PrpState::Propose);
        assert!(state
            .metrics_log
            .iter()
            .any(|e| e.event == "prp_invalid_transition"));

        let outcome = apply_prp_transition(&mut state, PrpState::Hypothesize, true);
        assert!(outcome.was_applied());
        assert_eq!(state.prp_state, PrpState::Hypothesize);
        assert_eq!(state.prp_cycle_count, cycles_before + 1);
    }

    #[test]
    fn cycle_counter_increments_exactly_once_per_rejection() {
        let mut state = state();
        apply_prp_transition(&mut state, PrpState::Hypothesize, true);
        assert_eq!(state.prp_cycle_count, 1);

        apply_prp_transition(&mut state, PrpState::Execute, false);
        apply_prp_transition(&mut state, PrpState::Test, false);
        apply_prp_transition(&mut state, PrpState::Conclude, false);
        apply_prp_transition(&mut state, PrpState::Propose, false);
        assert_eq!(state.prp_cycle_count, 1, "only rejections tick the counter");
    }

    #[test]
    fn test_failure_loops_back_to_hypothesize() {
        let mut state = state();
        apply_prp_transition(&mut state, PrpState::Execute, false);
        apply_prp_transition(&mut state, PrpState::Test, false);

        state.exhaustion_mode = ExhaustionMode::TestFailure;
        assert!(apply_prp_transition(&mut state, PrpState::Hypothesize, false).was_applied());
        assert_eq!(state.prp_state, PrpState::Hypothesize);
    }

    #[test]
    fn conclude_blocked_while_exhausted() {
        let mut state = state();
        apply_prp_transition(&mut state, PrpState::Execute, false);
        apply_prp_transition(&mut state, PrpState::Test, false);

        state.exhaustion_mode = ExhaustionMode::TestFailure;
        let outcome = apply_prp_transition(&mut state, PrpState::Conclude, false);
        assert_eq!(outcome, TransitionOutcome::Rejected);
        assert_eq!(state.prp_state, PrpState::Test);
    }

    #[test]
    fn invalid_transition_leaves_state_and_emits_telemetry() {
        let mut state = state();
        let outcome = apply_prp_transition(&mut state, PrpState::Test, false);
        assert_eq!(outcome, TransitionOutcome::Rejected);
        assert_eq!(state.prp_state, PrpState::Propose);
        let invalid_events = state
            .prp_telemetry
            .iter()
            .filter(|e| e.event == "prp_invalid_transition")
            .count();
        assert_eq!(invalid_events, 1);
    }

    #[test]
    fn violations_are_logged_but_transition_applies() {
        let mut state = ChatState::new("c1", 4096);
        // Flags intentionally unsatisfied.
        apply_prp_transition(&mut state, PrpState::Execute, false);
        apply_prp_transition(&mut state, PrpState::Test, false);
        state.exhaustion_mode = ExhaustionMode::None;

        let outcome = apply_prp_transition(&mut state, PrpState::Conclude, false);
        match outcome {
            TransitionOutcome::ViolatedButApplied(violations) => {
                assert!(!violations.is_empty());
            }
            other => panic!("expected violations, got {other:?}"),
        }
        assert_eq!(state.prp_state, PrpState::Conclude);
        assert!(!state.invariants.violation_log.is_empty());
    }
}
