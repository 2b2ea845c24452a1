//! Exhaustion detection and prediction.
//!
//! Two mechanisms: hard detection from current state (window saturation,
//! tool backpressure, empty LLM output) and a predictor over the ledger
//! tail that preempts a stall before it happens by forcing the next
//! transition through `Hypothesize`.

use serde_json::json;
use tracing::debug;

use qc_types::config::ContextEngineConfig;
use qc_types::exhaustion::ExhaustionMode;

use crate::prp::PrpState;
use crate::state::{ChatState, LedgerEntry};

/// Window-used fraction at which saturation is declared.
const SATURATION_RATIO: f64 = 0.90;

/// Ledger tail length the predictor inspects.
const PREDICTOR_WINDOW: usize = 8;

/// Recency-weighted exhaustion predictor over the refinement ledger.
pub struct ExhaustionPredictor {
    /// Probability at or above which the predictor preempts.
    pub threshold: f64,
}

impl ExhaustionPredictor {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Probability that the next cycle stalls, from the fraction of recent
    /// ledger entries that carried an exhaustion trigger, weighted toward
    /// the newest entries.
    pub fn predict_probability(&self, ledger: &[LedgerEntry]) -> f64 {
        if ledger.is_empty() {
            return 0.0;
        }
        let tail_start = ledger.len().saturating_sub(PREDICTOR_WINDOW);
        let tail = &ledger[tail_start..];

        let mut weight_total = 0.0;
        let mut weight_exhausted = 0.0;
        for (index, entry) in tail.iter().enumerate() {
            // Newest entry gets the highest weight.
            let weight = (index + 1) as f64;
            weight_total += weight;
            if entry.exhaustion_trigger != ExhaustionMode::None {
                weight_exhausted += weight;
            }
        }
        if weight_total == 0.0 {
            0.0
        } else {
            weight_exhausted / weight_total
        }
    }

    /// Whether the probability clears the preemption threshold.
    pub fn should_preempt(&self, ledger: &[LedgerEntry]) -> bool {
        self.predict_probability(ledger) >= self.threshold
    }
}

/// Recompute `exhaustion_mode` from the current state.
///
/// Ordering matters: a hard saturation signal wins over prediction; a
/// sticky failure mode (test failure, LLM stop) set elsewhere is kept
/// unless a stronger signal replaces it. When prediction fires, the PRP
/// state is steered to `Hypothesize` and the action is logged as
/// `preemptive_refinement`.
pub fn update_exhaustion_mode(
    state: &mut ChatState,
    config: &ContextEngineConfig,
    predictor: &ExhaustionPredictor,
    stage: &str,
) -> ExhaustionMode {
    let previous = state.exhaustion_mode;
    let window_max = if state.context_window_max > 0 {
        state.context_window_max
    } else {
        config.context_window_max
    };

    let probability = predictor.predict_probability(&state.refinement_ledger);
    state.exhaustion_probability = probability;

    let saturated =
        window_max > 0 && state.context_window_used as f64 / window_max as f64 >= SATURATION_RATIO;

    let next = if saturated {
        ExhaustionMode::ContextSaturation
    } else if probability >= predictor.threshold {
        ExhaustionMode::PredictedExhaustion
    } else if matches!(
        previous,
        ExhaustionMode::TestFailure | ExhaustionMode::LlmStop | ExhaustionMode::ToolBackpressure
    ) {
        // Sticky failure modes persist until resolved by their own path.
        previous
    } else {
        ExhaustionMode::None
    };

    if next != previous {
        state.push_metric(
            "exhaustion_update",
            json!({
                "from": previous.as_str(),
                "to": next.as_str(),
                "stage": stage,
                "probability": probability,
            }),
        );
        debug!(
            from = previous.as_str(),
            to = next.as_str(),
            stage,
            "exhaustion mode changed"
        );
    }
    state.exhaustion_mode = next;

    if next == ExhaustionMode::PredictedExhaustion && state.prp_state != PrpState::Hypothesize {
        let from = state.prp_state;
        state.prp_state = PrpState::Hypothesize;
        state.exhaustion_recovery_log.push(json!({
            "action": "preemptive_refinement",
            "from": from.as_str(),
            "probability": probability,
            "stage": stage,
        }));
        state.push_telemetry(
            "preemptive_refinement",
            json!({ "from": from.as_str(), "probability": probability }),
        );
    }

    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::LedgerStatus;
    use chrono::{Duration, Utc};

    fn ledger_entry(index: usize, exhausted: bool) -> LedgerEntry {
        let mut entry = LedgerEntry::new(format!("cycle-{index:04}"), format!("hypothesis-{index}"));
        entry.timestamp = Utc::now() - Duration::minutes(index as i64);
        entry.status = if exhausted {
            LedgerStatus::Failed
        } else {
            LedgerStatus::Succeeded
        };
        entry.exhaustion_trigger = if exhausted {
            ExhaustionMode::TestFailure
        } else {
            ExhaustionMode::None
        };
        entry
    }

    #[test]
    fn predictor_bounds_and_monotonicity() {
        let predictor = ExhaustionPredictor::new(0.5);
        assert_eq!(predictor.predict_probability(&[]), 0.0);

        let clean: Vec<LedgerEntry> = (0..6).map(|i| ledger_entry(i, false)).collect();
        assert_eq!(predictor.predict_probability(&clean), 0.0);

        let dirty: Vec<LedgerEntry> = (0..6).map(|i| ledger_entry(i, true)).collect();
        let p = predictor.predict_probability(&dirty);
        assert!((p - 1.0).abs() < f64::EPSILON);

        let mixed: Vec<LedgerEntry> = (0..8).map(|i| ledger_entry(i, i >= 4)).collect();
        let p_mixed = predictor.predict_probability(&mixed);
        assert!(p_mixed > 0.5, "recent failures dominate: {p_mixed}");
        assert!(p_mixed < 1.0);
    }

    #[test]
    fn saturation_detection() {
        let config = ContextEngineConfig {
            context_window_max: 100,
            ..Default::default()
        };
        let predictor = ExhaustionPredictor::new(0.65);
        let mut state = ChatState::new("c1", 100);
        state.context_window_used = 95;

        let mode = update_exhaustion_mode(&mut state, &config, &predictor, "pre_process");
        assert_eq!(mode, ExhaustionMode::ContextSaturation);
        assert!(state.exhaustion_probability >= 0.0);
        assert!(state
            .metrics_log
            .iter()
            .any(|e| e.event == "exhaustion_update"));
    }

    #[test]
    fn boundary_below_saturation_is_clean() {
        let config = ContextEngineConfig {
            context_window_max: 100,
            ..Default::default()
        };
        let predictor = ExhaustionPredictor::new(0.65);
        let mut state = ChatState::new("c1", 100);
        state.context_window_used = 89;

        let mode = update_exhaustion_mode(&mut state, &config, &predictor, "pre_process");
        assert_eq!(mode, ExhaustionMode::None);
    }

    #[test]
    fn prediction_primes_prp_transition() {
        let config = ContextEngineConfig::default();
        let predictor = ExhaustionPredictor::new(0.5);
        let mut state = ChatState::new("c1", 256);
        state.refinement_ledger = (0..6).map(|i| ledger_entry(i, true)).collect();
        state.prp_state = PrpState::Execute;

        let mode = update_exhaustion_mode(&mut state, &config, &predictor, "pre_process");
        assert_eq!(mode, ExhaustionMode::PredictedExhaustion);
        assert!(state.exhaustion_probability >= predictor.threshold);
        assert_eq!(state.prp_state, PrpState::Hypothesize);
        assert!(state
            .exhaustion_recovery_log
            .iter()
            .any(|e| e.get("action").and_then(|v| v.as_str()) == Some("preemptive_refinement")));
    }

    #[test]
    fn sticky_failure_mode_survives_update() {
        let config = ContextEngineConfig::default();
        let predictor = ExhaustionPredictor::new(0.99);
        let mut state = ChatState::new("c1", 100_000);
        state.exhaustion_mode = ExhaustionMode::TestFailure;

        let mode = update_exhaustion_mode(&mut state, &config, &predictor, "post_process");
        assert_eq!(mode, ExhaustionMode::TestFailure);
    }
}
