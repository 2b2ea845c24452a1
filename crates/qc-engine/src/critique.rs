//! Supervisor critique translation.
//!
//! A rejection arrives as a structured trigger; this module turns it into
//! concrete work: test plans derived from the required artifacts and
//! improvement directives derived from the rationale. Application is
//! idempotent per `ticket_id` + cycle so a replayed rejection cannot
//! inflate the backlog.

use serde_json::{json, Value};

use qc_types::envelope::wire_timestamp;
use qc_types::supervisor::SupervisorTrigger;

use crate::state::{ChatState, CritiqueTask};

/// Structured output of the translator.
#[derive(Debug, Clone, PartialEq)]
pub struct CritiqueTranslation {
    /// Concrete test plans to run before resubmitting.
    pub tests: Vec<String>,
    /// Action items addressing the rationale.
    pub improvements: Vec<String>,
}

fn looks_like_test_artifact(artifact: &str) -> bool {
    let lower = artifact.to_lowercase();
    ["test", "report", "coverage", "bench", "property"]
        .iter()
        .any(|marker| lower.contains(marker))
}

/// Translate a supervisor rejection into tests and improvements.
pub fn translate_rejection(trigger: &SupervisorTrigger) -> CritiqueTranslation {
    let mut tests = Vec::new();
    let mut improvements = Vec::new();

    for artifact in &trigger.required_artifacts {
        if artifact.is_empty() {
            continue;
        }
        if looks_like_test_artifact(artifact) {
            tests.push(format!(
                "Run the suite that produces '{artifact}' and record the result"
            ));
        } else {
            improvements.push(format!(
                "Produce '{artifact}' and attach it to the next proposal"
            ));
        }
    }

    if let Some(rationale) = trigger.rationale.as_deref().filter(|r| !r.trim().is_empty()) {
        improvements.push(format!("Address reviewer concern: {}", rationale.trim()));
    }

    if tests.is_empty() {
        // A rejection always demands fresh evidence, even when no artifact
        // names a suite explicitly.
        tests.push(format!(
            "Re-run the full test suite for cycle {} and record the outcome",
            trigger.cycle_iteration
        ));
    }

    CritiqueTranslation {
        tests,
        improvements,
    }
}

/// Apply a translated critique to the chat state.
///
/// Appends one [`CritiqueTask`] to the backlog and mirrors it into the
/// current ledger row's `metadata.critiques`. Returns `false` when the
/// same `ticket_id` was already applied for the same cycle (dedup).
pub fn apply_critique(
    state: &mut ChatState,
    trigger: &SupervisorTrigger,
    ticket_id: Option<&str>,
) -> bool {
    let cycle_id = state
        .refinement_ledger
        .last()
        .map(|entry| entry.cycle_id.clone())
        .unwrap_or_else(|| format!("cycle-{:04}", trigger.cycle_iteration + 1));

    if let Some(ticket) = ticket_id {
        let duplicate = state.critique_backlog.iter().any(|task| {
            task.ticket_id.as_deref() == Some(ticket) && task.cycle_id == cycle_id
        });
        if duplicate {
            state.push_telemetry(
                "critique_duplicate_suppressed",
                json!({ "ticket_id": ticket, "cycle_id": cycle_id }),
            );
            return false;
        }
    }

    let translation = translate_rejection(trigger);
    let task = CritiqueTask {
        cycle_id: cycle_id.clone(),
        ticket_id: ticket_id.map(str::to_string),
        tests: translation.tests.clone(),
        improvements: translation.improvements.clone(),
        recorded_at: wire_timestamp(),
    };

    if let Some(entry) = state.refinement_ledger.last_mut() {
        let critiques = entry
            .metadata
            .entry("critiques".to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Some(items) = critiques.as_array_mut() {
            items.push(json!({
                "ticket_id": ticket_id,
                "exhaustion_mode": trigger.exhaustion_mode.as_str(),
                "required_artifacts": trigger.required_artifacts,
                "rationale": trigger.rationale,
                "recorded_at": task.recorded_at,
            }));
        }
    }

    state.critique_backlog.push(task);
    state.push_telemetry(
        "critique_translated",
        json!({
            "cycle_id": cycle_id,
            "tests": translation.tests.len(),
            "improvements": translation.improvements.len(),
        }),
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::LedgerEntry;
    use qc_types::exhaustion::ExhaustionMode;

    fn trigger() -> SupervisorTrigger {
        SupervisorTrigger {
            cycle_iteration: 0,
            exhaustion_mode: ExhaustionMode::TestFailure,
            required_artifacts: vec!["pytest_report".into(), "coverage_html".into()],
            rationale: Some("No tests.".into()),
        }
    }

    #[test]
    fn translation_yields_tests_and_improvements() {
        let translation = translate_rejection(&trigger());
        assert!(!translation.tests.is_empty());
        assert!(!translation.improvements.is_empty());
        assert!(translation.tests.iter().any(|t| t.contains("pytest_report")));
        assert!(translation
            .improvements
            .iter()
            .any(|i| i.contains("No tests.")));
    }

    #[test]
    fn rejection_without_artifacts_still_demands_evidence() {
        let bare = SupervisorTrigger {
            cycle_iteration: 3,
            exhaustion_mode: ExhaustionMode::None,
            required_artifacts: vec![],
            rationale: None,
        };
        let translation = translate_rejection(&bare);
        assert_eq!(translation.tests.len(), 1);
        assert!(translation.tests[0].contains("cycle 3"));
    }

    #[test]
    fn apply_updates_backlog_and_ledger_metadata() {
        let mut state = ChatState::new("c1", 512);
        state
            .refinement_ledger
            .push(LedgerEntry::new("cycle-0042", "resilient caching layer"));

        let applied = apply_critique(&mut state, &trigger(), Some("t-1"));
        assert!(applied);
        assert_eq!(state.critique_backlog.len(), 1);
        assert_eq!(state.critique_backlog[0].cycle_id, "cycle-0042");
        assert!(!state.critique_backlog[0].tests.is_empty());

        let entry = state.refinement_ledger.last().unwrap();
        let critiques = entry.metadata.get("critiques").unwrap().as_array().unwrap();
        assert_eq!(critiques.len(), 1);
    }

    #[test]
    fn duplicate_ticket_is_suppressed() {
        let mut state = ChatState::new("c1", 512);
        state
            .refinement_ledger
            .push(LedgerEntry::new("cycle-0001", "anything"));

        assert!(apply_critique(&mut state, &trigger(), Some("t-1")));
        assert!(!apply_critique(&mut state, &trigger(), Some("t-1")));
        assert_eq!(state.critique_backlog.len(), 1, "exactly one backlog entry");

        // A different ticket for the same cycle is new work.
        assert!(apply_critique(&mut state, &trigger(), Some("t-2")));
        assert_eq!(state.critique_backlog.len(), 2);
    }

    #[test]
    fn missing_ticket_id_always_applies() {
        let mut state = ChatState::new("c1", 512);
        assert!(apply_critique(&mut state, &trigger(), None));
        assert!(apply_critique(&mut state, &trigger(), None));
        assert_eq!(state.critique_backlog.len(), 2);
    }
}
