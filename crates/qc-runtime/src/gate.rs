//! Supervisor gate.
//!
//! Supervisor envelopes carry a structured verdict in `message`. Invalid
//! payloads produce a schema-feedback envelope and no state change.
//! Valid rejections synthesize review messages into the transcript,
//! translate the critique into backlog work, stamp the required
//! artifacts, and drive the supervisor-triggered PRP transition.

use serde_json::json;
use tracing::{info, warn};

use qc_engine::critique;
use qc_engine::invariants;
use qc_engine::prp::{apply_prp_transition, PrpState};
use qc_engine::state::{ChatMessage, ChatState};
use qc_types::envelope::MessageEnvelope;
use qc_types::supervisor::{SchemaViolation, SupervisorTrigger};

/// Outcome of gating one supervisor envelope.
#[derive(Debug)]
pub enum GateOutcome {
    /// The payload failed validation; send this feedback envelope back to
    /// the supervisor and do not advance state.
    SchemaFeedback(MessageEnvelope),
    /// The verdict was applied to the chat state.
    Applied(SupervisorTrigger),
}

/// Build the feedback envelope for a schema violation.
fn schema_feedback(
    identity: &str,
    envelope: &MessageEnvelope,
    violation: &SchemaViolation,
) -> MessageEnvelope {
    let mut feedback = MessageEnvelope::new(identity, &envelope.sender, violation.describe())
        .with_payload("schema_error", json!(true))
        .with_payload("original_message", json!(envelope.message));
    if let Some(ticket) = envelope.ticket_id() {
        feedback = feedback.with_payload("ticket_id", json!(ticket));
    }
    if let Some(chat_id) = envelope.chat_id() {
        feedback = feedback.with_payload("chat_id", json!(chat_id));
    }
    feedback
}

/// Gate one supervisor envelope against the chat state.
pub fn handle_supervisor_envelope(
    state: &mut ChatState,
    envelope: &MessageEnvelope,
    identity: &str,
) -> GateOutcome {
    let trigger = match SupervisorTrigger::parse(&envelope.message) {
        Ok(trigger) => trigger,
        Err(violation) => {
            warn!(reason = %violation.describe(), "supervisor payload rejected");
            state.push_telemetry(
                "supervisor_schema_error",
                json!({ "reason": violation.describe() }),
            );
            return GateOutcome::SchemaFeedback(schema_feedback(identity, envelope, &violation));
        }
    };

    // Transcript synthesis: a readable summary plus the structured
    // critique as a tool message the model can consume.
    let summary = format!(
        "Supervisor Review Feedback: cycle {} classified {}; required artifacts: {}{}",
        trigger.cycle_iteration,
        trigger.exhaustion_mode.as_str(),
        if trigger.required_artifacts.is_empty() {
            "(none)".to_string()
        } else {
            trigger.required_artifacts.join(", ")
        },
        trigger
            .rationale
            .as_deref()
            .map(|r| format!("; rationale: {r}"))
            .unwrap_or_default(),
    );
    state.messages.push(ChatMessage::system(summary));
    state.messages.push(ChatMessage::tool(
        json!({
            "cycle_iteration": trigger.cycle_iteration,
            "exhaustion_mode": trigger.exhaustion_mode.as_str(),
            "required_artifacts": trigger.required_artifacts,
            "rationale": trigger.rationale,
        })
        .to_string(),
        "hypothesis_critique",
        envelope
            .ticket_id()
            .map(|t| format!("critique-{t}"))
            .unwrap_or_else(|| "critique".to_string()),
    ));

    critique::apply_critique(state, &trigger, envelope.ticket_id());

    // A rejection demands fresh tests and counts as the cycle's
    // skepticism challenge.
    invariants::mark_rejection_requires_tests(state);
    invariants::mark_skepticism_challenge(state);

    state.exhaustion_mode = trigger.exhaustion_mode;
    state.supervisor_requirements = trigger.required_artifacts.clone();

    match state.prp_state {
        PrpState::Propose | PrpState::Test => {
            apply_prp_transition(state, PrpState::Hypothesize, true);
        }
        other => {
            // Logged as invalid; the verdict still lands in the backlog.
            apply_prp_transition(state, PrpState::Hypothesize, true);
            info!(state = other.as_str(), "supervisor verdict outside propose/test");
        }
    }

    info!(
        cycle = state.prp_cycle_count,
        artifacts = state.supervisor_requirements.len(),
        "supervisor rejection applied"
    );
    GateOutcome::Applied(trigger)
}
