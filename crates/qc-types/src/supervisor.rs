//! Supervisor trigger protocol.
//!
//! The supervisor reviews orchestrator proposals and answers with a
//! structured JSON object. [`SupervisorTrigger::parse`] validates the
//! schema; a failure yields a field-labelled [`SchemaViolation`] that the
//! runtime turns into a feedback envelope instead of advancing PRP state.

use serde_json::Value;

use crate::exhaustion::ExhaustionMode;

/// Structured payload emitted by the supervisor to drive PRP transitions.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorTrigger {
    /// Zero-indexed cycle iteration the trigger pertains to.
    pub cycle_iteration: u64,

    /// Exhaustion classification guiding the recovery strategy.
    pub exhaustion_mode: ExhaustionMode,

    /// Concrete artifacts that must exist before resubmitting.
    pub required_artifacts: Vec<String>,

    /// Optional free-form explanation to aid planning.
    pub rationale: Option<String>,
}

/// A supervisor payload that failed schema validation.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaViolation {
    /// Field the violation pertains to, when attributable.
    pub field: Option<String>,
    /// Human-readable description for the feedback envelope.
    pub reason: String,
}

impl SchemaViolation {
    fn new(field: Option<&str>, reason: impl Into<String>) -> Self {
        Self {
            field: field.map(str::to_string),
            reason: reason.into(),
        }
    }

    /// Render the violation for a `schema_error` feedback envelope.
    pub fn describe(&self) -> String {
        match &self.field {
            Some(field) => format!("schema_error: field '{field}': {}", self.reason),
            None => format!("schema_error: {}", self.reason),
        }
    }
}

impl SupervisorTrigger {
    /// Parse a supervisor message body.
    ///
    /// Accepts the canonical object shape; `required_artifacts` may arrive
    /// as a scalar and is normalized to a one-element list with each entry
    /// trimmed. Anything else is a [`SchemaViolation`].
    pub fn parse(text: &str) -> Result<Self, SchemaViolation> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| SchemaViolation::new(None, format!("not valid JSON: {e}")))?;
        Self::from_value(&value)
    }

    /// Parse an already-decoded JSON value.
    pub fn from_value(value: &Value) -> Result<Self, SchemaViolation> {
        let obj = value
            .as_object()
            .ok_or_else(|| SchemaViolation::new(None, "expected a JSON object"))?;

        let cycle_iteration = match obj.get("cycle_iteration") {
            Some(Value::Number(n)) => n
                .as_u64()
                .ok_or_else(|| SchemaViolation::new(Some("cycle_iteration"), "must be >= 0"))?,
            Some(_) => {
                return Err(SchemaViolation::new(
                    Some("cycle_iteration"),
                    "must be a non-negative integer",
                ))
            }
            None => return Err(SchemaViolation::new(Some("cycle_iteration"), "missing")),
        };

        let exhaustion_mode = match obj.get("exhaustion_mode") {
            Some(Value::String(raw)) => ExhaustionMode::parse(raw).ok_or_else(|| {
                SchemaViolation::new(Some("exhaustion_mode"), format!("unknown mode '{raw}'"))
            })?,
            Some(_) => {
                return Err(SchemaViolation::new(
                    Some("exhaustion_mode"),
                    "must be a string",
                ))
            }
            None => return Err(SchemaViolation::new(Some("exhaustion_mode"), "missing")),
        };

        let required_artifacts = match obj.get("required_artifacts") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => {
                let mut artifacts = Vec::with_capacity(items.len());
                for item in items {
                    artifacts.push(coerce_artifact(item));
                }
                artifacts
            }
            Some(other) => vec![coerce_artifact(other)],
        };

        let rationale = match obj.get("rationale") {
            None | Some(Value::Null) => None,
            Some(Value::String(text)) => Some(text.clone()),
            Some(_) => {
                return Err(SchemaViolation::new(
                    Some("rationale"),
                    "must be a string when present",
                ))
            }
        };

        Ok(Self {
            cycle_iteration,
            exhaustion_mode,
            required_artifacts,
            rationale,
        })
    }
}

fn coerce_artifact(value: &Value) -> String {
    match value {
        Value::String(text) => text.trim().to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_trigger() {
        let trigger = SupervisorTrigger::parse(
            r#"{"cycle_iteration":0,"exhaustion_mode":"test_failure",
                "required_artifacts":["pytest_report"," coverage_html "],
                "rationale":"No tests."}"#,
        )
        .unwrap();
        assert_eq!(trigger.cycle_iteration, 0);
        assert_eq!(trigger.exhaustion_mode, ExhaustionMode::TestFailure);
        assert_eq!(
            trigger.required_artifacts,
            vec!["pytest_report".to_string(), "coverage_html".to_string()]
        );
        assert_eq!(trigger.rationale.as_deref(), Some("No tests."));
    }

    #[test]
    fn scalar_artifact_normalizes_to_list() {
        let trigger = SupervisorTrigger::parse(
            r#"{"cycle_iteration":2,"exhaustion_mode":"none","required_artifacts":"design_doc"}"#,
        )
        .unwrap();
        assert_eq!(trigger.required_artifacts, vec!["design_doc".to_string()]);
    }

    #[test]
    fn missing_cycle_iteration_is_schema_error() {
        let err = SupervisorTrigger::parse(r#"{"exhaustion_mode":"none"}"#).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("cycle_iteration"));
        assert!(err.describe().starts_with("schema_error"));
    }

    #[test]
    fn negative_iteration_is_schema_error() {
        let err =
            SupervisorTrigger::parse(r#"{"cycle_iteration":-1,"exhaustion_mode":"none"}"#)
                .unwrap_err();
        assert_eq!(err.field.as_deref(), Some("cycle_iteration"));
    }

    #[test]
    fn unknown_mode_is_schema_error() {
        let err =
            SupervisorTrigger::parse(r#"{"cycle_iteration":0,"exhaustion_mode":"tired"}"#)
                .unwrap_err();
        assert_eq!(err.field.as_deref(), Some("exhaustion_mode"));
    }

    #[test]
    fn non_json_is_schema_error() {
        let err = SupervisorTrigger::parse("task complete, looks good!").unwrap_err();
        assert!(err.field.is_none());
    }
}
