//! Message envelope and mailbox naming.
//!
//! [`MessageEnvelope`] is the atomic unit of inter-process communication.
//! Envelopes are rendered to flat string field maps at stream-write time
//! ([`MessageEnvelope::to_stream_fields`]) with the payload JSON-encoded,
//! and decoded back with [`MessageEnvelope::from_stream_fields`]. Malformed
//! payload JSON is never a read failure: it decodes to `{"_raw": <text>}`.

use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Prefix shared by every mailbox stream name.
pub const MAILBOX_PREFIX: &str = "qc:mailbox/";

/// Well-known recipient: the orchestrator process.
pub const ORCHESTRATOR_RECIPIENT: &str = "orchestrator";

/// Well-known recipient: the human operator.
pub const HUMAN_RECIPIENT: &str = "human";

/// Well-known recipient: the skeptical supervisor peer.
pub const SUPERVISOR_RECIPIENT: &str = "supervisor";

/// Stream carrying context-engine metric events.
pub const CONTEXT_METRICS_STREAM: &str = "qc:context:metrics";

/// Stream carrying autonomous-mode control and guardrail events.
pub const AUTONOMOUS_EVENTS_STREAM: &str = "qc:autonomous:events";

/// Mailbox stream name for a recipient.
pub fn mailbox_key(recipient: &str) -> String {
    format!("{MAILBOX_PREFIX}{recipient}")
}

/// Recipient for a mailbox stream name. Names without the mailbox prefix
/// are returned unchanged.
pub fn mailbox_recipient(mailbox: &str) -> &str {
    mailbox.strip_prefix(MAILBOX_PREFIX).unwrap_or(mailbox)
}

/// Mailbox stream name for an agent id.
pub fn agent_mailbox(agent_id: &str) -> String {
    mailbox_key(agent_id)
}

/// Event stream name for a workspace.
pub fn workspace_events_stream(workspace_id: &str) -> String {
    format!("qc:workspace:{workspace_id}:events")
}

/// Current UTC time at the wire precision (ISO-8601, seconds).
pub fn wire_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Envelope describing a message passed through mailbox streams.
///
/// `payload` is deliberately open-ended: canonical keys (`chat_id`,
/// `ticket_id`, `reply_to`, ...) have typed accessors, everything else is
/// carried as-is and survives a round-trip. Fields other than the five
/// canonical ones found on a stream entry are preserved in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageEnvelope {
    /// ISO-8601 timestamp, seconds precision.
    #[serde(default = "wire_timestamp")]
    pub timestamp: String,

    /// Logical sender identity (`orchestrator`, `human`, an agent id, ...).
    pub sender: String,

    /// Logical recipient identity.
    pub recipient: String,

    /// Free-text message body.
    pub message: String,

    /// Structured payload bag.
    #[serde(default)]
    pub payload: Map<String, Value>,

    /// Unrecognized stream fields, preserved on round-trip.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl MessageEnvelope {
    /// Create an envelope stamped with the current time.
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: wire_timestamp(),
            sender: sender.into(),
            recipient: recipient.into(),
            message: message.into(),
            payload: Map::new(),
            extra: BTreeMap::new(),
        }
    }

    /// Builder-style payload insertion.
    pub fn with_payload(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Serialize to stream field/value pairs. The payload is encoded as
    /// compact JSON; `extra` fields ride along unchanged.
    pub fn to_stream_fields(&self) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        fields.insert("timestamp".to_string(), self.timestamp.clone());
        fields.insert("sender".to_string(), self.sender.clone());
        fields.insert("recipient".to_string(), self.recipient.clone());
        fields.insert("message".to_string(), self.message.clone());
        fields.insert(
            "payload".to_string(),
            serde_json::to_string(&self.payload).unwrap_or_else(|_| "{}".to_string()),
        );
        for (key, value) in &self.extra {
            fields.entry(key.clone()).or_insert_with(|| value.clone());
        }
        fields
    }

    /// Decode a stream entry back into an envelope. Missing fields get
    /// best-effort defaults; a payload that is not valid JSON becomes
    /// `{"_raw": <original text>}` instead of failing the read.
    pub fn from_stream_fields<'a, I>(fields: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut timestamp = None;
        let mut sender = None;
        let mut recipient = None;
        let mut message = None;
        let mut payload_raw = None;
        let mut extra = BTreeMap::new();

        for (key, value) in fields {
            match key {
                "timestamp" => timestamp = Some(value.to_string()),
                "sender" => sender = Some(value.to_string()),
                "recipient" => recipient = Some(value.to_string()),
                "message" => message = Some(value.to_string()),
                "payload" => payload_raw = Some(value.to_string()),
                other => {
                    extra.insert(other.to_string(), value.to_string());
                }
            }
        }

        let payload = match payload_raw.as_deref() {
            None | Some("") => Map::new(),
            Some(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => map,
                _ => {
                    let mut map = Map::new();
                    map.insert("_raw".to_string(), Value::String(raw.to_string()));
                    map
                }
            },
        };

        Self {
            timestamp: timestamp.unwrap_or_else(wire_timestamp),
            sender: sender.unwrap_or_else(|| "unknown".to_string()),
            recipient: recipient.unwrap_or_else(|| "unknown".to_string()),
            message: message.unwrap_or_default(),
            payload,
            extra,
        }
    }

    // ── Canonical payload accessors ──────────────────────────────────

    /// Conversation identity; also the per-chat serialization key.
    pub fn chat_id(&self) -> Option<&str> {
        self.payload.get("chat_id").and_then(Value::as_str)
    }

    /// Caller-supplied correlation id, opaque to the runtime.
    pub fn ticket_id(&self) -> Option<&str> {
        self.payload.get("ticket_id").and_then(Value::as_str)
    }

    /// Recipients the orchestrator should dispatch to.
    pub fn reply_to(&self) -> Vec<String> {
        match self.payload.get("reply_to") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            Some(Value::String(single)) => vec![single.clone()],
            _ => Vec::new(),
        }
    }

    /// Current reviewer identity, when one is assigned.
    pub fn supervisor(&self) -> Option<&str> {
        self.payload.get("supervisor").and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> MessageEnvelope {
        MessageEnvelope::new("human", ORCHESTRATOR_RECIPIENT, "do the thing")
            .with_payload("chat_id", json!("c1"))
            .with_payload("ticket_id", json!("t-77"))
            .with_payload("reply_to", json!(["agent-0a1b2c3d"]))
            .with_payload("custom", json!({"nested": [1, 2, 3]}))
    }

    #[test]
    fn stream_fields_round_trip_is_identity() {
        let env = sample();
        let fields = env.to_stream_fields();
        let decoded = MessageEnvelope::from_stream_fields(
            fields.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        );
        assert_eq!(decoded, env);
    }

    #[test]
    fn unknown_stream_fields_are_preserved() {
        let env = sample();
        let mut fields = env.to_stream_fields();
        fields.insert("trace_hint".to_string(), "abc123".to_string());
        let decoded = MessageEnvelope::from_stream_fields(
            fields.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        );
        assert_eq!(decoded.extra.get("trace_hint").map(String::as_str), Some("abc123"));
        let fields_again = decoded.to_stream_fields();
        assert_eq!(fields_again.get("trace_hint").map(String::as_str), Some("abc123"));
    }

    #[test]
    fn malformed_payload_becomes_raw() {
        let fields = [
            ("timestamp", "2026-01-01T00:00:00Z"),
            ("sender", "human"),
            ("recipient", "orchestrator"),
            ("message", "hello"),
            ("payload", "{not json"),
        ];
        let decoded = MessageEnvelope::from_stream_fields(fields);
        assert_eq!(
            decoded.payload.get("_raw").and_then(Value::as_str),
            Some("{not json")
        );
    }

    #[test]
    fn reply_to_accepts_scalar_and_list() {
        let scalar = MessageEnvelope::new("a", "b", "m").with_payload("reply_to", json!("agent-1"));
        assert_eq!(scalar.reply_to(), vec!["agent-1".to_string()]);

        let list = MessageEnvelope::new("a", "b", "m")
            .with_payload("reply_to", json!(["agent-1", "agent-2"]));
        assert_eq!(list.reply_to().len(), 2);

        let none = MessageEnvelope::new("a", "b", "m");
        assert!(none.reply_to().is_empty());
    }

    #[test]
    fn mailbox_naming() {
        assert_eq!(mailbox_key("orchestrator"), "qc:mailbox/orchestrator");
        assert_eq!(mailbox_recipient("qc:mailbox/agent-0a1b2c3d"), "agent-0a1b2c3d");
        assert_eq!(mailbox_recipient("bare-name"), "bare-name");
        assert_eq!(
            workspace_events_stream("ws-1"),
            "qc:workspace:ws-1:events"
        );
    }
}
