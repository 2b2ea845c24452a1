//! Per-chat working state.
//!
//! [`ChatState`] is the single blob persisted to the checkpoint store after
//! every graph invocation and restored on the next envelope for the chat.
//! Every field carries a serde default so checkpoints written by older
//! builds keep loading.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use qc_types::autonomous::{AutonomousRoutingDirective, AutonomousSettings};
use qc_types::envelope::wire_timestamp;
use qc_types::exhaustion::ExhaustionMode;
use qc_types::workspace::WorkspaceDescriptor;

use crate::prp::PrpState;

/// One turn in the LLM-shaped transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ChatMessage {
    /// Instructional context injected by the runtime.
    System { content: String },
    /// A human (or upstream-agent) turn.
    Human { content: String },
    /// An assistant turn, possibly carrying tool calls.
    Ai {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    /// A tool result addressed back to a specific call.
    Tool {
        content: String,
        name: String,
        tool_call_id: String,
    },
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage::System {
            content: content.into(),
        }
    }

    pub fn human(content: impl Into<String>) -> Self {
        ChatMessage::Human {
            content: content.into(),
        }
    }

    pub fn ai(content: impl Into<String>) -> Self {
        ChatMessage::Ai {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool(
        content: impl Into<String>,
        name: impl Into<String>,
        tool_call_id: impl Into<String>,
    ) -> Self {
        ChatMessage::Tool {
            content: content.into(),
            name: name.into(),
            tool_call_id: tool_call_id.into(),
        }
    }

    /// Text content regardless of role.
    pub fn content(&self) -> &str {
        match self {
            ChatMessage::System { content }
            | ChatMessage::Human { content }
            | ChatMessage::Ai { content, .. }
            | ChatMessage::Tool { content, .. } => content,
        }
    }

    pub fn is_human(&self) -> bool {
        matches!(self, ChatMessage::Human { .. })
    }

    pub fn is_ai(&self) -> bool {
        matches!(self, ChatMessage::Ai { .. })
    }
}

/// A tool invocation requested by the assistant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// A unit of working memory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextSegment {
    /// Unique segment id.
    pub id: String,

    /// Segment body; for pointer segments this is a short placeholder.
    pub content: String,

    /// Segment kind (`conversation`, `tool_output:<tool>`, `pointer:<orig>`,
    /// `summary:<orig>`, ...).
    #[serde(rename = "type")]
    pub segment_type: String,

    /// Priority 0..=10; higher survives curation longer.
    pub priority: u8,

    /// Estimated token footprint.
    pub token_count: u64,

    /// When the segment was created or last refreshed.
    pub timestamp: DateTime<Utc>,

    /// Exponential freshness decay rate per hour.
    #[serde(default = "default_decay_rate")]
    pub decay_rate: f64,

    /// Whether the curator may compress this segment.
    #[serde(default = "default_compression_eligible")]
    pub compression_eligible: bool,

    /// Reference id into `external_memory_index` for pointer segments.
    #[serde(default)]
    pub restorable_reference: Option<String>,
}

fn default_decay_rate() -> f64 {
    0.1
}

fn default_compression_eligible() -> bool {
    true
}

impl ContextSegment {
    /// A fresh segment with the default decay and eligibility.
    pub fn new(
        id: impl Into<String>,
        segment_type: impl Into<String>,
        content: impl Into<String>,
        priority: u8,
        token_count: u64,
    ) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            segment_type: segment_type.into(),
            priority: priority.min(10),
            token_count,
            timestamp: Utc::now(),
            decay_rate: default_decay_rate(),
            compression_eligible: true,
            restorable_reference: None,
        }
    }

    /// Whether this segment is an externalized pointer.
    pub fn is_pointer(&self) -> bool {
        self.segment_type.starts_with("pointer:")
    }
}

/// Rough token estimate used anywhere the engine needs one: whitespace
/// words plus a fraction for punctuation-heavy text.
pub fn estimate_tokens(text: &str) -> u64 {
    let words = text.split_whitespace().count() as u64;
    let chars = text.len() as u64;
    words.max(chars / 6)
}

/// Hypothesis lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    #[default]
    Proposed,
    InProgress,
    Succeeded,
    Failed,
    Abandoned,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::Proposed => "proposed",
            LedgerStatus::InProgress => "in_progress",
            LedgerStatus::Succeeded => "succeeded",
            LedgerStatus::Failed => "failed",
            LedgerStatus::Abandoned => "abandoned",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "proposed" => Some(LedgerStatus::Proposed),
            "in_progress" => Some(LedgerStatus::InProgress),
            "succeeded" => Some(LedgerStatus::Succeeded),
            "failed" => Some(LedgerStatus::Failed),
            "abandoned" => Some(LedgerStatus::Abandoned),
            _ => None,
        }
    }
}

/// One row of the refinement ledger. The ledger forms a DAG through
/// `dependencies`; rows refer to each other by `cycle_id` only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub cycle_id: String,
    pub timestamp: DateTime<Utc>,
    pub hypothesis: String,
    pub status: LedgerStatus,
    #[serde(default)]
    pub outcome_summary: String,
    #[serde(default)]
    pub exhaustion_trigger: ExhaustionMode,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub novelty_score: Option<f64>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub predicted_success_probability: Option<f64>,
    #[serde(default)]
    pub test_results: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub causal_links: Vec<Value>,
}

impl LedgerEntry {
    pub fn new(cycle_id: impl Into<String>, hypothesis: impl Into<String>) -> Self {
        Self {
            cycle_id: cycle_id.into(),
            timestamp: Utc::now(),
            hypothesis: hypothesis.into(),
            status: LedgerStatus::Proposed,
            outcome_summary: "pending evaluation".to_string(),
            exhaustion_trigger: ExhaustionMode::None,
            strategy: None,
            novelty_score: None,
            dependencies: Vec::new(),
            predicted_success_probability: None,
            test_results: Map::new(),
            metadata: Map::new(),
            causal_links: Vec::new(),
        }
    }
}

/// A telemetry or metrics event: flat, append-only, JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub timestamp: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl TelemetryEvent {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            timestamp: wire_timestamp(),
            event: event.into(),
            payload,
        }
    }
}

/// Counters tracking autonomous progress and false stops.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AutonomyCounters {
    pub iteration_count: u64,
    pub false_stop_events: u64,
    pub false_stop_pending: u64,
    pub false_stop_mitigated: u64,
}

/// Soft invariant flags plus the violation log.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InvariantFlags {
    pub needs_test_after_rejection: bool,
    pub context_updated_in_cycle: bool,
    pub skepticism_gate_satisfied: bool,
    #[serde(default)]
    pub violation_log: Vec<Value>,
}

/// Actionable item translated from a supervisor critique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CritiqueTask {
    pub cycle_id: String,
    #[serde(default)]
    pub ticket_id: Option<String>,
    #[serde(default)]
    pub tests: Vec<String>,
    #[serde(default)]
    pub improvements: Vec<String>,
    pub recorded_at: String,
}

/// A context need the loader could not satisfy within budget.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrefetchRequest {
    #[serde(rename = "type")]
    pub context_type: String,
    pub estimated_tokens: u64,
}

/// Post-process reflection entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reflection {
    pub timestamp: String,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Rolling playbook the post-process stage maintains.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContextPlaybook {
    pub iterations: u64,
    #[serde(default)]
    pub last_reflection: Option<PlaybookReflection>,
}

/// Focus information derived from the latest reflection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybookReflection {
    pub focus_metric: String,
    pub quality: f64,
    pub recorded_at: String,
}

/// Curation rule appended when a reflection names a focus metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurationRule {
    pub metric: String,
    pub actions: Vec<String>,
    pub created_at: String,
}

/// Episodic memory entry distilled from a concluded ledger row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub cycle_id: String,
    pub hypothesis: String,
    pub status: LedgerStatus,
    pub strategy: Option<String>,
    pub exhaustion_trigger: ExhaustionMode,
    pub outcome_summary: String,
    pub recorded_at: String,
}

/// Consolidated per-strategy pattern in semantic memory.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StrategyPattern {
    pub successes: u64,
    pub failures: u64,
    #[serde(default)]
    pub supporting_cycles: Vec<String>,
}

impl StrategyPattern {
    pub fn success_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            0.5
        } else {
            self.successes as f64 / total as f64
        }
    }
}

/// Guidance derived from semantic memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryGuidance {
    pub recommendations: Vec<String>,
    pub supporting_cycles: Vec<String>,
    pub generated_at: String,
}

/// The per-chat durable state blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatState {
    /// Conversation identity; also the checkpoint key.
    pub chat_id: String,

    /// Ordered LLM-shaped transcript.
    #[serde(default)]
    pub messages: Vec<ChatMessage>,

    /// Working-memory segments.
    #[serde(default)]
    pub context_segments: Vec<ContextSegment>,

    /// Reference id → durable path for externalized segments.
    #[serde(default)]
    pub external_memory_index: BTreeMap<String, String>,

    #[serde(default)]
    pub prp_state: PrpState,

    #[serde(default)]
    pub prp_cycle_count: u64,

    #[serde(default)]
    pub refinement_ledger: Vec<LedgerEntry>,

    #[serde(default)]
    pub autonomy_counters: AutonomyCounters,

    #[serde(default)]
    pub invariants: InvariantFlags,

    #[serde(default)]
    pub exhaustion_mode: ExhaustionMode,

    #[serde(default)]
    pub exhaustion_probability: f64,

    #[serde(default)]
    pub critique_backlog: Vec<CritiqueTask>,

    /// PRP protocol telemetry (transitions, violations, false stops).
    #[serde(default)]
    pub prp_telemetry: Vec<TelemetryEvent>,

    /// Context engine metric events.
    #[serde(default)]
    pub metrics_log: Vec<TelemetryEvent>,

    #[serde(default)]
    pub workspace: Option<WorkspaceDescriptor>,

    // ── Context window accounting ────────────────────────────────────
    #[serde(default)]
    pub context_window_used: u64,

    #[serde(default)]
    pub context_window_max: u64,

    #[serde(default)]
    pub context_quality_score: f64,

    #[serde(default)]
    pub context_quality_components: BTreeMap<String, f64>,

    // ── Planning context ─────────────────────────────────────────────
    #[serde(default)]
    pub task_goal: String,

    #[serde(default)]
    pub current_phase: String,

    // ── Governor ─────────────────────────────────────────────────────
    #[serde(default)]
    pub governor_plan: Option<Value>,

    #[serde(default)]
    pub governor_prompt_outline: Option<Value>,

    /// Externally injected plan that bypasses the deterministic planner.
    #[serde(default)]
    pub governor_plan_override: Option<Value>,

    // ── Progressive loader ───────────────────────────────────────────
    #[serde(default)]
    pub pending_context: Vec<String>,

    #[serde(default)]
    pub prefetch_queue: Vec<PrefetchRequest>,

    #[serde(default)]
    pub working_memory: BTreeMap<String, ContextSegment>,

    #[serde(default)]
    pub context_hierarchy: BTreeMap<String, u8>,

    // ── Post-process artifacts ───────────────────────────────────────
    #[serde(default)]
    pub reflection_log: Vec<Reflection>,

    #[serde(default)]
    pub context_playbook: ContextPlaybook,

    #[serde(default)]
    pub curation_rules: Vec<CurationRule>,

    // ── Test evidence ────────────────────────────────────────────────
    #[serde(default)]
    pub last_test_suite_result: Option<Value>,

    #[serde(default)]
    pub property_test_results: Vec<Value>,

    #[serde(default)]
    pub last_property_test_result: Option<Value>,

    #[serde(default)]
    pub debugger_agents: Vec<Value>,

    // ── Long-term memory ─────────────────────────────────────────────
    #[serde(default)]
    pub episodic_memory: Vec<Episode>,

    #[serde(default)]
    pub semantic_memory: BTreeMap<String, StrategyPattern>,

    #[serde(default)]
    pub memory_guidance: Option<MemoryGuidance>,

    #[serde(default)]
    pub exhaustion_recovery_log: Vec<Value>,

    // ── Context reset ────────────────────────────────────────────────
    #[serde(default)]
    pub context_reset_count: u64,

    #[serde(default)]
    pub last_context_reset: Option<Value>,

    #[serde(default)]
    pub system_prompt_addendum: Option<String>,

    // ── Supervisor ───────────────────────────────────────────────────
    #[serde(default)]
    pub supervisor_requirements: Vec<String>,

    // ── Autonomous mode ──────────────────────────────────────────────
    #[serde(default)]
    pub autonomous_mode: bool,

    #[serde(default)]
    pub autonomous_settings: Option<AutonomousSettings>,

    #[serde(default)]
    pub autonomous_started_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub autonomous_routing: Option<AutonomousRoutingDirective>,

    /// Ticket ids already processed for this chat; replays with a known
    /// ticket produce no new visible side effects.
    #[serde(default)]
    pub processed_tickets: Vec<String>,

    /// How many transcript messages have been ingested as conversation
    /// segments so far.
    #[serde(default)]
    pub ingested_message_count: usize,
}

impl ChatState {
    /// Fresh state for a chat.
    pub fn new(chat_id: impl Into<String>, context_window_max: u64) -> Self {
        Self {
            chat_id: chat_id.into(),
            messages: Vec::new(),
            context_segments: Vec::new(),
            external_memory_index: BTreeMap::new(),
            prp_state: PrpState::Propose,
            prp_cycle_count: 0,
            refinement_ledger: Vec::new(),
            autonomy_counters: AutonomyCounters::default(),
            invariants: InvariantFlags::default(),
            exhaustion_mode: ExhaustionMode::None,
            exhaustion_probability: 0.0,
            critique_backlog: Vec::new(),
            prp_telemetry: Vec::new(),
            metrics_log: Vec::new(),
            workspace: None,
            context_window_used: 0,
            context_window_max,
            context_quality_score: 1.0,
            context_quality_components: BTreeMap::new(),
            task_goal: String::new(),
            current_phase: String::new(),
            governor_plan: None,
            governor_prompt_outline: None,
            governor_plan_override: None,
            pending_context: Vec::new(),
            prefetch_queue: Vec::new(),
            working_memory: BTreeMap::new(),
            context_hierarchy: BTreeMap::new(),
            reflection_log: Vec::new(),
            context_playbook: ContextPlaybook::default(),
            curation_rules: Vec::new(),
            last_test_suite_result: None,
            property_test_results: Vec::new(),
            last_property_test_result: None,
            debugger_agents: Vec::new(),
            episodic_memory: Vec::new(),
            semantic_memory: BTreeMap::new(),
            memory_guidance: None,
            exhaustion_recovery_log: Vec::new(),
            context_reset_count: 0,
            last_context_reset: None,
            system_prompt_addendum: None,
            supervisor_requirements: Vec::new(),
            autonomous_mode: false,
            autonomous_settings: None,
            autonomous_started_at: None,
            autonomous_routing: None,
            processed_tickets: Vec::new(),
            ingested_message_count: 0,
        }
    }

    /// Recompute `context_window_used` as the segment token sum.
    pub fn recompute_window_used(&mut self) -> u64 {
        self.context_window_used = self
            .context_segments
            .iter()
            .map(|segment| segment.token_count)
            .sum();
        self.context_window_used
    }

    /// Append a PRP telemetry event.
    pub fn push_telemetry(&mut self, event: impl Into<String>, payload: Value) {
        self.prp_telemetry.push(TelemetryEvent::new(event, payload));
    }

    /// Append a context-metrics event.
    pub fn push_metric(&mut self, event: impl Into<String>, payload: Value) {
        self.metrics_log.push(TelemetryEvent::new(event, payload));
    }

    /// The latest ledger row, if any.
    pub fn latest_ledger_entry_mut(&mut self) -> Option<&mut LedgerEntry> {
        self.refinement_ledger.last_mut()
    }

    /// Record a test-suite run.
    ///
    /// Stores the payload, stamps the latest ledger row, classifies
    /// failure as [`ExhaustionMode::TestFailure`], records any remediation
    /// agent spawns, clears the test-after-rejection requirement, and on a
    /// pass mitigates one pending false stop.
    pub fn record_test_suite_result(&mut self, payload: &Value) {
        let overall_status = payload
            .get("overall_status")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let passed = overall_status == "passed";

        self.last_test_suite_result = Some(payload.clone());
        self.invariants.needs_test_after_rejection = false;

        if let Some(agent) = payload
            .get("remediation")
            .and_then(Value::as_object)
            .filter(|r| r.get("action").and_then(Value::as_str) == Some("spawn_debugger_agent"))
        {
            self.debugger_agents.push(Value::Object(agent.clone()));
        }

        if let Some(entry) = self.refinement_ledger.last_mut() {
            if let Some(obj) = payload.as_object() {
                for (key, value) in obj {
                    entry.test_results.insert(key.clone(), value.clone());
                }
            }
            if !passed {
                entry.exhaustion_trigger = ExhaustionMode::TestFailure;
            }
        }

        if passed {
            if self.autonomy_counters.false_stop_pending > 0 {
                self.autonomy_counters.false_stop_pending -= 1;
                self.autonomy_counters.false_stop_mitigated += 1;
                self.push_telemetry(
                    "false_stop_mitigated",
                    json!({ "mitigated_by": "test_suite", "overall_status": overall_status }),
                );
            }
            if matches!(
                self.exhaustion_mode,
                ExhaustionMode::TestFailure | ExhaustionMode::LlmStop
            ) {
                self.exhaustion_mode = ExhaustionMode::None;
            }
        } else {
            self.exhaustion_mode = ExhaustionMode::TestFailure;
            self.push_telemetry(
                "test_suite_failed",
                json!({ "overall_status": overall_status }),
            );
        }
    }

    /// Record a property-test run.
    pub fn record_property_test_result(&mut self, payload: &Value) {
        let property_name = payload
            .get("property_name")
            .and_then(Value::as_str)
            .unwrap_or("unnamed")
            .to_string();
        let result = payload.get("result").cloned().unwrap_or(Value::Null);
        let status = result
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let failed = status == "failed";

        let mut record = Map::new();
        record.insert("property_name".to_string(), json!(property_name));
        if let Some(obj) = result.as_object() {
            for (key, value) in obj {
                record.insert(key.clone(), value.clone());
            }
        }
        let record = Value::Object(record);

        self.property_test_results.push(record.clone());
        self.last_property_test_result = Some(record.clone());

        if let Some(entry) = self.refinement_ledger.last_mut() {
            let tests = entry
                .test_results
                .entry("property_tests".to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Some(items) = tests.as_array_mut() {
                items.push(record);
            }
            if failed {
                entry.exhaustion_trigger = ExhaustionMode::TestFailure;
            }
        }

        if failed {
            self.exhaustion_mode = ExhaustionMode::TestFailure;
        }
    }

    /// Flag a suspected false stop (empty assistant reply and similar).
    /// Returns the telemetry payload for callers that publish it onward.
    pub fn flag_false_stop(
        &mut self,
        reason: &str,
        stage: &str,
        evidence: Option<Value>,
    ) -> Value {
        self.autonomy_counters.false_stop_events += 1;
        self.autonomy_counters.false_stop_pending += 1;
        let payload = json!({
            "reason": reason,
            "stage": stage,
            "evidence": evidence,
            "pending": self.autonomy_counters.false_stop_pending,
        });
        self.push_telemetry("false_stop_detected", payload.clone());
        payload
    }

    /// Whether a ticket id was already processed for this chat.
    pub fn ticket_seen(&self, ticket_id: &str) -> bool {
        self.processed_tickets.iter().any(|t| t == ticket_id)
    }

    /// Mark a ticket as processed.
    pub fn mark_ticket(&mut self, ticket_id: &str) {
        if !self.ticket_seen(ticket_id) {
            self.processed_tickets.push(ticket_id.to_string());
        }
    }
}
