//! The runtime loop.
//!
//! [`RuntimeRunner`] drives one process: startup registration with the
//! agent registry (with retry/backoff), a background heartbeat, the
//! mailbox tail loop, per-chat serialized workers, supervisor gating,
//! autonomous guardrails, emergency stop, graph invocation, checkpoint
//! persistence, and response fan-out per the profile's routing policy.
//!
//! Ordering guarantees: envelopes for one `chat_id` are processed
//! strictly in mailbox order by a dedicated worker; distinct chats
//! proceed in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use qc_engine::state::ChatState;
use qc_fabric::{EntryId, Fabric, Mailbox, MailboxReader};
use qc_registry::RegistryClient;
use qc_types::autonomous::{
    emergency_stop_requested, AutonomousRoutingDirective, AutonomousSettings,
};
use qc_types::config::RuntimeConfig;
use qc_types::envelope::{
    MessageEnvelope, AUTONOMOUS_EVENTS_STREAM, CONTEXT_METRICS_STREAM, HUMAN_RECIPIENT,
    SUPERVISOR_RECIPIENT,
};
use qc_types::registry::{AgentHeartbeat, AgentRegistration};
use qc_types::Result;

use crate::checkpoint::{CheckpointRecord, CheckpointStore};
use crate::gate::{self, GateOutcome};
use crate::graph::GraphExecutor;
use crate::profile::{Profile, ProfileKind};

/// Mailbox tail read batch size.
const READ_BATCH: usize = 16;

/// Mailbox tail block timeout.
const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Grace period for draining per-chat workers on shutdown.
const DRAIN_GRACE: Duration = Duration::from_secs(10);

/// One runtime process.
pub struct RuntimeRunner {
    profile: Profile,
    config: RuntimeConfig,
    fabric: Arc<dyn Fabric>,
    mailbox: Mailbox,
    checkpoints: Arc<dyn CheckpointStore>,
    registry: Option<RegistryClient>,
    graph: GraphExecutor,
    cancel: CancellationToken,
    chat_cancels: Mutex<HashMap<String, CancellationToken>>,
    advertise_host: String,
    advertise_port: u16,
}

impl RuntimeRunner {
    pub fn new(
        profile: Profile,
        config: RuntimeConfig,
        fabric: Arc<dyn Fabric>,
        checkpoints: Arc<dyn CheckpointStore>,
        graph: GraphExecutor,
    ) -> Self {
        Self {
            profile,
            config,
            mailbox: Mailbox::new(fabric.clone()),
            fabric,
            checkpoints,
            registry: None,
            graph,
            cancel: CancellationToken::new(),
            chat_cancels: Mutex::new(HashMap::new()),
            advertise_host: "127.0.0.1".to_string(),
            advertise_port: 0,
        }
    }

    /// Attach a registry client (agents register and heartbeat).
    pub fn with_registry(mut self, registry: RegistryClient) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Endpoint advertised on registration.
    pub fn with_advertised_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.advertise_host = host.into();
        self.advertise_port = port;
        self
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Token that stops the tail loop and aborts in-flight graphs.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn chat_cancel(&self, chat_id: &str) -> CancellationToken {
        self.chat_cancels
            .lock()
            .expect("chat cancel lock")
            .entry(chat_id.to_string())
            .or_insert_with(|| self.cancel.child_token())
            .clone()
    }

    fn reset_chat_cancel(&self, chat_id: &str) {
        self.chat_cancels
            .lock()
            .expect("chat cancel lock")
            .insert(chat_id.to_string(), self.cancel.child_token());
    }

    /// Register with the registry (idempotent, retried with backoff until
    /// the startup timeout). Worker agents only; the orchestrator is not
    /// a registry record.
    pub async fn startup(&self) -> Result<()> {
        if self.profile.kind != ProfileKind::Agent {
            return Ok(());
        }
        let Some(registry) = &self.registry else {
            return Ok(());
        };
        registry
            .register_with_retry(
                &AgentRegistration {
                    agent_id: self.profile.identity.clone(),
                    host: self.advertise_host.clone(),
                    port: self.advertise_port,
                    hotpath: false,
                },
                Duration::from_secs(self.config.registry.startup_timeout_secs),
            )
            .await?;
        info!(identity = %self.profile.identity, "registered with agent registry");
        Ok(())
    }

    fn spawn_heartbeat(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.profile.kind != ProfileKind::Agent {
            return None;
        }
        let registry = self.registry.clone()?;
        let runner = self.clone();
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                runner.config.registry.heartbeat_interval_secs.max(1),
            ));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = runner.cancel.cancelled() => return,
                    _ = interval.tick() => {}
                }
                match registry
                    .heartbeat(&runner.profile.identity, &AgentHeartbeat::default())
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(identity = %runner.profile.identity, "registry lost our record, re-registering");
                        let registration = AgentRegistration {
                            agent_id: runner.profile.identity.clone(),
                            host: runner.advertise_host.clone(),
                            port: runner.advertise_port,
                            hotpath: false,
                        };
                        if let Err(err) = registry.register(&registration).await {
                            warn!(error = %err, "re-registration failed");
                        }
                    }
                    Err(err) => warn!(error = %err, "heartbeat failed"),
                }
            }
        }))
    }

    /// Cursor to resume the mailbox tail from: the highest acknowledged
    /// entry across this process's chat checkpoints.
    async fn resume_cursor(&self) -> EntryId {
        match self.checkpoints.list().await {
            Ok(ids) => {
                let mut cursor = EntryId::ZERO;
                for id in ids {
                    if let Ok(Some(record)) = self.checkpoints.load(&id).await {
                        cursor = cursor.max(record.last_acked_entry);
                    }
                }
                cursor
            }
            Err(err) => {
                warn!(error = %err, "checkpoint scan failed, re-tailing from head");
                EntryId::ZERO
            }
        }
    }

    /// Run the process until cancelled: tail the mailbox and feed
    /// per-chat workers.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.startup().await?;
        let heartbeat = self.spawn_heartbeat();

        let mut reader = MailboxReader::resume(
            self.fabric.clone(),
            &self.profile.identity,
            self.resume_cursor().await,
        );
        info!(
            identity = %self.profile.identity,
            cursor = %reader.cursor(),
            "runtime loop started"
        );

        let mut workers: HashMap<String, mpsc::UnboundedSender<(EntryId, MessageEnvelope)>> =
            HashMap::new();
        let mut worker_handles: Vec<JoinHandle<()>> = Vec::new();

        loop {
            let batch = tokio::select! {
                _ = self.cancel.cancelled() => break,
                batch = reader.read(READ_BATCH, READ_TIMEOUT) => batch?,
            };

            for (entry_id, envelope) in batch {
                let chat_id = chat_key(&envelope);

                // Emergency stops preempt: abort the in-flight graph for
                // this chat before the stop envelope is queued behind it.
                if emergency_stop_requested(&envelope.payload) {
                    self.chat_cancel(&chat_id).cancel();
                }

                let sender = workers.entry(chat_id.clone()).or_insert_with(|| {
                    let (tx, mut rx) = mpsc::unbounded_channel::<(EntryId, MessageEnvelope)>();
                    let runner = self.clone();
                    worker_handles.push(tokio::spawn(async move {
                        while let Some((entry_id, envelope)) = rx.recv().await {
                            if let Err(err) =
                                runner.process_entry(&envelope, Some(entry_id)).await
                            {
                                error!(error = %err, "envelope processing failed");
                            }
                        }
                    }));
                    tx
                });
                if sender.send((entry_id, envelope)).is_err() {
                    warn!(chat_id = %chat_id, "chat worker gone, dropping envelope");
                }
            }
        }

        // Drain in-flight work up to the grace deadline.
        drop(workers);
        let drain = futures_join(worker_handles);
        if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
            warn!("drain grace elapsed, aborting remaining workers");
        }
        if let Some(heartbeat) = heartbeat {
            heartbeat.abort();
        }
        info!(identity = %self.profile.identity, "runtime loop stopped");
        Ok(())
    }

    /// Process one envelope; returns the responses that were posted.
    pub async fn process_envelope(
        &self,
        envelope: &MessageEnvelope,
    ) -> Result<Vec<MessageEnvelope>> {
        self.process_entry(envelope, None).await
    }

    async fn process_entry(
        &self,
        envelope: &MessageEnvelope,
        entry_id: Option<EntryId>,
    ) -> Result<Vec<MessageEnvelope>> {
        let chat_id = chat_key(envelope);
        let mut record = match self.checkpoints.load(&chat_id).await? {
            Some(record) => record,
            None => CheckpointRecord {
                state: ChatState::new(&chat_id, self.config.context.context_window_max),
                last_acked_entry: EntryId::ZERO,
            },
        };
        let state = &mut record.state;
        let metrics_mark = state.metrics_log.len();

        // Replayed tickets produce no duplicate visible side effects.
        if let Some(ticket) = envelope.ticket_id() {
            if state.ticket_seen(ticket) {
                debug!(ticket, chat_id = %chat_id, "duplicate ticket suppressed");
                state.push_telemetry(
                    "duplicate_ticket_suppressed",
                    json!({ "ticket_id": ticket }),
                );
                if let Some(entry_id) = entry_id {
                    record.last_acked_entry = record.last_acked_entry.max(entry_id);
                }
                self.checkpoints.save(&chat_id, &record).await?;
                return Ok(vec![]);
            }
        }

        // Supervisor verdicts pass the gate; schema violations get
        // feedback and never touch the state.
        let mut supervisor_applied = false;
        if envelope.sender == SUPERVISOR_RECIPIENT {
            match gate::handle_supervisor_envelope(state, envelope, &self.profile.identity) {
                GateOutcome::SchemaFeedback(feedback) => {
                    self.mailbox.post(&feedback).await?;
                    return Ok(vec![feedback]);
                }
                GateOutcome::Applied(_) => supervisor_applied = true,
            }
        }

        if emergency_stop_requested(&envelope.payload) {
            return self
                .handle_emergency_stop(envelope, &mut record, entry_id)
                .await;
        }

        self.absorb_payload(state, envelope);

        // Guardrails run before the graph so a tripped limit costs no
        // further model calls.
        if state.autonomous_mode {
            if let Some(kind) = self.tripped_limit(state) {
                return self
                    .handle_guardrail(kind, envelope, &mut record, entry_id)
                    .await;
            }
        }

        if envelope.sender != SUPERVISOR_RECIPIENT && !envelope.message.trim().is_empty() {
            state
                .messages
                .push(qc_engine::state::ChatMessage::human(&envelope.message));
            if state.task_goal.is_empty() && envelope.sender == HUMAN_RECIPIENT {
                state.task_goal = envelope.message.clone();
            }
        }

        let chat_cancel = self.chat_cancel(&chat_id);
        let outcome = self
            .graph
            .invoke_gated(state, &chat_cancel, supervisor_applied)
            .await?;
        if outcome.cancelled {
            // Partial output is discarded; no checkpoint, no responses.
            self.reset_chat_cancel(&chat_id);
            return Ok(vec![]);
        }
        state.autonomy_counters.iteration_count += 1;

        if let Some(ticket) = envelope.ticket_id() {
            state.mark_ticket(ticket);
        }

        let routing = state.autonomous_routing.clone();
        let mut recipients = self.profile.resolve_recipients(envelope, routing.as_ref());
        if outcome.delegated {
            // Work went to peer agents; hold the human-facing reply until
            // they report back.
            recipients.retain(|r| r != HUMAN_RECIPIENT);
        }

        let mut responses = Vec::new();
        if let Some(reply) = &outcome.reply {
            for recipient in recipients {
                let response =
                    self.build_response(envelope, state, recipient.clone(), reply.clone());
                self.mailbox.post(&response).await?;
                responses.push(response);
            }
        }

        if let Some(entry_id) = entry_id {
            record.last_acked_entry = record.last_acked_entry.max(entry_id);
        }
        self.checkpoints.save(&chat_id, &record).await?;
        self.publish_metric_events(&record.state, metrics_mark).await;

        Ok(responses)
    }

    /// Fold canonical payload fields into the state.
    fn absorb_payload(&self, state: &mut ChatState, envelope: &MessageEnvelope) {
        if self.profile.autonomous {
            state.autonomous_mode = true;
            if state.autonomous_started_at.is_none() {
                state.autonomous_started_at = Some(Utc::now());
            }
        }
        if let Some(settings) = envelope.payload.get("autonomous_settings") {
            if let Ok(settings) = serde_json::from_value::<AutonomousSettings>(settings.clone()) {
                state.autonomous_settings = Some(settings);
            }
        }
        if let Some(routing) = envelope
            .payload
            .get("autonomous_routing")
            .or_else(|| envelope.payload.get("autonomous"))
            .and_then(AutonomousRoutingDirective::from_payload)
        {
            state.autonomous_routing = Some(routing);
        }
    }

    /// Which autonomous limit, if any, has been reached.
    fn tripped_limit(&self, state: &ChatState) -> Option<&'static str> {
        let settings = state
            .autonomous_settings
            .clone()
            .unwrap_or_else(|| self.config.autonomous.clone());

        if state.autonomy_counters.iteration_count >= settings.max_iterations {
            return Some("iteration_limit");
        }
        if let Some(started_at) = state.autonomous_started_at {
            let elapsed_hours =
                (Utc::now() - started_at).num_seconds().max(0) as f64 / 3600.0;
            if elapsed_hours >= settings.max_hours {
                return Some("runtime_limit");
            }
        }
        None
    }

    async fn handle_guardrail(
        &self,
        kind: &'static str,
        envelope: &MessageEnvelope,
        record: &mut CheckpointRecord,
        entry_id: Option<EntryId>,
    ) -> Result<Vec<MessageEnvelope>> {
        let chat_id = record.state.chat_id.clone();
        warn!(kind, chat_id = %chat_id, "autonomous guardrail tripped");

        let directive = AutonomousRoutingDirective {
            deliver_to_human: true,
            escalate: true,
            reason: Some(format!("{kind} reached")),
            recovery_attempts: vec![],
        };
        record.state.autonomous_routing = Some(directive.clone());
        record.state.push_telemetry(
            "guardrail_trigger",
            json!({
                "type": kind,
                "iteration_count": record.state.autonomy_counters.iteration_count,
            }),
        );
        self.publish_autonomous_event(
            "guardrail_trigger",
            json!({
                "type": kind,
                "chat_id": chat_id,
                "iteration_count": record.state.autonomy_counters.iteration_count,
            }),
        )
        .await;

        let notice = format!(
            "Autonomous run stopped: {kind} reached after {} iterations.",
            record.state.autonomy_counters.iteration_count
        );
        let response = self.build_response(
            envelope,
            &record.state,
            HUMAN_RECIPIENT.to_string(),
            notice,
        );
        self.mailbox.post(&response).await?;

        if let Some(entry_id) = entry_id {
            record.last_acked_entry = record.last_acked_entry.max(entry_id);
        }
        self.checkpoints.save(&chat_id, record).await?;
        Ok(vec![response])
    }

    async fn handle_emergency_stop(
        &self,
        envelope: &MessageEnvelope,
        record: &mut CheckpointRecord,
        entry_id: Option<EntryId>,
    ) -> Result<Vec<MessageEnvelope>> {
        let chat_id = record.state.chat_id.clone();
        info!(chat_id = %chat_id, "emergency stop received, bypassing graph");

        record.state.current_phase = "halted_by_human".to_string();
        let directive = AutonomousRoutingDirective {
            deliver_to_human: true,
            escalate: true,
            reason: Some("emergency stop requested by human".to_string()),
            recovery_attempts: vec![],
        };
        record.state.autonomous_routing = Some(directive.clone());
        record
            .state
            .push_telemetry("control_event", json!({ "action": "emergency_stop" }));
        self.publish_autonomous_event(
            "control_event",
            json!({ "action": "emergency_stop", "chat_id": chat_id }),
        )
        .await;

        let response = self.build_response(
            envelope,
            &record.state,
            HUMAN_RECIPIENT.to_string(),
            "Emergency stop acknowledged; autonomous execution halted.".to_string(),
        );
        self.mailbox.post(&response).await?;

        // Fresh token so later envelopes for this chat run again.
        self.reset_chat_cancel(&chat_id);

        if let Some(entry_id) = entry_id {
            record.last_acked_entry = record.last_acked_entry.max(entry_id);
        }
        self.checkpoints.save(&chat_id, record).await?;
        Ok(vec![response])
    }

    /// Build one response envelope carrying the reply and the canonical
    /// telemetry payload.
    fn build_response(
        &self,
        incoming: &MessageEnvelope,
        state: &ChatState,
        recipient: String,
        reply: String,
    ) -> MessageEnvelope {
        let trace: Vec<Value> = state
            .messages
            .iter()
            .rev()
            .take(10)
            .map(|m| match m {
                qc_engine::state::ChatMessage::System { content } => {
                    json!({"role": "system", "content": content})
                }
                qc_engine::state::ChatMessage::Human { content } => {
                    json!({"role": "human", "content": content})
                }
                qc_engine::state::ChatMessage::Ai { content, .. } => {
                    json!({"role": "ai", "content": content})
                }
                qc_engine::state::ChatMessage::Tool { content, name, .. } => {
                    json!({"role": "tool", "name": name, "content": content})
                }
            })
            .collect();
        let trace: Vec<Value> = trace.into_iter().rev().collect();

        let mut response = MessageEnvelope::new(&self.profile.identity, recipient, reply)
            .with_payload("chat_id", json!(state.chat_id))
            .with_payload("exhaustion_mode", json!(state.exhaustion_mode.as_str()))
            .with_payload(
                "exhaustion_probability",
                json!(state.exhaustion_probability),
            )
            .with_payload("messages", Value::Array(trace))
            .with_payload("state", json!({ "current_phase": state.current_phase }));

        if let Some(ticket) = incoming.ticket_id() {
            response = response.with_payload("ticket_id", json!(ticket));
        }
        if let Some(routing) = &state.autonomous_routing {
            response = response.with_payload(
                "autonomous",
                serde_json::to_value(routing).unwrap_or(Value::Null),
            );
        }
        response
    }

    async fn publish_autonomous_event(&self, event: &str, payload: Value) {
        let envelope = MessageEnvelope::new(&self.profile.identity, "autonomous-events", event)
            .with_payload("event", payload);
        if let Err(err) = self
            .mailbox
            .post_to_stream(AUTONOMOUS_EVENTS_STREAM, &envelope)
            .await
        {
            warn!(error = %err, "autonomous event publication failed");
        }
    }

    /// Publish metric events accumulated during this invocation.
    async fn publish_metric_events(&self, state: &ChatState, from_index: usize) {
        if !self.config.observability.metrics_enabled {
            return;
        }
        for event in state.metrics_log.iter().skip(from_index) {
            let envelope = MessageEnvelope::new(
                &self.profile.identity,
                "context-metrics",
                event.event.clone(),
            )
            .with_payload("chat_id", json!(state.chat_id))
            .with_payload("event", event.payload.clone())
            .with_payload("recorded_at", json!(event.timestamp));
            if let Err(err) = self
                .mailbox
                .post_to_stream(CONTEXT_METRICS_STREAM, &envelope)
                .await
            {
                warn!(error = %err, "metric event publication failed");
                return;
            }
        }
    }
}

/// Chat key for an envelope: its `chat_id` payload, falling back to a
/// per-sender chat so stateless pings still serialize sanely.
fn chat_key(envelope: &MessageEnvelope) -> String {
    envelope
        .chat_id()
        .map(str::to_string)
        .unwrap_or_else(|| format!("chat-{}", envelope.sender))
}

/// Await a set of handles, ignoring panics (they are already logged).
async fn futures_join(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}
