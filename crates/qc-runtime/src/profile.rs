//! Process profiles and routing policy.
//!
//! A profile fixes a process's identity, system prompt, and the policy
//! that maps a processed envelope to response recipients. Two kinds
//! exist: the orchestrator (fans out to `reply_to`, answers the human)
//! and worker agents (answer whoever addressed them).

use qc_types::autonomous::AutonomousRoutingDirective;
use qc_types::envelope::{MessageEnvelope, HUMAN_RECIPIENT, ORCHESTRATOR_RECIPIENT};

/// System prompt for the interactive orchestrator.
pub const ORCHESTRATOR_PROMPT: &str = "\
You are the orchestrator of a fleet of worker agents. You coordinate work \
through the Perpetual Refinement Protocol: propose an approach, hypothesize \
when challenged, execute, test, and conclude only with passing evidence. \
Delegate substantial work to worker agents with the manage_agents tool, track \
hypotheses in the refinement ledger, and record every test outcome. When the \
supervisor rejects your proposal, treat the critique as the work plan for the \
next cycle. Answer the human directly and concisely once the work is done.";

/// System prompt for the autonomous orchestrator.
pub const ORCHESTRATOR_AUTONOMOUS_PROMPT: &str = "\
You are the orchestrator running autonomously; no human is watching. Drive \
the Perpetual Refinement Protocol end to end: propose, hypothesize under \
challenge, execute through worker agents, test everything, and conclude only \
on passing evidence. Consult past failures before proposing again; duplicate \
hypotheses without a new strategy will be rejected. Do not contact the human \
unless you are delivering the final report or escalating a fatal condition, \
and record recovery attempts before any escalation. Respect the iteration \
and time budgets; if a guardrail trips, summarize state honestly.";

/// System prompt for worker agents.
pub const AGENT_PROMPT: &str = "\
You are a worker agent in an orchestrated fleet. Complete the task you were \
handed using your tools, report structured results, and reply to the process \
that addressed you. Keep output factual; if a command fails, report the \
failure rather than guessing.";

/// Which role the process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileKind {
    Orchestrator,
    Agent,
}

/// A process profile.
#[derive(Debug, Clone)]
pub struct Profile {
    /// Mailbox identity.
    pub identity: String,
    pub kind: ProfileKind,
    pub system_prompt: String,
    /// Autonomous routing rules apply (human excluded by default).
    pub autonomous: bool,
}

impl Profile {
    /// Orchestrator profile; `autonomous` selects the routing policy and
    /// prompt.
    pub fn orchestrator(autonomous: bool) -> Self {
        Self {
            identity: ORCHESTRATOR_RECIPIENT.to_string(),
            kind: ProfileKind::Orchestrator,
            system_prompt: if autonomous {
                ORCHESTRATOR_AUTONOMOUS_PROMPT.to_string()
            } else {
                ORCHESTRATOR_PROMPT.to_string()
            },
            autonomous,
        }
    }

    /// Worker-agent profile for a concrete agent id.
    pub fn agent(agent_id: impl Into<String>) -> Self {
        Self {
            identity: agent_id.into(),
            kind: ProfileKind::Agent,
            system_prompt: AGENT_PROMPT.to_string(),
            autonomous: false,
        }
    }

    /// Response recipients for a processed envelope.
    ///
    /// Agents answer whoever addressed them. The orchestrator honors
    /// `reply_to`, defaulting to the human when interactive; in
    /// autonomous mode the human is excluded unless the routing
    /// directive asks for delivery or escalation.
    pub fn resolve_recipients(
        &self,
        envelope: &MessageEnvelope,
        routing: Option<&AutonomousRoutingDirective>,
    ) -> Vec<String> {
        match self.kind {
            ProfileKind::Agent => {
                if envelope.sender != self.identity && !envelope.sender.is_empty() {
                    vec![envelope.sender.clone()]
                } else {
                    vec![ORCHESTRATOR_RECIPIENT.to_string()]
                }
            }
            ProfileKind::Orchestrator => {
                let mut recipients: Vec<String> = envelope
                    .reply_to()
                    .into_iter()
                    .filter(|r| r != &self.identity)
                    .collect();

                if self.autonomous {
                    recipients.retain(|r| r != HUMAN_RECIPIENT);
                    let wants_human = routing.map(|r| r.wants_human()).unwrap_or(false);
                    if wants_human {
                        recipients.push(HUMAN_RECIPIENT.to_string());
                    }
                } else if recipients.is_empty() {
                    recipients.push(HUMAN_RECIPIENT.to_string());
                }

                recipients.dedup();
                recipients
            }
        }
    }
}
