//! Context engine and Perpetual Refinement Protocol for quorumcode.
//!
//! This crate owns the per-chat working state and everything that mutates
//! it between envelope intake and response fan-out:
//!
//! - [`state`]: the durable [`ChatState`](state::ChatState) blob: transcript,
//!   context segments, refinement ledger, counters, telemetry.
//! - [`prp`]: the five-state propose/hypothesize/execute/test/conclude
//!   machine with its transition table and cycle counter.
//! - [`invariants`]: soft invariants checked on cycle boundaries; violations
//!   are logged, never thrown.
//! - [`exhaustion`]: saturation detection and the preemptive exhaustion
//!   predictor over the ledger tail.
//! - [`ledger`]: hypothesis lifecycle operations with the novelty guard and
//!   causal-chain inference.
//! - [`critique`]: translation of supervisor rejections into concrete test
//!   plans and improvement items.
//! - [`context`]: the scorer → curator → loader → governor → reset pipeline
//!   wrapped around every LLM call.
//! - [`memory`]: episodic/semantic long-term memory distilled from the
//!   ledger.
//! - [`time_travel`]: per-thread JSONL stage recording with replay and
//!   cycle diffing.
//! - [`workspace_integrity`]: manifest snapshots and drift detection for
//!   attached workspaces.

pub mod context;
pub mod critique;
pub mod exhaustion;
pub mod invariants;
pub mod ledger;
pub mod memory;
pub mod prp;
pub mod state;
pub mod time_travel;
pub mod workspace_integrity;

pub use context::ContextEngine;
pub use state::ChatState;
