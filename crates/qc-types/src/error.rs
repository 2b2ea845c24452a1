//! Error types for the quorumcode runtime.
//!
//! [`QcError`] is the top-level error. Variants are grouped into
//! recoverable (fabric I/O, registry transport) and fatal (checkpoint
//! corruption, configuration) categories so callers can decide whether a
//! retry is worthwhile. The enum is non-exhaustive to allow extension
//! without breaking downstream crates.

use thiserror::Error;

/// Top-level error type for the quorumcode runtime.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum QcError {
    // ── Recoverable ──────────────────────────────────────────────────

    /// A fabric (mailbox stream) operation failed transiently.
    #[error("fabric error: {0}")]
    Fabric(String),

    /// A registry request failed at the transport layer.
    #[error("registry transport error: {0}")]
    RegistryTransport(String),

    /// An operation exceeded its deadline.
    #[error("operation timed out: {operation}")]
    Timeout {
        /// Human-readable name of the operation that timed out.
        operation: String,
    },

    /// The LLM driver returned an error.
    #[error("driver error: {0}")]
    Driver(String),

    /// A tool invocation failed. The failure is also reported back to the
    /// LLM as tool output; this variant is for dispatch-level failures.
    #[error("tool error: {tool}: {reason}")]
    Tool {
        /// Name of the tool that failed.
        tool: String,
        /// What went wrong.
        reason: String,
    },

    // ── Protocol ─────────────────────────────────────────────────────

    /// A structured payload failed schema validation.
    #[error("schema violation: {0}")]
    Schema(String),

    // ── Fatal ────────────────────────────────────────────────────────

    /// The checkpoint store is unreadable or holds a corrupt blob.
    #[error("checkpoint store corrupt: {0}")]
    CheckpointCorrupt(String),

    /// The registry stayed unreachable past the startup deadline.
    #[error("registry unreachable past startup timeout: {0}")]
    RegistryUnreachable(String),

    /// Configuration is malformed or semantically invalid.
    #[error("invalid config: {reason}")]
    ConfigInvalid {
        /// What is wrong with the configuration.
        reason: String,
    },

    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QcError {
    /// Whether the error class is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            QcError::Fabric(_) | QcError::RegistryTransport(_) | QcError::Timeout { .. }
        )
    }
}
