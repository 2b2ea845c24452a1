//! Registry error type.

use thiserror::Error;

/// Errors raised by the registry service and store.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RegistryError {
    /// No record exists for the agent id.
    #[error("agent not found")]
    NotFound,

    /// The record is hotpath-protected; removal needs `force=true`.
    #[error("hotpath_agent")]
    HotpathAgent,

    /// Underlying database failure.
    #[error("database error: {0}")]
    Db(String),

    /// A blocking task was cancelled or panicked.
    #[error("task error: {0}")]
    Task(String),
}

impl From<rusqlite::Error> for RegistryError {
    fn from(err: rusqlite::Error) -> Self {
        RegistryError::Db(err.to_string())
    }
}
