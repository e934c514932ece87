//! Error types for the node repository.

use thiserror::Error;

/// Result type alias for node repository operations.
pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("timed out after {timeout_secs}s waiting for lock '{path}'")]
    LockTimeout { path: String, timeout_secs: u64 },

    #[error("illegal state transition for {what}: {from} -> {to}")]
    IllegalTransition {
        what: String,
        from: String,
        to: String,
    },
}
