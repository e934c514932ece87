//! Error types for node allocation.

use nodegrid_state::StateError;
use thiserror::Error;

/// Result type alias for allocation operations.
pub type AllocationResult<T> = Result<T, AllocationError>;

#[derive(Debug, Error)]
pub enum AllocationError {
    /// The requested nodes could not be allocated.
    #[error("{message}")]
    NodeAllocation { message: String, retryable: bool },

    /// The request can never succeed as stated.
    #[error("illegal request: {0}")]
    IllegalRequest(String),

    /// A candidate could not be turned into a node.
    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),

    #[error(transparent)]
    State(#[from] StateError),
}

impl AllocationError {
    pub fn is_retryable(&self) -> bool {
        match self {
            AllocationError::NodeAllocation { retryable, .. } => *retryable,
            AllocationError::State(StateError::LockTimeout { .. }) => true,
            _ => false,
        }
    }
}
