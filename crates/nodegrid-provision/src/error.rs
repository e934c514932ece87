//! Error types for provisioning.

use nodegrid_allocation::AllocationError;
use nodegrid_core::FlavorError;
use nodegrid_state::StateError;
use thiserror::Error;

/// Result type alias for provisioning operations.
pub type ProvisionResult<T> = Result<T, ProvisionError>;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error(transparent)]
    Flavor(#[from] FlavorError),

    /// The host can never become usable and must be deprovisioned.
    #[error("fatal provisioning failure for {hostname}: {message}")]
    FatalProvisioning { hostname: String, message: String },

    /// The cloud provider is rate limiting us.
    #[error("throttled by cloud provider: {0}")]
    Throttled(String),

    #[error(transparent)]
    LoadBalancer(#[from] LoadBalancerError),

    #[error("activation conflict: {0}")]
    ActivationConflict(String),
}

impl ProvisionError {
    /// Whether retrying the whole prepare or activate cycle may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProvisionError::Allocation(e) => e.is_retryable(),
            ProvisionError::State(StateError::LockTimeout { .. }) => true,
            ProvisionError::Throttled(_) => true,
            ProvisionError::LoadBalancer(e) => e.is_retryable(),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadBalancerError {
    /// The load balancer service failed.
    #[error("load balancer service failed for {id}: {message}")]
    Service { id: String, message: String },

    /// Activation came before the load balancer was provisioned.
    #[error("load balancer {0} is not ready")]
    NotReady(String),

    #[error("no load balancer prepared for {0}")]
    NotPrepared(String),

    #[error(transparent)]
    State(#[from] StateError),
}

impl LoadBalancerError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LoadBalancerError::State(_))
    }
}
