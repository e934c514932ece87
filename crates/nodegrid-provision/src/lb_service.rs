//! Contract with the load balancer service.

use std::collections::BTreeSet;
use std::fmt;

use nodegrid_core::{CloudAccount, ClusterType, ZoneEndpoint};
use nodegrid_state::{LoadBalancer, LoadBalancerId, LoadBalancerInstance, NodeType, Real};

use crate::error::LoadBalancerError;

/// Desired configuration of one load balancer.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadBalancerSpec {
    pub id: LoadBalancerId,
    pub id_seed: String,
    pub reals: BTreeSet<Real>,
    pub settings: ZoneEndpoint,
    pub cloud_account: CloudAccount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Ipv4,
    Ipv6,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Ipv4 => f.write_str("ipv4"),
            Protocol::Ipv6 => f.write_str("ipv6"),
        }
    }
}

pub trait LoadBalancerService: Send + Sync {
    /// Create a load balancer.
    fn provision(&self, spec: &LoadBalancerSpec) -> Result<LoadBalancerInstance, LoadBalancerError>;

    /// Bring an existing load balancer in line with `spec`. With
    /// `force_reload`, reapply the configuration even if nothing changed.
    fn configure(
        &self,
        instance: &LoadBalancerInstance,
        spec: &LoadBalancerSpec,
        force_reload: bool,
    ) -> Result<LoadBalancerInstance, LoadBalancerError>;

    fn remove(&self, load_balancer: &LoadBalancer) -> Result<(), LoadBalancerError>;

    /// Whether clusters of this kind get a load balancer at all.
    fn supports(&self, node_type: NodeType, cluster_type: ClusterType) -> bool;

    fn protocol(&self, enclave: bool) -> Protocol;
}
