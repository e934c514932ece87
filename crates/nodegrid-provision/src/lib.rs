//! nodegrid-provision: turning capacity requests into reserved and active nodes.
//!
//! A [`Provisioner`] prepares each cluster of a deployment with a
//! [`Preparer`], which probes without locks and allocates again under the
//! application and unallocated locks only when something must change. Hosts
//! are created through a [`HostProvisioner`] when the zone provisions
//! dynamically, and container clusters get a load balancer from a
//! [`LoadBalancerService`]. The [`Activator`] then turns the prepared hosts
//! into the application's active node set within one transaction.
//!
//! Background upkeep lives in [`maintenance`]: expiring reservations and
//! load balancers, and resuming, rebuilding, retiring and deprovisioning
//! hosts.

pub mod activator;
pub mod error;
pub mod host_provisioner;
pub mod lb_service;
pub mod load_balancer;
pub mod maintenance;
pub mod mock;
pub mod preparer;
pub mod provisioner;

pub use activator::Activator;
pub use error::{LoadBalancerError, ProvisionError, ProvisionResult};
pub use host_provisioner::{HostEvent, HostProvisionRequest, HostProvisioner, ProvisionedHost};
pub use lb_service::{LoadBalancerService, LoadBalancerSpec, Protocol};
pub use load_balancer::{LoadBalancerProvisioner, REAL_PORT};
pub use maintenance::{
    HostDeprovisioner, HostDiskReplacer, HostFlavorUpgrader, HostResumeProvisioner, HostRetirer,
    LoadBalancerExpirer, Maintainer, ReservationExpirer, run_maintainer,
};
pub use mock::{MockFailure, MockHostProvisioner, MockLoadBalancerService};
pub use preparer::{Decision, Preparer};
pub use provisioner::{Capacity, HostSpec, Provisioner, RestartFilter};
