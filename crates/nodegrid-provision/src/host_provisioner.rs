//! Contract with the cloud backend that creates and destroys hosts.

use nodegrid_core::{ApplicationId, CloudAccount, ClusterType, NodeResources};
use nodegrid_state::{IpConfig, Node, NodeType};
use semver::Version;

use crate::error::ProvisionResult;

/// What the allocator needs from a batch of new hosts.
#[derive(Debug, Clone, PartialEq)]
pub struct HostProvisionRequest {
    /// Provision indices to derive hostnames from, one per host.
    pub indices: Vec<u64>,
    pub host_type: NodeType,
    /// Resources of the child each host must fit.
    pub resources: NodeResources,
    pub owner: ApplicationId,
    pub cluster_type: ClusterType,
    /// Whether the hosts are dedicated to `owner`.
    pub exclusive: bool,
    pub cloud_account: CloudAccount,
    pub os_version: Option<Version>,
    /// Prefer the newest flavor generation.
    pub upgrade_flavor: bool,
}

impl HostProvisionRequest {
    pub fn count(&self) -> usize {
        self.indices.len()
    }
}

/// A host created by the backend, with the child node it was created for.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionedHost {
    pub host: Node,
    pub child: Node,
}

/// Something the cloud provider says will happen to a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEvent {
    pub id: String,
    pub hostname: String,
    pub kind: String,
    pub description: String,
}

/// Callback receiving newly created hosts. Must persist them before
/// returning, so a crash after the call cannot orphan cloud resources.
pub type ProvisionedCallback<'a> = dyn FnMut(Vec<ProvisionedHost>) -> ProvisionResult<()> + 'a;

/// A cloud backend.
///
/// Failures are reported as [`ProvisionError::FatalProvisioning`] when the
/// host can never become usable, and [`ProvisionError::Throttled`] when the
/// call should be retried later.
///
/// [`ProvisionError::FatalProvisioning`]: crate::ProvisionError::FatalProvisioning
/// [`ProvisionError::Throttled`]: crate::ProvisionError::Throttled
pub trait HostProvisioner: Send + Sync {
    /// Create the hosts in `request`, passing them to `on_provisioned` as
    /// they become known.
    fn provision_hosts(
        &self,
        request: &HostProvisionRequest,
        on_provisioned: &mut ProvisionedCallback<'_>,
    ) -> ProvisionResult<()>;

    /// Finish setting up a host created earlier, returning its addresses.
    fn provision(&self, host: &Node) -> ProvisionResult<IpConfig>;

    fn deprovision(&self, host: &Node) -> ProvisionResult<()>;

    /// Replace the root disk of `host`. Calling it again for the same host
    /// is a no-op.
    fn replace_root_disk(&self, host: &Node) -> ProvisionResult<Node>;

    fn host_events_in(&self, accounts: &[CloudAccount]) -> ProvisionResult<Vec<HostEvent>>;

    /// Whether `child` could move to a host of a newer flavor generation.
    fn can_upgrade_flavor(&self, host: &Node, child: &Node) -> bool;
}
