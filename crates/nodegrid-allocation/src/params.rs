//! Settings fixed for the duration of one allocation.

use nodegrid_core::{ApplicationId, ClusterSpec, Zone, ZoneConfig};

use crate::calculator::ResourcesCalculator;

/// Everything an allocation pass reads besides the node snapshot. Computed
/// once per prepare so probe and locked passes decide identically.
#[derive(Debug, Clone)]
pub struct AllocationParams {
    pub application: ApplicationId,
    /// The requested cluster, with exclusivity already decided.
    pub cluster: ClusterSpec,
    pub zone: Zone,
    /// Whether the cluster must get hosts of its own.
    pub exclusive_allocation: bool,
    /// Claim a shared host for an exclusive cluster instead of rejecting it.
    pub make_exclusive: bool,
    pub spare_count: usize,
    pub required_host_flavor: Option<String>,
    pub calculator: ResourcesCalculator,
    pub now: u64,
}

impl AllocationParams {
    pub fn new(
        config: &ZoneConfig,
        application: ApplicationId,
        cluster: ClusterSpec,
        now: u64,
    ) -> Self {
        let zone = config.zone();
        let exclusive_allocation = cluster.exclusive || !zone.cloud.allow_host_sharing;
        Self {
            application,
            cluster,
            zone,
            exclusive_allocation,
            make_exclusive: config.provisioning.make_exclusive,
            spare_count: config.provisioning.spare_count,
            required_host_flavor: config.provisioning.required_host_flavor.clone(),
            calculator: ResourcesCalculator::new(&config.resources),
            now,
        }
    }

    pub fn dynamic_provisioning(&self) -> bool {
        self.zone.cloud.dynamic_provisioning
    }

    pub fn allow_host_sharing(&self) -> bool {
        self.zone.cloud.allow_host_sharing
    }
}
