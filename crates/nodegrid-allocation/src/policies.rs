//! Environment-dependent sizing of clusters.
//!
//! Production gets what it asks for. Other environments are shrunk: fewer
//! nodes, and where hosts are shared, smaller and cheaper nodes.

use nodegrid_core::{
    ApplicationId, CloudAccount, ClusterSpec, ClusterType, DiskSpeed, Environment, NodeResources,
    StorageType, Zone,
};

use crate::error::{AllocationError, AllocationResult};

#[derive(Debug, Clone, Copy)]
pub struct CapacityPolicies<'a> {
    zone: &'a Zone,
}

impl<'a> CapacityPolicies<'a> {
    pub fn new(zone: &'a Zone) -> Self {
        Self { zone }
    }

    /// Number of nodes to allocate for a request of `requested`.
    pub fn decide_size(
        &self,
        requested: u32,
        required: bool,
        can_fail: bool,
        cluster: &ClusterSpec,
        application: &ApplicationId,
    ) -> AllocationResult<u32> {
        if application.is_tester() {
            return Ok(1);
        }
        self.ensure_redundancy(requested, cluster, can_fail)?;
        if required {
            return Ok(requested);
        }
        Ok(match self.zone.environment {
            Environment::Dev | Environment::Test => 1,
            Environment::Perf => requested.min(3),
            Environment::Staging => {
                if requested <= 1 {
                    requested
                } else {
                    (requested / 10).max(2)
                }
            }
            Environment::Prod => requested,
        })
    }

    fn ensure_redundancy(&self, count: u32, cluster: &ClusterSpec, can_fail: bool) -> AllocationResult<()> {
        let requires_redundancy = matches!(
            cluster.cluster_type,
            ClusterType::Content | ClusterType::Container | ClusterType::Combined
        );
        if can_fail && count == 1 && requires_redundancy && self.zone.environment.is_production() {
            return Err(AllocationError::IllegalRequest(format!(
                "deployments to prod require at least 2 nodes per cluster for redundancy, not fulfilled for {cluster}"
            )));
        }
        Ok(())
    }

    /// Node resources to allocate, given what was asked for (if anything).
    pub fn decide_node_resources(
        &self,
        requested: Option<NodeResources>,
        required: bool,
        exclusive: bool,
        cluster: &ClusterSpec,
    ) -> NodeResources {
        let mut target = requested.unwrap_or_else(|| default_resources(cluster.cluster_type));
        // Required or exclusive resources are never downsized.
        if required || exclusive {
            return target;
        }
        if self.zone.environment == Environment::Dev && self.zone.cloud.allow_host_sharing {
            target = target.with_vcpu(0.1).with_bandwidth_gbps(0.1);
        }
        // Slow storage is fine where performance does not matter.
        if self.zone.system.is_cd()
            || matches!(self.zone.environment, Environment::Dev | Environment::Test)
        {
            target = target
                .with_disk_speed(DiskSpeed::Any)
                .with_storage_type(StorageType::Any)
                .with_bandwidth_gbps(0.1);
        }
        target
    }

    /// Whether the cluster gets hosts of its own.
    pub fn decide_exclusivity(
        &self,
        requested_account: &CloudAccount,
        required: bool,
        cluster: &ClusterSpec,
    ) -> bool {
        let custom_account = !requested_account.is_unspecified()
            && *requested_account != self.zone.cloud.account;
        if custom_account && self.zone.environment.is_production() {
            return true;
        }
        cluster.exclusive && (required || self.zone.environment.is_production())
    }
}

/// Resources used when a cluster does not specify any.
pub fn default_resources(cluster_type: ClusterType) -> NodeResources {
    match cluster_type {
        ClusterType::Admin => NodeResources::new(0.5, 2.0, 50.0, 0.3),
        ClusterType::Container => NodeResources::new(2.0, 8.0, 50.0, 0.3),
        ClusterType::Content | ClusterType::Combined => NodeResources::new(2.0, 16.0, 300.0, 0.3),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodegrid_core::{Cloud, ClusterId, SystemName};
    use semver::Version;

    fn cluster(cluster_type: ClusterType) -> ClusterSpec {
        ClusterSpec::request(cluster_type, ClusterId::new("c"), Version::new(8, 0, 0))
    }

    fn app() -> ApplicationId {
        ApplicationId::new("t", "a", "default")
    }

    fn size(environment: Environment, requested: u32) -> u32 {
        let zone = Zone::new(environment, "r");
        CapacityPolicies::new(&zone)
            .decide_size(requested, false, false, &cluster(ClusterType::Container), &app())
            .unwrap()
    }

    #[test]
    fn size_per_environment() {
        assert_eq!(size(Environment::Dev, 5), 1);
        assert_eq!(size(Environment::Test, 5), 1);
        assert_eq!(size(Environment::Perf, 5), 3);
        assert_eq!(size(Environment::Perf, 2), 2);
        assert_eq!(size(Environment::Staging, 1), 1);
        assert_eq!(size(Environment::Staging, 5), 2);
        assert_eq!(size(Environment::Staging, 40), 4);
        assert_eq!(size(Environment::Prod, 5), 5);
    }

    #[test]
    fn required_size_is_kept_and_testers_get_one() {
        let zone = Zone::new(Environment::Dev, "r");
        let policies = CapacityPolicies::new(&zone);
        let container = cluster(ClusterType::Container);
        assert_eq!(policies.decide_size(4, true, false, &container, &app()).unwrap(), 4);
        let tester = ApplicationId::new("t", "a", "default-t");
        assert_eq!(policies.decide_size(4, true, false, &container, &tester).unwrap(), 1);
    }

    #[test]
    fn single_node_content_cluster_in_prod_is_illegal() {
        let zone = Zone::new(Environment::Prod, "r");
        let policies = CapacityPolicies::new(&zone);
        let err = policies
            .decide_size(1, false, true, &cluster(ClusterType::Content), &app())
            .unwrap_err();
        assert!(matches!(err, AllocationError::IllegalRequest(_)));
        // Admin clusters and requests that may not fail are exempt.
        assert!(policies.decide_size(1, false, true, &cluster(ClusterType::Admin), &app()).is_ok());
        assert!(policies.decide_size(1, false, false, &cluster(ClusterType::Content), &app()).is_ok());
    }

    #[test]
    fn dev_downscales_shared_nodes() {
        let zone = Zone::new(Environment::Dev, "r");
        let policies = CapacityPolicies::new(&zone);
        let requested = NodeResources::new(4.0, 16.0, 100.0, 1.0);
        let decided = policies.decide_node_resources(Some(requested), false, false, &cluster(ClusterType::Container));
        assert_eq!(decided.vcpu, 0.1);
        assert_eq!(decided.bandwidth_gbps, 0.1);
        assert_eq!(decided.memory_gb, 16.0);
        assert_eq!(decided.disk_speed, DiskSpeed::Any);

        let exclusive = policies.decide_node_resources(Some(requested), false, true, &cluster(ClusterType::Container));
        assert_eq!(exclusive, requested);
    }

    #[test]
    fn cd_relaxes_disk_but_keeps_vcpu() {
        let zone = Zone::new(Environment::Prod, "r").with_system(SystemName::Cd);
        let policies = CapacityPolicies::new(&zone);
        let decided = policies.decide_node_resources(None, false, false, &cluster(ClusterType::Content));
        assert_eq!(decided.vcpu, 2.0);
        assert_eq!(decided.storage_type, StorageType::Any);
    }

    #[test]
    fn exclusivity_decision() {
        let prod = Zone::new(Environment::Prod, "r").with_cloud(Cloud {
            account: CloudAccount::new("zone-account"),
            ..Cloud::default()
        });
        let dev = Zone::new(Environment::Dev, "r");
        let shared = cluster(ClusterType::Container);
        let exclusive = shared.clone().with_exclusivity(true);
        let none = CloudAccount::unspecified();

        assert!(CapacityPolicies::new(&prod).decide_exclusivity(&CloudAccount::new("tenant"), false, &shared));
        assert!(!CapacityPolicies::new(&prod).decide_exclusivity(&CloudAccount::new("zone-account"), false, &shared));
        assert!(CapacityPolicies::new(&prod).decide_exclusivity(&none, false, &exclusive));
        assert!(!CapacityPolicies::new(&dev).decide_exclusivity(&none, false, &exclusive));
        assert!(CapacityPolicies::new(&dev).decide_exclusivity(&none, true, &exclusive));
        assert!(!CapacityPolicies::new(&dev).decide_exclusivity(&CloudAccount::new("tenant"), false, &shared));
    }
}
