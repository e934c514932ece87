//! Minimum node resources per environment and cluster type.

use nodegrid_core::{ApplicationId, ClusterSpec, ClusterType, NodeResources, Zone};

use crate::calculator::ResourcesCalculator;
use crate::error::{AllocationError, AllocationResult};

const MIN_REAL_DISK_GB: f64 = 6.0;

/// Floors below which tenant nodes are not usable.
#[derive(Debug, Clone)]
pub struct NodeResourceLimits<'a> {
    zone: &'a Zone,
    calculator: ResourcesCalculator,
}

impl<'a> NodeResourceLimits<'a> {
    pub fn new(zone: &'a Zone, calculator: ResourcesCalculator) -> Self {
        Self { zone, calculator }
    }

    /// Reject requests for less than the advertised minimum.
    pub fn ensure_within_advertised_limits(
        &self,
        what: &str,
        requested: &NodeResources,
        application: &ApplicationId,
        cluster: &ClusterSpec,
        exclusive: bool,
    ) -> AllocationResult<()> {
        let min_vcpu = self.min_advertised_vcpu(application, cluster, exclusive);
        if requested.vcpu < min_vcpu {
            return Err(illegal(what, "vcpu", "", cluster, requested.vcpu, min_vcpu));
        }
        let min_memory = min_advertised_memory_gb(cluster.cluster_type);
        if requested.memory_gb < min_memory {
            return Err(illegal(what, "memory_gb", " Gb", cluster, requested.memory_gb, min_memory));
        }
        let min_disk = self.min_advertised_disk_gb();
        if requested.disk_gb < min_disk {
            return Err(illegal(what, "disk_gb", " Gb", cluster, requested.disk_gb, min_disk));
        }
        Ok(())
    }

    /// Whether a node with these advertised resources has enough real
    /// resources left after overhead.
    pub fn is_within_real_limits(
        &self,
        advertised: &NodeResources,
        application: &ApplicationId,
        cluster: &ClusterSpec,
    ) -> bool {
        let real = self.calculator.real_from_advertised(advertised);
        real.vcpu >= self.min_advertised_vcpu(application, cluster, false)
            && real.memory_gb >= min_real_memory_gb(cluster.cluster_type)
            && real.disk_gb >= MIN_REAL_DISK_GB
    }

    fn min_advertised_vcpu(&self, application: &ApplicationId, cluster: &ClusterSpec, exclusive: bool) -> f64 {
        if cluster.cluster_type == ClusterType::Admin {
            return 0.1;
        }
        if self.zone.environment.is_production()
            && !self.zone.system.is_cd()
            && !exclusive
            && !application.is_tester()
        {
            return 0.5;
        }
        0.1
    }

    fn min_advertised_disk_gb(&self) -> f64 {
        MIN_REAL_DISK_GB + self.calculator.disk_overhead_gb()
    }
}

fn min_advertised_memory_gb(cluster_type: ClusterType) -> f64 {
    if cluster_type == ClusterType::Admin { 1.0 } else { 4.0 }
}

fn min_real_memory_gb(cluster_type: ClusterType) -> f64 {
    if cluster_type == ClusterType::Admin { 0.95 } else { 2.3 }
}

fn illegal(what: &str, resource: &str, unit: &str, cluster: &ClusterSpec, requested: f64, minimum: f64) -> AllocationError {
    AllocationError::IllegalRequest(format!(
        "{what} {resource} size is {requested:.2}{unit} but must be at least {minimum:.2}{unit} for {cluster}"
    ))
}
