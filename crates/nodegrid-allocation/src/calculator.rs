//! Translation between advertised and real node resources.

use nodegrid_core::NodeResources;
use nodegrid_core::config::ResourcesConfig;
use nodegrid_state::Node;

/// Computes the resources a node really has once host overhead is paid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourcesCalculator {
    memory_overhead_gb: f64,
    disk_overhead_gb: f64,
}

impl ResourcesCalculator {
    pub fn new(config: &ResourcesConfig) -> Self {
        Self {
            memory_overhead_gb: config.memory_overhead_gb,
            disk_overhead_gb: config.disk_overhead_gb,
        }
    }

    /// No overhead: real resources equal advertised ones.
    pub fn identity() -> Self {
        Self {
            memory_overhead_gb: 0.0,
            disk_overhead_gb: 0.0,
        }
    }

    /// Real resources of `node`. Hosts run on bare hardware and pay no overhead.
    pub fn real_resources_of(&self, node: &Node) -> NodeResources {
        if node.parent_hostname.is_none() {
            return *node.resources();
        }
        self.real_from_advertised(node.resources())
    }

    pub fn real_from_advertised(&self, advertised: &NodeResources) -> NodeResources {
        advertised
            .with_memory_gb(advertised.memory_gb - self.memory_overhead_gb)
            .with_disk_gb(advertised.disk_gb - self.disk_overhead_gb)
    }

    pub fn advertised_from_real(&self, real: &NodeResources) -> NodeResources {
        real.with_memory_gb(real.memory_gb + self.memory_overhead_gb)
            .with_disk_gb(real.disk_gb + self.disk_overhead_gb)
    }

    pub fn disk_overhead_gb(&self) -> f64 {
        self.disk_overhead_gb
    }
}
