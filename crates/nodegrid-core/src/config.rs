//! nodegrid.toml zone configuration parser.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::flavor::{FlavorError, FlavorGraph};
use crate::resources::{Architecture, DiskSpeed, NodeResources, StorageType};
use crate::zone::{Cloud, Environment, SystemName, Zone};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ZoneConfig {
    pub zone: ZoneSection,
    pub flavors: Vec<FlavorConfig>,
    pub provisioning: ProvisioningConfig,
    pub resources: ResourcesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneSection {
    pub environment: Environment,
    pub system: SystemName,
    pub region: String,
    pub cloud: Cloud,
}

impl Default for ZoneSection {
    fn default() -> Self {
        Self {
            environment: Environment::Prod,
            system: SystemName::Main,
            region: "default".to_string(),
            cloud: Cloud::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlavorConfig {
    pub name: String,
    pub vcpu: f64,
    pub memory_gb: f64,
    pub disk_gb: f64,
    pub bandwidth_gbps: f64,
    pub disk_speed: DiskSpeed,
    pub storage_type: StorageType,
    pub architecture: Architecture,
    pub cost: u32,
    pub replaces: Vec<String>,
}

impl Default for FlavorConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            vcpu: 0.0,
            memory_gb: 0.0,
            disk_gb: 0.0,
            bandwidth_gbps: 1.0,
            disk_speed: DiskSpeed::Fast,
            storage_type: StorageType::Local,
            architecture: Architecture::X86_64,
            cost: 0,
            replaces: Vec::new(),
        }
    }
}

impl FlavorConfig {
    pub fn resources(&self) -> NodeResources {
        NodeResources::new(self.vcpu, self.memory_gb, self.disk_gb, self.bandwidth_gbps)
            .with_disk_speed(self.disk_speed)
            .with_storage_type(self.storage_type)
            .with_architecture(self.architecture)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Number of hosts kept free to absorb node failures.
    pub spare_count: usize,
    /// Host flavor every tenant node must land on, if set.
    pub required_host_flavor: Option<String>,
    /// Claim a non-exclusive host for an exclusive cluster instead of rejecting it.
    pub make_exclusive: bool,
    /// Hostname of the host this allocator runs on. Its index is never given
    /// to a new infrastructure host.
    pub hostname: Option<String>,
    pub reservation_ttl_secs: u64,
    pub lock_timeout_secs: u64,
    pub cache_ttl_secs: u64,
    pub load_balancer_expiry_secs: u64,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            spare_count: 0,
            required_host_flavor: None,
            make_exclusive: false,
            hostname: None,
            reservation_ttl_secs: 15 * 60,
            lock_timeout_secs: 10,
            cache_ttl_secs: 60,
            load_balancer_expiry_secs: 60 * 60,
        }
    }
}

/// Overhead subtracted from advertised resources to get what a node really has.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    pub memory_overhead_gb: f64,
    pub disk_overhead_gb: f64,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            memory_overhead_gb: 0.7,
            disk_overhead_gb: 0.0,
        }
    }
}

impl ZoneConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: ZoneConfig = toml::from_str(content)?;
        // Fail early on a broken flavor graph rather than at first allocation.
        config.flavor_graph()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn zone(&self) -> Zone {
        Zone::new(self.zone.environment, self.zone.region.clone())
            .with_system(self.zone.system)
            .with_cloud(self.zone.cloud.clone())
    }

    pub fn flavor_graph(&self) -> Result<FlavorGraph, FlavorError> {
        FlavorGraph::from_config(&self.flavors)
    }
}
