//! Node resource vectors and their hardware tags.
//!
//! A [`NodeResources`] value is both what a host advertises and what a
//! tenant node requests. Numeric dimensions add and subtract; the tags
//! (disk speed, storage type, architecture) only constrain compatibility.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

const EPSILON: f64 = 0.000_000_01;

/// Disk speed of a node. `Any` means the requester does not care.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DiskSpeed {
    #[default]
    Fast,
    Slow,
    Any,
}

impl DiskSpeed {
    /// Orders by cost: `Any` can be slow and is therefore cheapest, then `Slow`, then `Fast`.
    pub fn compare_cost(a: DiskSpeed, b: DiskSpeed) -> Ordering {
        a.cost_rank().cmp(&b.cost_rank())
    }

    fn cost_rank(self) -> u8 {
        match self {
            DiskSpeed::Any => 0,
            DiskSpeed::Slow => 1,
            DiskSpeed::Fast => 2,
        }
    }

    pub fn compatible_with(self, other: DiskSpeed) -> bool {
        self == DiskSpeed::Any || other == DiskSpeed::Any || self == other
    }
}

/// Where node storage lives. Remote storage is cheaper than local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    Remote,
    Local,
    #[default]
    Any,
}

impl StorageType {
    /// Orders by cost: `Any`, then `Remote`, then `Local`.
    pub fn compare_cost(a: StorageType, b: StorageType) -> Ordering {
        a.cost_rank().cmp(&b.cost_rank())
    }

    fn cost_rank(self) -> u8 {
        match self {
            StorageType::Any => 0,
            StorageType::Remote => 1,
            StorageType::Local => 2,
        }
    }

    pub fn compatible_with(self, other: StorageType) -> bool {
        self == StorageType::Any || other == StorageType::Any || self == other
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    X86_64,
    Arm64,
    #[default]
    Any,
}

impl Architecture {
    pub fn compatible_with(self, other: Architecture) -> bool {
        self == Architecture::Any || other == Architecture::Any || self == other
    }
}

/// Resources of a node or host.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodeResources {
    pub vcpu: f64,
    pub memory_gb: f64,
    pub disk_gb: f64,
    pub bandwidth_gbps: f64,
    #[serde(default)]
    pub disk_speed: DiskSpeed,
    #[serde(default)]
    pub storage_type: StorageType,
    #[serde(default)]
    pub architecture: Architecture,
}

impl NodeResources {
    /// Numeric resources with default tags (fast disk, any storage, any architecture).
    pub fn new(vcpu: f64, memory_gb: f64, disk_gb: f64, bandwidth_gbps: f64) -> Self {
        Self {
            vcpu,
            memory_gb,
            disk_gb,
            bandwidth_gbps,
            disk_speed: DiskSpeed::default(),
            storage_type: StorageType::default(),
            architecture: Architecture::default(),
        }
    }

    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0, 0.0).just_numbers()
    }

    pub fn is_zero(&self) -> bool {
        equal(self.vcpu, 0.0)
            && equal(self.memory_gb, 0.0)
            && equal(self.disk_gb, 0.0)
            && equal(self.bandwidth_gbps, 0.0)
    }

    pub fn with_vcpu(mut self, vcpu: f64) -> Self {
        self.vcpu = vcpu;
        self
    }

    pub fn with_memory_gb(mut self, memory_gb: f64) -> Self {
        self.memory_gb = memory_gb;
        self
    }

    pub fn with_disk_gb(mut self, disk_gb: f64) -> Self {
        self.disk_gb = disk_gb;
        self
    }

    pub fn with_bandwidth_gbps(mut self, bandwidth_gbps: f64) -> Self {
        self.bandwidth_gbps = bandwidth_gbps;
        self
    }

    pub fn with_disk_speed(mut self, disk_speed: DiskSpeed) -> Self {
        self.disk_speed = disk_speed;
        self
    }

    pub fn with_storage_type(mut self, storage_type: StorageType) -> Self {
        self.storage_type = storage_type;
        self
    }

    pub fn with_architecture(mut self, architecture: Architecture) -> Self {
        self.architecture = architecture;
        self
    }

    /// The numeric dimensions only, with every tag relaxed to `Any`.
    pub fn just_numbers(self) -> Self {
        Self {
            disk_speed: DiskSpeed::Any,
            storage_type: StorageType::Any,
            architecture: Architecture::Any,
            ..self
        }
    }

    /// Copies the tags of `other` onto these numbers.
    pub fn with_tags_of(self, other: &NodeResources) -> Self {
        Self {
            disk_speed: other.disk_speed,
            storage_type: other.storage_type,
            architecture: other.architecture,
            ..self
        }
    }

    /// Adds the numeric dimensions of `other`, keeping the tags of `self`.
    pub fn add(self, other: &NodeResources) -> Self {
        Self {
            vcpu: self.vcpu + other.vcpu,
            memory_gb: self.memory_gb + other.memory_gb,
            disk_gb: self.disk_gb + other.disk_gb,
            bandwidth_gbps: self.bandwidth_gbps + other.bandwidth_gbps,
            ..self
        }
    }

    /// Subtracts the numeric dimensions of `other`, keeping the tags of `self`.
    /// The result may be negative when `other` does not fit.
    pub fn subtract(self, other: &NodeResources) -> Self {
        Self {
            vcpu: self.vcpu - other.vcpu,
            memory_gb: self.memory_gb - other.memory_gb,
            disk_gb: self.disk_gb - other.disk_gb,
            bandwidth_gbps: self.bandwidth_gbps - other.bandwidth_gbps,
            ..self
        }
    }

    /// Whether these resources are at least as large as `other` in every
    /// dimension, and every tag `other` asks for is matched.
    pub fn satisfies(&self, other: &NodeResources) -> bool {
        if self.vcpu + EPSILON < other.vcpu {
            return false;
        }
        if self.memory_gb + EPSILON < other.memory_gb {
            return false;
        }
        if self.disk_gb + EPSILON < other.disk_gb {
            return false;
        }
        if self.bandwidth_gbps + EPSILON < other.bandwidth_gbps {
            return false;
        }
        if other.disk_speed != DiskSpeed::Any && self.disk_speed != other.disk_speed {
            return false;
        }
        if other.storage_type != StorageType::Any && self.storage_type != other.storage_type {
            return false;
        }
        if other.architecture != Architecture::Any && self.architecture != other.architecture {
            return false;
        }
        true
    }

    /// Equal numbers and mutually compatible tags.
    pub fn compatible_with(&self, other: &NodeResources) -> bool {
        self.equal_numbers(other)
            && self.disk_speed.compatible_with(other.disk_speed)
            && self.storage_type.compatible_with(other.storage_type)
            && self.architecture.compatible_with(other.architecture)
    }

    pub fn equal_numbers(&self, other: &NodeResources) -> bool {
        equal(self.vcpu, other.vcpu)
            && equal(self.memory_gb, other.memory_gb)
            && equal(self.disk_gb, other.disk_gb)
            && equal(self.bandwidth_gbps, other.bandwidth_gbps)
    }

    /// Approximate hourly cost, used when ordering custom flavors.
    pub fn cost(&self) -> f64 {
        0.12 * self.vcpu + 0.012 * self.memory_gb + 0.0004 * self.disk_gb
    }

    /// Default ordering of free capacity: memory, then disk, then vcpu, then bandwidth.
    pub fn compare_capacity(a: &NodeResources, b: &NodeResources) -> Ordering {
        a.memory_gb
            .total_cmp(&b.memory_gb)
            .then(a.disk_gb.total_cmp(&b.disk_gb))
            .then(a.vcpu.total_cmp(&b.vcpu))
            .then(a.bandwidth_gbps.total_cmp(&b.bandwidth_gbps))
    }
}

impl fmt::Display for NodeResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[vcpu: {:.1}, memory: {:.1} Gb, disk: {:.1} Gb, bandwidth: {:.1} Gbps, disk speed: {:?}, storage type: {:?}, architecture: {:?}]",
            self.vcpu,
            self.memory_gb,
            self.disk_gb,
            self.bandwidth_gbps,
            self.disk_speed,
            self.storage_type,
            self.architecture
        )
    }
}

fn equal(a: f64, b: f64) -> bool {
    (a - b).abs() < EPSILON
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtract_keeps_left_tags() {
        let host = NodeResources::new(8.0, 32.0, 200.0, 10.0).with_disk_speed(DiskSpeed::Slow);
        let child = NodeResources::new(2.0, 8.0, 50.0, 1.0).just_numbers();

        let free = host.subtract(&child);
        assert_eq!(free.vcpu, 6.0);
        assert_eq!(free.memory_gb, 24.0);
        assert_eq!(free.disk_gb, 150.0);
        assert_eq!(free.disk_speed, DiskSpeed::Slow);
    }

    #[test]
    fn satisfies_checks_numbers_and_requested_tags() {
        let host = NodeResources::new(8.0, 32.0, 200.0, 10.0);
        assert!(host.satisfies(&NodeResources::new(2.0, 8.0, 50.0, 1.0)));
        assert!(!host.satisfies(&NodeResources::new(9.0, 8.0, 50.0, 1.0)));
        assert!(!host.satisfies(&NodeResources::new(2.0, 8.0, 50.0, 1.0).with_disk_speed(DiskSpeed::Slow)));
        assert!(host.satisfies(&NodeResources::new(2.0, 8.0, 50.0, 1.0).with_disk_speed(DiskSpeed::Any)));
    }

    #[test]
    fn compatible_requires_equal_numbers() {
        let a = NodeResources::new(2.0, 8.0, 50.0, 1.0);
        assert!(a.compatible_with(&a.with_disk_speed(DiskSpeed::Any)));
        assert!(!a.compatible_with(&a.with_vcpu(4.0)));
        assert!(!a.compatible_with(&a.with_disk_speed(DiskSpeed::Slow)));
        assert!(a.compatible_with(&a.with_architecture(Architecture::Arm64)));
    }

    #[test]
    fn cost_order_prefers_cheaper_tags() {
        assert_eq!(DiskSpeed::compare_cost(DiskSpeed::Slow, DiskSpeed::Fast), Ordering::Less);
        assert_eq!(DiskSpeed::compare_cost(DiskSpeed::Any, DiskSpeed::Slow), Ordering::Less);
        assert_eq!(StorageType::compare_cost(StorageType::Remote, StorageType::Local), Ordering::Less);
    }

    #[test]
    fn zero_is_zero() {
        assert!(NodeResources::zero().is_zero());
        assert!(!NodeResources::new(0.1, 0.0, 0.0, 0.0).is_zero());
    }
}
