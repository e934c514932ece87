//! nodegrid-core: value types shared by every NodeGrid crate.
//!
//! Resources and flavors describe what a node offers, zones describe where
//! it runs, and application/cluster identities describe who owns it.
//! Nothing in this crate touches storage or performs allocation.

pub mod application;
pub mod cluster;
pub mod config;
pub mod flavor;
pub mod resources;
pub mod zone;

pub use application::ApplicationId;
pub use cluster::{ClusterId, ClusterMembership, ClusterSpec, ClusterType, ZoneEndpoint};
pub use config::ZoneConfig;
pub use flavor::{Flavor, FlavorError, FlavorGraph};
pub use resources::{Architecture, DiskSpeed, NodeResources, StorageType};
pub use zone::{Cloud, CloudAccount, Environment, SystemName, Zone};
