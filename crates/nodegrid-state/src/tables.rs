//! redb table definitions for the node repository.
//!
//! Every table uses `&str` keys and `&[u8]` values holding JSON.

use redb::TableDefinition;

/// Node records keyed by hostname.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Load balancer records keyed by `{tenant}:{application}:{instance}:{cluster}`.
pub const LOAD_BALANCERS: TableDefinition<&str, &[u8]> = TableDefinition::new("load_balancers");

/// Archive URIs keyed by tenant name.
pub const ARCHIVE_URIS: TableDefinition<&str, &[u8]> = TableDefinition::new("archive_uris");

/// Container images keyed by node type.
pub const DOCKER_IMAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("docker_images");

/// OS version targets keyed by node type.
pub const OS_VERSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("os_versions");

/// Counters and per-application bookkeeping.
pub const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

/// Key of the monotonically increasing host provision index in [`META`].
pub const PROVISION_INDEX_KEY: &str = "provision_index";

/// Key prefix of the last activated generation per application in [`META`].
pub const GENERATION_KEY_PREFIX: &str = "generation/";

/// The shape every table in this module shares.
pub type Table = TableDefinition<'static, &'static str, &'static [u8]>;
