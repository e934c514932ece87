//! nodegrid-state: the node repository.
//!
//! Backed by [redb](https://docs.rs/redb), holds node and load balancer
//! records plus per-zone maps, and hands out immutable [`NodeList`]
//! snapshots to the allocation logic.
//!
//! # Concurrency
//!
//! Reads are lock-free snapshots. Mutations happen while holding locks from
//! a [`Locks`] provider: the owning application's lock, and for unallocated
//! nodes also [`locks::UNALLOCATED_LOCK`]. Writes for one application are
//! grouped in an [`ApplicationTransaction`] and committed in a single redb
//! write transaction.

pub mod cache;
pub mod error;
pub mod locks;
pub mod node_list;
pub mod store;
pub mod tables;
pub mod transaction;
pub mod types;

pub use error::{StateError, StateResult};
pub use locks::{InMemoryLocks, LockGuard, Locks, UNALLOCATED_LOCK, application_lock_path};
pub use node_list::NodeList;
pub use store::StateStore;
pub use transaction::ApplicationTransaction;
pub use types::*;

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
