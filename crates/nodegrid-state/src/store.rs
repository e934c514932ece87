//! StateStore: redb-backed node repository.
//!
//! Holds node records, load balancer records and the small per-zone maps
//! (archive URIs, container images, OS version targets). Values are JSON in
//! redb's `&[u8]` columns. Node and load balancer listings are served from a
//! TTL cache that every write invalidates.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use nodegrid_core::ApplicationId;
use redb::{Database, ReadableDatabase, ReadableTable};
use semver::Version;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::cache::TtlCache;
use crate::error::{StateError, StateResult};
use crate::node_list::NodeList;
use crate::tables::*;
use crate::transaction::ApplicationTransaction;
use crate::types::{LoadBalancer, LoadBalancerId, Node, NodeType};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

/// Thread-safe node repository backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    nodes_cache: Arc<TtlCache<NodeList>>,
    load_balancers_cache: Arc<TtlCache<Vec<LoadBalancer>>>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::with_database(db, DEFAULT_CACHE_TTL)?;
        debug!(?path, "node repository opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::with_database(db, DEFAULT_CACHE_TTL)?;
        debug!("in-memory node repository opened");
        Ok(store)
    }

    fn with_database(db: Database, cache_ttl: Duration) -> StateResult<Self> {
        let store = Self {
            db: Arc::new(db),
            nodes_cache: Arc::new(TtlCache::new(cache_ttl)),
            load_balancers_cache: Arc::new(TtlCache::new(cache_ttl)),
        };
        store.ensure_tables()?;
        Ok(store)
    }

    /// This store with listings cached for `ttl` instead of the default.
    pub fn with_cache_ttl(self, ttl: Duration) -> Self {
        Self {
            nodes_cache: Arc::new(TtlCache::new(ttl)),
            load_balancers_cache: Arc::new(TtlCache::new(ttl)),
            ..self
        }
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for table in [NODES, LOAD_BALANCERS, ARCHIVE_URIS, DOCKER_IMAGES, OS_VERSIONS, META] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic access ─────────────────────────────────────────────

    fn put<T: Serialize>(&self, table: Table, key: &str, value: &T) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list<T: DeserializeOwned>(&self, table: Table) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    fn delete(&self, table: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    pub fn put_node(&self, node: &Node) -> StateResult<()> {
        self.put_nodes(std::slice::from_ref(node))
    }

    /// Write all `nodes` in one transaction.
    pub fn put_nodes(&self, nodes: &[Node]) -> StateResult<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            for node in nodes {
                let value = serde_json::to_vec(node).map_err(map_err!(Serialize))?;
                table
                    .insert(node.hostname.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        self.nodes_cache.invalidate();
        debug!(count = nodes.len(), "nodes stored");
        Ok(())
    }

    pub fn get_node(&self, hostname: &str) -> StateResult<Option<Node>> {
        self.get(NODES, hostname)
    }

    /// Node with `hostname`, failing if it does not exist.
    pub fn require_node(&self, hostname: &str) -> StateResult<Node> {
        self.get_node(hostname)?
            .ok_or_else(|| StateError::NotFound(format!("node {hostname}")))
    }

    /// Snapshot of all nodes, possibly up to one cache TTL stale.
    pub fn nodes(&self) -> StateResult<NodeList> {
        let cached = self
            .nodes_cache
            .get_or_load(|| self.list::<Node>(NODES).map(NodeList::new))?;
        Ok(cached.as_ref().clone())
    }

    /// Snapshot of all nodes read directly from the database.
    pub fn nodes_uncached(&self) -> StateResult<NodeList> {
        self.list::<Node>(NODES).map(NodeList::new)
    }

    /// Delete nodes by hostname. Returns how many existed.
    pub fn remove_nodes(&self, hostnames: &[String]) -> StateResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut removed = 0;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            for hostname in hostnames {
                if table
                    .remove(hostname.as_str())
                    .map_err(map_err!(Write))?
                    .is_some()
                {
                    removed += 1;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        self.nodes_cache.invalidate();
        debug!(removed, "nodes removed");
        Ok(removed)
    }

    // ── Load balancers ─────────────────────────────────────────────

    pub fn put_load_balancer(&self, load_balancer: &LoadBalancer) -> StateResult<()> {
        self.put(LOAD_BALANCERS, &load_balancer.id.table_key(), load_balancer)?;
        self.load_balancers_cache.invalidate();
        debug!(id = %load_balancer.id, state = %load_balancer.state, "load balancer stored");
        Ok(())
    }

    pub fn get_load_balancer(&self, id: &LoadBalancerId) -> StateResult<Option<LoadBalancer>> {
        self.get(LOAD_BALANCERS, &id.table_key())
    }

    pub fn load_balancers(&self) -> StateResult<Vec<LoadBalancer>> {
        let cached = self
            .load_balancers_cache
            .get_or_load(|| self.list::<LoadBalancer>(LOAD_BALANCERS))?;
        Ok(cached.as_ref().clone())
    }

    pub fn load_balancers_of(&self, application: &ApplicationId) -> StateResult<Vec<LoadBalancer>> {
        Ok(self
            .load_balancers()?
            .into_iter()
            .filter(|lb| &lb.id.application == application)
            .collect())
    }

    pub fn remove_load_balancer(&self, id: &LoadBalancerId) -> StateResult<bool> {
        let existed = self.delete(LOAD_BALANCERS, &id.table_key())?;
        self.load_balancers_cache.invalidate();
        debug!(%id, existed, "load balancer removed");
        Ok(existed)
    }

    // ── Zone maps ──────────────────────────────────────────────────

    pub fn set_archive_uri(&self, tenant: &str, uri: Option<&str>) -> StateResult<()> {
        match uri {
            Some(uri) => self.put(ARCHIVE_URIS, tenant, &uri),
            None => self.delete(ARCHIVE_URIS, tenant).map(|_| ()),
        }
    }

    pub fn archive_uri(&self, tenant: &str) -> StateResult<Option<String>> {
        self.get(ARCHIVE_URIS, tenant)
    }

    pub fn set_docker_image(&self, node_type: NodeType, image: &str) -> StateResult<()> {
        self.put(DOCKER_IMAGES, node_type.as_str(), &image)
    }

    pub fn docker_image(&self, node_type: NodeType) -> StateResult<Option<String>> {
        self.get(DOCKER_IMAGES, node_type.as_str())
    }

    pub fn set_os_version_target(&self, node_type: NodeType, version: &Version) -> StateResult<()> {
        self.put(OS_VERSIONS, node_type.as_str(), version)
    }

    pub fn os_version_target(&self, node_type: NodeType) -> StateResult<Option<Version>> {
        self.get(OS_VERSIONS, node_type.as_str())
    }

    // ── Counters ───────────────────────────────────────────────────

    /// Reserve `count` fresh host provision indices. Indices are never reused.
    pub fn next_provision_indices(&self, count: usize) -> StateResult<Vec<u64>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let first;
        {
            let mut table = txn.open_table(META).map_err(map_err!(Table))?;
            first = match table.get(PROVISION_INDEX_KEY).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice::<u64>(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => 1,
            };
            let next = first + count as u64;
            let value = serde_json::to_vec(&next).map_err(map_err!(Serialize))?;
            table
                .insert(PROVISION_INDEX_KEY, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok((first..first + count as u64).collect())
    }

    /// Generation of the last committed activation of `application`.
    pub fn activated_generation(&self, application: &ApplicationId) -> StateResult<Option<u64>> {
        self.get(META, &generation_key(application))
    }

    // ── Transactions ───────────────────────────────────────────────

    /// Apply all writes of `transaction` atomically, then release its lock.
    pub fn commit(&self, transaction: ApplicationTransaction) -> StateResult<()> {
        if transaction.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
            for node in transaction.nodes() {
                let value = serde_json::to_vec(node).map_err(map_err!(Serialize))?;
                nodes
                    .insert(node.hostname.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            for hostname in transaction.removed_nodes() {
                nodes.remove(hostname.as_str()).map_err(map_err!(Write))?;
            }

            let mut load_balancers = txn.open_table(LOAD_BALANCERS).map_err(map_err!(Table))?;
            for lb in transaction.load_balancers() {
                let value = serde_json::to_vec(lb).map_err(map_err!(Serialize))?;
                load_balancers
                    .insert(lb.id.table_key().as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }

            if let Some(generation) = transaction.generation() {
                let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
                let value = serde_json::to_vec(&generation).map_err(map_err!(Serialize))?;
                meta.insert(
                    generation_key(transaction.application()).as_str(),
                    value.as_slice(),
                )
                .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        self.nodes_cache.invalidate();
        self.load_balancers_cache.invalidate();
        info!(
            application = %transaction.application(),
            nodes = transaction.nodes().len(),
            removed = transaction.removed_nodes().len(),
            load_balancers = transaction.load_balancers().len(),
            "application transaction committed"
        );
        Ok(())
    }
}

fn generation_key(application: &ApplicationId) -> String {
    format!("{GENERATION_KEY_PREFIX}{}", application.serialized_form())
}
