//! Writes to one application's nodes and load balancers, committed together.

use nodegrid_core::ApplicationId;

use crate::locks::LockGuard;
use crate::types::{LoadBalancer, Node};

/// Pending writes for one application, holding that application's lock.
///
/// Nothing is written until the transaction is passed to
/// [`crate::StateStore::commit`]; dropping it discards the writes and
/// releases the lock.
#[derive(Debug)]
pub struct ApplicationTransaction {
    application: ApplicationId,
    lock: LockGuard,
    nodes: Vec<Node>,
    removed_nodes: Vec<String>,
    load_balancers: Vec<LoadBalancer>,
    generation: Option<u64>,
}

impl ApplicationTransaction {
    pub fn new(application: ApplicationId, lock: LockGuard) -> Self {
        Self {
            application,
            lock,
            nodes: Vec::new(),
            removed_nodes: Vec::new(),
            load_balancers: Vec::new(),
            generation: None,
        }
    }

    pub fn application(&self) -> &ApplicationId {
        &self.application
    }

    pub fn lock(&self) -> &LockGuard {
        &self.lock
    }

    /// Write `nodes`, replacing any earlier pending write of the same hostname.
    pub fn put_nodes(&mut self, nodes: impl IntoIterator<Item = Node>) {
        for node in nodes {
            self.nodes.retain(|n| n.hostname != node.hostname);
            self.nodes.push(node);
        }
    }

    pub fn remove_node(&mut self, hostname: impl Into<String>) {
        self.removed_nodes.push(hostname.into());
    }

    pub fn put_load_balancer(&mut self, load_balancer: LoadBalancer) {
        self.load_balancers.retain(|lb| lb.id != load_balancer.id);
        self.load_balancers.push(load_balancer);
    }

    pub fn set_generation(&mut self, generation: u64) {
        self.generation = Some(generation);
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn removed_nodes(&self) -> &[String] {
        &self.removed_nodes
    }

    pub fn load_balancers(&self) -> &[LoadBalancer] {
        &self.load_balancers
    }

    pub fn generation(&self) -> Option<u64> {
        self.generation
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
            && self.removed_nodes.is_empty()
            && self.load_balancers.is_empty()
            && self.generation.is_none()
    }
}
