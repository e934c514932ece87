//! Two-phase preparation of a cluster's nodes.
//!
//! The allocation first runs against a cached snapshot without taking any
//! lock. If that probe finds the request already fulfilled with nothing to
//! write, its result is returned as is. Otherwise the allocation is redone
//! under the application lock and the unallocated-node lock, against a
//! fresh snapshot, and the outcome is persisted.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use nodegrid_allocation::{
    AllocationError, AllocationParams, HostDeficit, NodeAllocation, NodeCandidate,
    NodePrioritizer, NodeSpec, next_host_indices,
};
use nodegrid_state::{
    Locks, Node, NodeList, NodeState, NodeType, StateStore, Status, UNALLOCATED_LOCK,
    application_lock_path,
};
use tracing::{debug, error, info, warn};

use crate::error::ProvisionResult;
use crate::host_provisioner::{HostProvisionRequest, HostProvisioner, ProvisionedHost};

/// Outcome of an unlocked allocation pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The request is fulfilled by these nodes as they are stored.
    Unchanged(Vec<Node>),
    /// Something must be written; allocate again under lock.
    Changes,
}

pub struct Preparer {
    store: StateStore,
    locks: Arc<dyn Locks>,
    lock_timeout: Duration,
    host_provisioner: Option<Arc<dyn HostProvisioner>>,
    own_hostname: Option<String>,
}

impl Preparer {
    pub fn new(
        store: StateStore,
        locks: Arc<dyn Locks>,
        lock_timeout: Duration,
        host_provisioner: Option<Arc<dyn HostProvisioner>>,
    ) -> Self {
        Self {
            store,
            locks,
            lock_timeout,
            host_provisioner,
            own_hostname: None,
        }
    }

    /// The host this allocator runs on, kept out of infrastructure host indices.
    pub fn with_own_hostname(mut self, hostname: Option<String>) -> Self {
        self.own_hostname = hostname;
        self
    }

    /// Nodes for `requested`, reserved in the repository. The caller must
    /// not hold the application lock.
    pub fn prepare(&self, params: &AllocationParams, requested: &NodeSpec) -> ProvisionResult<Vec<Node>> {
        match self.probe(params, requested)? {
            Decision::Unchanged(nodes) => {
                debug!(
                    application = %params.application,
                    cluster = %params.cluster.id,
                    nodes = nodes.len(),
                    "request already fulfilled"
                );
                Ok(nodes)
            }
            Decision::Changes => self.commit(params, requested),
        }
    }

    /// Allocate against a possibly stale snapshot, writing nothing.
    pub fn probe(&self, params: &AllocationParams, requested: &NodeSpec) -> ProvisionResult<Decision> {
        let all_nodes = self.store.nodes()?;
        let candidates = NodePrioritizer::new(&all_nodes, params, requested).collect();
        let mut allocation = NodeAllocation::new(&all_nodes, params, requested, true);
        allocation.offer(&candidates)?;
        let final_nodes = allocation.final_nodes();
        if !allocation.fulfilled_and_no_changes() {
            return Ok(Decision::Changes);
        }
        Ok(Decision::Unchanged(
            final_nodes.iter().filter_map(|c| c.node().cloned()).collect(),
        ))
    }

    /// Allocate under lock and persist the result.
    pub fn commit(&self, params: &AllocationParams, requested: &NodeSpec) -> ProvisionResult<Vec<Node>> {
        let _application_lock = self
            .locks
            .lock(&application_lock_path(&params.application), self.lock_timeout)?;
        let _unallocated_lock = self.locks.lock(UNALLOCATED_LOCK, self.lock_timeout)?;
        self.allocate_locked(params, requested)
    }

    fn allocate_locked(&self, params: &AllocationParams, requested: &NodeSpec) -> ProvisionResult<Vec<Node>> {
        let all_nodes = self.store.nodes_uncached()?;
        let candidates = NodePrioritizer::new(&all_nodes, params, requested).collect();
        let mut allocation = NodeAllocation::new(&all_nodes, params, requested, false);
        allocation.offer(&candidates)?;

        if let Some(deficit) = allocation.host_deficit() {
            if let (true, Some(provisioner)) = (params.dynamic_provisioning(), &self.host_provisioner) {
                let provisioned =
                    self.provision_hosts(provisioner.as_ref(), &all_nodes, params, requested, &deficit)?;
                allocation.offer(&provisioned)?;
            }
        }

        if !allocation.fulfilled() && requested.can_fail() {
            if allocation.was_retired_just_now() > 0 && requested.consider_retiring() {
                warn!(
                    application = %params.application,
                    cluster = %params.cluster.id,
                    retired = allocation.was_retired_just_now(),
                    "no capacity to replace retiring nodes, preparing without retirement"
                );
                return self.allocate_locked(params, &requested.without_retiring());
            }
            return Err(allocation.failure().into());
        }

        let final_nodes = allocation.final_nodes();
        let mut writes: Vec<Node> = allocation
            .reservable_nodes()
            .into_iter()
            .map(|node| match node.state {
                NodeState::Reserved => node,
                _ => node.with_state(NodeState::Reserved, params.now),
            })
            .collect();
        let new_nodes = allocation.new_nodes();
        let (reserved, added) = (writes.len(), new_nodes.len());
        writes.extend(new_nodes);
        writes.extend(hosts_to_make_exclusive(&all_nodes, params, &final_nodes));
        self.store.put_nodes(&writes)?;
        if !writes.is_empty() {
            info!(
                application = %params.application,
                cluster = %params.cluster.id,
                reserved,
                added,
                "nodes reserved"
            );
        }

        let written: HashMap<&str, &Node> = writes.iter().map(|n| (n.hostname.as_str(), n)).collect();
        Ok(final_nodes
            .iter()
            .filter_map(|c| c.node())
            .map(|node| written.get(node.hostname.as_str()).map_or_else(|| node.clone(), |n| (*n).clone()))
            .collect())
    }

    /// Create hosts covering `deficit` and return candidates for their children.
    fn provision_hosts(
        &self,
        provisioner: &dyn HostProvisioner,
        all_nodes: &NodeList,
        params: &AllocationParams,
        requested: &NodeSpec,
        deficit: &HostDeficit,
    ) -> ProvisionResult<Vec<NodeCandidate>> {
        let Some(host_type) = requested.host_type() else {
            return Err(AllocationError::IllegalRequest(format!(
                "cannot provision hosts for {} nodes",
                requested.node_type()
            ))
            .into());
        };
        let count = deficit.count as usize;
        let indices = if host_type == NodeType::Host {
            self.store.next_provision_indices(count)?
        } else {
            let existing = all_nodes.node_type(host_type);
            next_host_indices(
                existing.iter().map(|n| n.hostname.as_str()),
                self.own_hostname.as_deref(),
                count,
            )
            .into_iter()
            .map(u64::from)
            .collect()
        };
        if indices.is_empty() {
            debug!(%host_type, "no host index left to provision");
            return Ok(Vec::new());
        }
        let request = HostProvisionRequest {
            indices,
            host_type,
            resources: deficit.resources,
            owner: params.application.clone(),
            cluster_type: params.cluster.cluster_type,
            exclusive: params.exclusive_allocation,
            cloud_account: requested.cloud_account().or(&params.zone.cloud.account),
            os_version: self.store.os_version_target(host_type)?,
            upgrade_flavor: deficit.due_to_flavor_upgrade,
        };
        info!(
            application = %params.application,
            cluster = %params.cluster.id,
            count = request.count(),
            %host_type,
            resources = %deficit.resources,
            "provisioning hosts"
        );

        let mut written: Vec<Node> = Vec::new();
        let mut candidates = Vec::new();
        let result = provisioner.provision_hosts(
            &request,
            &mut |hosts: Vec<ProvisionedHost>| -> ProvisionResult<()> {
                let nodes: Vec<Node> = hosts.iter().map(|h| h.host.clone()).collect();
                self.store.put_nodes(&nodes)?;
                for node in &nodes {
                    info!(hostname = %node.hostname, flavor = %node.flavor, "host provisioned");
                }
                written.extend(nodes);
                candidates.extend(
                    hosts
                        .into_iter()
                        .map(|h| NodeCandidate::new_exclusive_child(h.child, &h.host)),
                );
                Ok(())
            },
        );
        if let Err(e) = result {
            warn!(error = %e, written = written.len(), "host provisioning failed");
            self.mark_for_deprovisioning(&written);
            return Err(e);
        }
        Ok(candidates)
    }

    /// Hosts may already be referenced by other allocators, so they are
    /// flagged for the deprovisioner instead of being deleted here.
    fn mark_for_deprovisioning(&self, hosts: &[Node]) {
        if hosts.is_empty() {
            return;
        }
        let marked: Vec<Node> = hosts
            .iter()
            .map(|host| {
                host.with_status(Status {
                    want_to_retire: true,
                    want_to_deprovision: true,
                    ..host.status.clone()
                })
            })
            .collect();
        match self.store.put_nodes(&marked) {
            Ok(()) => info!(hosts = marked.len(), "marked hosts for deprovisioning"),
            Err(e) => error!(error = %e, "could not mark hosts for deprovisioning"),
        }
    }
}

/// Hosts of `final_nodes` to dedicate to the application.
fn hosts_to_make_exclusive(
    all_nodes: &NodeList,
    params: &AllocationParams,
    final_nodes: &[NodeCandidate],
) -> Vec<Node> {
    if !(params.make_exclusive && params.exclusive_allocation) {
        return Vec::new();
    }
    let mut hosts = BTreeMap::new();
    for candidate in final_nodes {
        let Some(host) = candidate.parent_hostname().and_then(|h| all_nodes.node(h)) else {
            continue;
        };
        if host.exclusive_to_application.is_none() {
            hosts.insert(
                host.hostname.clone(),
                host.with_exclusive_to(
                    Some(params.application.clone()),
                    Some(params.cluster.cluster_type),
                ),
            );
        }
    }
    hosts.into_values().collect()
}
