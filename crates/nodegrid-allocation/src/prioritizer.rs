//! Collects every node that could serve an allocation request, in order of
//! preference.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use nodegrid_core::{CloudAccount, NodeResources};
use nodegrid_state::{Node, NodeList, NodeState, NodeType};
use tracing::debug;

use crate::candidate::NodeCandidate;
use crate::capacity::HostCapacity;
use crate::node_spec::NodeSpec;
use crate::params::AllocationParams;

pub struct NodePrioritizer<'a> {
    all_nodes: &'a NodeList,
    capacity: HostCapacity<'a>,
    params: &'a AllocationParams,
    requested: &'a NodeSpec,
    spare_hosts: HashSet<String>,
    is_topology_change: bool,
    current_cluster_size: u32,
    can_allocate_to_spare_hosts: bool,
    can_allocate_new: bool,
}

impl<'a> NodePrioritizer<'a> {
    pub fn new(all_nodes: &'a NodeList, params: &'a AllocationParams, requested: &'a NodeSpec) -> Self {
        let capacity = HostCapacity::new(all_nodes);
        let spare_hosts = capacity
            .find_spare_hosts(params.spare_count)
            .into_iter()
            .map(|host| host.hostname)
            .collect();

        let nodes_in_cluster = all_nodes
            .owner(&params.application)
            .cluster(&params.cluster.id);
        let active = nodes_in_cluster.state(NodeState::Active).not_retired();
        let current_groups: BTreeSet<u32> = active
            .iter()
            .filter_map(|n| n.membership().and_then(|m| m.group()))
            .collect();
        let is_topology_change = current_groups.len() != requested.groups() as usize;
        let current_cluster_size = active.len() as u32;

        let can_allocate_to_spare_hosts =
            params.dynamic_provisioning() || is_replacement(&nodes_in_cluster, requested);
        let can_allocate_new = matches!(requested, NodeSpec::Count(_))
            && (!params.dynamic_provisioning() || !params.exclusive_allocation);

        Self {
            all_nodes,
            capacity,
            params,
            requested,
            spare_hosts,
            is_topology_change,
            current_cluster_size,
            can_allocate_to_spare_hosts,
            can_allocate_new,
        }
    }

    /// All usable candidates, most preferred first.
    pub fn collect(&self) -> Vec<NodeCandidate> {
        let mut candidates = Vec::new();
        self.add_application_nodes(&mut candidates);
        self.add_ready_nodes(&mut candidates);
        self.add_candidates_for_new_nodes(&mut candidates);
        debug!(
            application = %self.params.application,
            cluster = %self.params.cluster.id,
            candidates = candidates.len(),
            topology_change = self.is_topology_change,
            "collected allocation candidates"
        );
        prioritize(candidates)
    }

    pub fn is_topology_change(&self) -> bool {
        self.is_topology_change
    }

    pub fn current_cluster_size(&self) -> u32 {
        self.current_cluster_size
    }

    /// Nodes already allocated to this cluster.
    fn add_application_nodes(&self, candidates: &mut Vec<NodeCandidate>) {
        let states = [NodeState::Active, NodeState::Inactive, NodeState::Reserved];
        for node in self.all_nodes.iter() {
            if node.node_type != self.requested.node_type() || !states.contains(&node.state) {
                continue;
            }
            if node.owner() != Some(&self.params.application) {
                continue;
            }
            if node.membership().is_none_or(|m| m.cluster.id != self.params.cluster.id) {
                continue;
            }
            if node.state != NodeState::Active && !self.can_still_allocate(node) {
                continue;
            }
            let surplus = node.state == NodeState::Active && node.is_retired();
            candidates.push(self.candidate_from(node, surplus));
        }
    }

    /// Ready nodes not allocated to anyone.
    fn add_ready_nodes(&self, candidates: &mut Vec<NodeCandidate>) {
        for node in self.all_nodes.iter() {
            if node.node_type != self.requested.node_type() || node.state != NodeState::Ready {
                continue;
            }
            let candidate = self.candidate_from(node, false);
            if candidate.violates_spares() && !self.can_allocate_to_spare_hosts {
                continue;
            }
            candidates.push(candidate);
        }
    }

    /// Nodes that could be created on existing hosts with room to spare.
    fn add_candidates_for_new_nodes(&self, candidates: &mut Vec<NodeCandidate>) {
        if !self.can_allocate_new {
            return;
        }
        let Some(resources) = self.requested.resources() else {
            return;
        };
        for host in self.all_nodes.iter() {
            if !self.can_allocate_tenant_node_to(host) {
                continue;
            }
            if !self.reservation_allows(host) || !self.dedication_allows(host) {
                continue;
            }
            let violates_spares = self.spare_hosts.contains(&host.hostname);
            if violates_spares && !self.can_allocate_to_spare_hosts {
                continue;
            }
            if !self.capacity.has_capacity(host, &resources) {
                continue;
            }
            let already_on_host = self.all_nodes.children_of(&host.hostname).any(|child| {
                child.owner() == Some(&self.params.application)
                    && child
                        .membership()
                        .is_some_and(|m| m.cluster.id == self.params.cluster.id)
            });
            if already_on_host || !self.cloud_account_matches(host) {
                continue;
            }
            candidates.push(NodeCandidate::new_child(
                resources,
                self.capacity.free_capacity_of(host, false),
                host,
                violates_spares,
            ));
        }
    }

    fn candidate_from(&self, node: &Node, is_surplus: bool) -> NodeCandidate {
        let parent = self.all_nodes.parent_of(node);
        match parent {
            Some(parent) => {
                let free = self.capacity.free_capacity_of(parent, false);
                let is_resizable = self.requested.can_resize(
                    node.resources(),
                    &free,
                    self.params.cluster.cluster_type,
                    self.is_topology_change,
                    self.current_cluster_size,
                );
                NodeCandidate::existing(
                    node.clone(),
                    Some(parent),
                    free,
                    self.spare_hosts.contains(&parent.hostname),
                    is_surplus,
                    is_resizable,
                )
            }
            None => NodeCandidate::existing(node.clone(), None, NodeResources::zero(), false, is_surplus, false),
        }
    }

    /// Whether a non-active node of the application may stay where it is.
    fn can_still_allocate(&self, node: &Node) -> bool {
        if node.node_type != NodeType::Tenant || node.parent_hostname.is_none() {
            return true;
        }
        self.all_nodes
            .parent_of(node)
            .is_some_and(|parent| self.can_allocate_tenant_node_to(parent))
    }

    fn can_allocate_tenant_node_to(&self, host: &Node) -> bool {
        if Some(host.node_type) != self.requested.host_type() || host.node_type != NodeType::Host {
            return false;
        }
        if host.status.want_to_retire || host.is_retired() {
            return false;
        }
        if self.params.dynamic_provisioning() {
            matches!(
                host.state,
                NodeState::Active | NodeState::Ready | NodeState::Provisioned
            )
        } else {
            host.state == NodeState::Active
        }
    }

    /// Hosts reserved to a tenant only take that tenant's non-tester nodes.
    fn reservation_allows(&self, host: &Node) -> bool {
        match &host.reserved_to {
            Some(tenant) => *tenant == self.params.application.tenant && !self.params.application.is_tester(),
            None => true,
        }
    }

    /// Hosts dedicated to another application or cluster type are off limits.
    fn dedication_allows(&self, host: &Node) -> bool {
        if host
            .exclusive_to_application
            .as_ref()
            .is_some_and(|app| *app != self.params.application)
        {
            return false;
        }
        host.exclusive_to_cluster_type
            .is_none_or(|cluster_type| cluster_type == self.params.cluster.cluster_type)
    }

    fn cloud_account_matches(&self, host: &Node) -> bool {
        let zone_account = &self.params.zone.cloud.account;
        let requested: CloudAccount = self.requested.cloud_account().or(zone_account);
        host.cloud_account.or(zone_account) == requested
    }
}

/// Whether the cluster is replacing failed nodes rather than growing.
///
/// Failed nodes are counted both as failing and as failed, so the deficit is
/// deliberately overestimated.
fn is_replacement(nodes_in_cluster: &NodeList, requested: &NodeSpec) -> bool {
    let failed = nodes_in_cluster.failing().len() + nodes_in_cluster.state(NodeState::Failed).len();
    if failed == 0 {
        return false;
    }
    let remaining = nodes_in_cluster.len().saturating_sub(failed) as u32;
    !requested.fulfilled_by(remaining)
}

/// Sort candidates, keeping only the best one per switch on an exclusive switch.
fn prioritize(candidates: Vec<NodeCandidate>) -> Vec<NodeCandidate> {
    let mut by_switch: BTreeMap<String, Vec<NodeCandidate>> = BTreeMap::new();
    let mut nodes = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        match switch_of(&candidate) {
            Some(switch) => by_switch.entry(switch).or_default().push(candidate),
            None => nodes.push(candidate),
        }
    }
    for (_, mut switch_nodes) in by_switch {
        switch_nodes.sort_by(NodeCandidate::compare);
        let mut iter = switch_nodes.into_iter();
        if let Some(best) = iter.next() {
            nodes.push(best);
        }
        nodes.extend(iter.map(|c| c.with_exclusive_switch(false)));
    }
    nodes.sort_by(NodeCandidate::compare);
    nodes
}

fn switch_of(candidate: &NodeCandidate) -> Option<String> {
    candidate
        .parent()
        .or(candidate.node())
        .and_then(|n| n.switch_hostname.clone())
}
