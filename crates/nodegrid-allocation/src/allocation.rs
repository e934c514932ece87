//! The node allocator: decides which offered candidates a cluster gets.

use std::collections::HashSet;
use std::fmt;

use nodegrid_core::{ClusterMembership, ClusterType, Environment, NodeResources, SystemName};
use nodegrid_state::{Node, NodeList, NodeState};
use tracing::{debug, info};

use crate::candidate::NodeCandidate;
use crate::error::{AllocationError, AllocationResult};
use crate::groups::{GroupAssigner, resized};
use crate::indices::NodeIndices;
use crate::limits::NodeResourceLimits;
use crate::node_spec::NodeSpec;
use crate::params::AllocationParams;

/// Why an accepted node is retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retirement {
    None,
    AlreadyRetired,
    OutsideRealLimits,
    ViolatesParentHostPolicy,
    IncompatibleResources,
    FlavorUpgrade,
    HardRequest,
    SoftRequest,
    ViolatesExclusivity,
    ViolatesHostFlavor,
    ViolatesSpares,
}

impl fmt::Display for Retirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = match self {
            Retirement::None => "not retiring",
            Retirement::AlreadyRetired => "node is already retired",
            Retirement::OutsideRealLimits => "node real resources is outside limits",
            Retirement::ViolatesParentHostPolicy => "node violates parent host policy",
            Retirement::IncompatibleResources => "node resources are incompatible",
            Retirement::FlavorUpgrade => "node should be retired due to flavor upgrade",
            Retirement::HardRequest => "node is requested and required to retire",
            Retirement::SoftRequest => "node is requested to retire",
            Retirement::ViolatesExclusivity => "node violates host exclusivity",
            Retirement::ViolatesHostFlavor => "node violates host flavor",
            Retirement::ViolatesSpares => "node is assigned to a host we want to use as a spare",
        };
        f.write_str(description)
    }
}

/// Hosts that must be provisioned before a request can be fulfilled.
#[derive(Debug, Clone, PartialEq)]
pub struct HostDeficit {
    pub resources: NodeResources,
    pub count: u32,
    /// The whole deficit comes from nodes retired for a host flavor upgrade.
    pub due_to_flavor_upgrade: bool,
}

/// Accumulates the nodes accepted for one cluster request.
///
/// Candidates are offered in preference order. Accepted nodes are kept by
/// hostname in acceptance order; [`final_nodes`](Self::final_nodes) then
/// distributes them over groups.
pub struct NodeAllocation<'a> {
    all_nodes: &'a NodeList,
    params: &'a AllocationParams,
    requested: &'a NodeSpec,
    limits: NodeResourceLimits<'a>,
    indices: NodeIndices,
    probe: bool,
    nodes: Vec<NodeCandidate>,
    indexes: HashSet<u32>,
    /// Accepted non-retired nodes with compatible resources, resizes excluded.
    accepted_and_compatible: u32,
    /// Accepted non-retired nodes that are compatible, possibly after a resize.
    accepted_and_compatible_or_resizable: u32,
    was_retired_just_now: u32,
    was_retired_due_to_flavor_upgrade: u32,
    rejected_due_to_clashing_parent_host: u32,
    rejected_due_to_exclusivity: u32,
    rejected_due_to_insufficient_real_resources: u32,
}

impl<'a> NodeAllocation<'a> {
    /// With `probe`, new membership indices are only reserved speculatively.
    pub fn new(all_nodes: &'a NodeList, params: &'a AllocationParams, requested: &'a NodeSpec, probe: bool) -> Self {
        let used = all_nodes
            .owner(&params.application)
            .cluster(&params.cluster.id)
            .iter()
            .filter_map(|n| n.membership().map(|m| m.index))
            .collect::<Vec<_>>();
        Self {
            all_nodes,
            params,
            requested,
            limits: NodeResourceLimits::new(&params.zone, params.calculator),
            indices: NodeIndices::new(used),
            probe,
            nodes: Vec::new(),
            indexes: HashSet::new(),
            accepted_and_compatible: 0,
            accepted_and_compatible_or_resizable: 0,
            was_retired_just_now: 0,
            was_retired_due_to_flavor_upgrade: 0,
            rejected_due_to_clashing_parent_host: 0,
            rejected_due_to_exclusivity: 0,
            rejected_due_to_insufficient_real_resources: 0,
        }
    }

    /// Offer candidates, most preferred first.
    pub fn offer(&mut self, candidates: &[NodeCandidate]) -> AllocationResult<()> {
        for candidate in candidates {
            if candidate.allocation().is_some() {
                self.offer_allocated(candidate, candidates);
            } else {
                self.offer_fresh(candidate)?;
            }
        }
        if self.probe {
            self.indices.reset_probe();
        }
        Ok(())
    }

    fn offer_allocated(&mut self, candidate: &NodeCandidate, candidates: &[NodeCandidate]) {
        let Some(allocation) = candidate.allocation() else {
            return;
        };
        if allocation.owner != self.params.application {
            return;
        }
        if !allocation.membership.cluster.satisfies(&self.params.cluster) {
            return;
        }
        // Removable active nodes are on their way out.
        if candidate.state() == NodeState::Active && allocation.removable {
            return;
        }
        if self.indexes.contains(&allocation.membership.index) {
            return;
        }
        if self.params.zone.cloud.allow_enclave && candidate.parent().is_some_and(|p| !self.in_requested_account(p)) {
            return;
        }
        let resizable = self.requested.consider_retiring() && candidate.is_resizable();
        let accept = !self.saturated()
            && self.has_compatible_resources(candidate)
            && self.requested.acceptable(candidate);
        if accept || self.accept_incompatible(candidate) {
            let retirement = self.should_retire(candidate, candidates);
            self.accept_node(candidate.clone(), retirement, resizable);
        }
    }

    fn offer_fresh(&mut self, candidate: &NodeCandidate) -> AllocationResult<()> {
        if self.saturated() || !self.has_compatible_resources(candidate) {
            return Ok(());
        }
        if !self
            .limits
            .is_within_real_limits(candidate.resources(), &self.params.application, &self.params.cluster)
        {
            self.rejected_due_to_insufficient_real_resources += 1;
            return Ok(());
        }
        if self.violates_parent_host_policy(candidate) {
            self.rejected_due_to_clashing_parent_host += 1;
            return Ok(());
        }
        if self.violates_exclusivity(candidate) {
            self.rejected_due_to_exclusivity += 1;
            return Ok(());
        }
        if candidate.want_to_retire() {
            return Ok(());
        }
        let index = if self.probe {
            self.indices.probe_next()
        } else {
            self.indices.next()?
        };
        let membership = ClusterMembership::from(self.params.cluster.clone(), index);
        let requested_resources = self.requested.resources().unwrap_or(*candidate.resources());
        let allocated = candidate.allocate(
            &self.params.application,
            membership,
            requested_resources,
            self.all_nodes,
            self.params.now,
        );
        if !allocated.is_valid() {
            debug!(candidate = %allocated, "skipping candidate that could not be created");
            return Ok(());
        }
        self.accept_node(allocated, Retirement::None, false);
        Ok(())
    }

    fn accept_node(&mut self, candidate: NodeCandidate, retirement: Retirement, resizable: bool) {
        let Ok(mut node) = candidate.to_node() else {
            return;
        };
        let Some(allocation) = node.allocation.clone() else {
            return;
        };
        if let Some(resources) = self.requested.resources() {
            node = node.with_allocation(allocation.with_requested_resources(resources));
        }

        match retirement {
            Retirement::None => {
                let retired = node.is_retired();
                let needs_resize = self.requested.needs_resize(&node);
                // Prefer new nodes over unretiring with a resize when deciding saturation.
                if self.can_be_used_in_group_with_deficiency(&node)
                    && !(needs_resize && (retired || !self.requested.consider_retiring()))
                {
                    self.accepted_and_compatible += 1;
                }
                if self.has_compatible_resources(&candidate) {
                    self.accepted_and_compatible_or_resizable += 1;
                }
                if resizable && !retired {
                    if let Some(resources) = self.requested.resources() {
                        node = resized(&node, candidate.parent(), resources);
                    }
                }
                if node.state != NodeState::Active {
                    node = node.unretire();
                    if let Some(allocation) = &node.allocation {
                        node = node.with_allocation(allocation.removable(false));
                    }
                }
            }
            Retirement::AlreadyRetired => {}
            reason => {
                info!(node = %node.hostname, application = %self.params.application, %reason, "retiring node");
                self.was_retired_just_now += 1;
                if reason == Retirement::FlavorUpgrade {
                    self.was_retired_due_to_flavor_upgrade += 1;
                }
                node = node.retire();
            }
        }

        if let Some(allocation) = &node.allocation {
            if allocation.membership.cluster != self.params.cluster {
                let membership = allocation.membership.with_cluster(&self.params.cluster);
                node = node.with_allocation(allocation.with_membership(membership));
            }
        }
        if let Some(membership) = node.membership() {
            self.indexes.insert(membership.index);
        }
        self.nodes.push(candidate.with_node(node));
    }

    fn can_be_used_in_group_with_deficiency(&self, node: &Node) -> bool {
        if self.requested.node_count().is_none() {
            return true;
        }
        let Some(group) = node.membership().and_then(|m| m.group()) else {
            return true;
        };
        let in_group = self.nodes.iter().filter(|c| c.group() == Some(group)).count() as u32;
        in_group < self.requested.group_size()
    }

    /// Whether an active node must be kept even if it no longer fits the request,
    /// so it can be retired before it is replaced.
    fn accept_incompatible(&self, candidate: &NodeCandidate) -> bool {
        if candidate.state() != NodeState::Active {
            return false;
        }
        if candidate.is_retired() {
            return true;
        }
        if !self.requested.consider_retiring() {
            return true;
        }
        self.params.cluster.is_stateful()
            || (self.params.cluster.cluster_type == ClusterType::Container && !self.has_compatible_resources(candidate))
    }

    fn has_compatible_resources(&self, candidate: &NodeCandidate) -> bool {
        self.requested.is_compatible(&candidate.flavor()) || candidate.is_resizable()
    }

    /// The first reason that applies for retiring `candidate`.
    pub fn should_retire(&self, candidate: &NodeCandidate, candidates: &[NodeCandidate]) -> Retirement {
        if !self.requested.consider_retiring() {
            return if candidate.is_retired() {
                Retirement::AlreadyRetired
            } else {
                Retirement::None
            };
        }
        if candidate.is_retired() {
            return Retirement::AlreadyRetired;
        }
        if !self
            .limits
            .is_within_real_limits(candidate.resources(), &self.params.application, &self.params.cluster)
        {
            return Retirement::OutsideRealLimits;
        }
        if self.violates_parent_host_policy(candidate) {
            return Retirement::ViolatesParentHostPolicy;
        }
        if !self.has_compatible_resources(candidate) {
            return Retirement::IncompatibleResources;
        }
        if candidate.parent().is_some_and(|p| p.status.want_to_upgrade_flavor) {
            return Retirement::FlavorUpgrade;
        }
        if candidate.want_to_retire() {
            return Retirement::HardRequest;
        }
        if candidate.prefer_to_retire() && candidate.replaceable_by(candidates) {
            return Retirement::SoftRequest;
        }
        if self.violates_exclusivity(candidate) {
            return Retirement::ViolatesExclusivity;
        }
        if self.violates_host_flavor(candidate) {
            return Retirement::ViolatesHostFlavor;
        }
        if candidate.violates_spares() {
            return Retirement::ViolatesSpares;
        }
        Retirement::None
    }

    /// In main production zones, no two nodes of a cluster share a host.
    fn violates_parent_host_policy(&self, candidate: &NodeCandidate) -> bool {
        let zone = &self.params.zone;
        let check = zone.system == SystemName::Main
            && zone.environment == Environment::Prod
            && !self.params.application.is_tester();
        if !check {
            return false;
        }
        let Some(parent) = candidate.parent_hostname() else {
            return false;
        };
        self.nodes
            .iter()
            .any(|accepted| accepted.hostname() != candidate.hostname() && accepted.parent_hostname() == Some(parent))
    }

    fn violates_exclusivity(&self, candidate: &NodeCandidate) -> bool {
        let Some(parent) = candidate.parent() else {
            return false;
        };
        let application = &self.params.application;
        if parent.exclusive_to_application.as_ref().is_some_and(|a| a != application) {
            return true;
        }
        if parent
            .exclusive_to_cluster_type
            .is_some_and(|t| t != self.params.cluster.cluster_type)
        {
            return true;
        }
        if !self.params.allow_host_sharing() {
            return parent.exclusive_to_application.as_ref() != Some(application);
        }
        if self.params.make_exclusive && self.requested.is_exclusive() {
            if parent.exclusive_to_application.as_ref() == Some(application) {
                return false;
            }
            // Claiming a shared host requires it to be empty and fully used by this node.
            let others_on_host = self
                .all_nodes
                .children_of(&parent.hostname)
                .any(|child| child.hostname.as_str() != candidate.hostname().unwrap_or_default());
            return others_on_host || !parent.resources().compatible_with(candidate.resources());
        }
        // Any exclusive sibling must share our owner.
        self.all_nodes.children_of(&parent.hostname).any(|sibling| {
            sibling.allocation.as_ref().is_some_and(|a| {
                (self.requested.is_exclusive() || a.membership.cluster.exclusive) && a.owner != *application
            })
        })
    }

    fn violates_host_flavor(&self, candidate: &NodeCandidate) -> bool {
        match (&self.params.required_host_flavor, candidate.parent()) {
            (Some(required), Some(parent)) => parent.flavor.name != *required,
            _ => false,
        }
    }

    fn in_requested_account(&self, host: &Node) -> bool {
        let zone_account = &self.params.zone.cloud.account;
        host.cloud_account.or(zone_account) == self.requested.cloud_account().or(zone_account)
    }

    pub fn saturated(&self) -> bool {
        self.requested.saturated_by(self.accepted_and_compatible)
    }

    pub fn fulfilled(&self) -> bool {
        self.requested.fulfilled_by(self.accepted_and_compatible_or_resizable)
    }

    /// Fulfilled without writing anything.
    pub fn fulfilled_and_no_changes(&self) -> bool {
        self.fulfilled() && self.reservable_nodes().is_empty() && self.new_nodes().is_empty()
    }

    /// Hosts to provision for the request to be fulfilled, if any.
    pub fn host_deficit(&self) -> Option<HostDeficit> {
        if self.requested.node_type().is_host() {
            return None;
        }
        let count = self
            .requested
            .fulfilled_deficit_count(self.accepted_and_compatible_or_resizable);
        (count > 0).then(|| HostDeficit {
            resources: self.requested.resources().unwrap_or_else(NodeResources::zero),
            count,
            due_to_flavor_upgrade: count == self.was_retired_due_to_flavor_upgrade,
        })
    }

    pub fn was_retired_just_now(&self) -> u32 {
        self.was_retired_just_now
    }

    /// Assign groups to the accepted nodes and return those that remain.
    pub fn final_nodes(&mut self) -> Vec<NodeCandidate> {
        let accepted = std::mem::take(&mut self.nodes);
        self.nodes = GroupAssigner::new(self.requested).assign_to(accepted);
        self.nodes.clone()
    }

    /// Accepted nodes already in the repository whose records must be written.
    /// Reserved nodes are only included when this pass changed them.
    pub fn reservable_nodes(&self) -> Vec<Node> {
        self.nodes
            .iter()
            .filter(|c| !c.is_new())
            .filter_map(|c| c.node())
            .filter(|node| match node.state {
                NodeState::Inactive | NodeState::Ready => true,
                NodeState::Reserved => self.all_nodes.node(&node.hostname) != Some(*node),
                _ => false,
            })
            .cloned()
            .collect()
    }

    /// Accepted nodes that do not exist in the repository yet.
    pub fn new_nodes(&self) -> Vec<Node> {
        self.nodes
            .iter()
            .filter(|c| c.is_new())
            .filter_map(|c| c.node())
            .cloned()
            .collect()
    }

    pub fn accepted(&self) -> &[NodeCandidate] {
        &self.nodes
    }

    /// Breakdown of what kept the request from being fulfilled.
    pub fn failure_details(&self) -> String {
        let mut reasons = Vec::new();
        if self.rejected_due_to_exclusivity > 0 {
            reasons.push("host exclusivity constraints");
        }
        if self.rejected_due_to_clashing_parent_host > 0 {
            reasons.push("insufficient nodes available on separate physical hosts");
        }
        if self.was_retired_just_now > 0 {
            reasons.push("retirement of allocated nodes");
        }
        if self.rejected_due_to_insufficient_real_resources > 0 {
            reasons.push("insufficient real resources on hosts");
        }
        if reasons.is_empty() {
            return String::new();
        }
        format!(": Not enough suitable nodes available due to {}", reasons.join(", "))
    }

    /// The error to raise when the request is not fulfilled.
    pub fn failure(&self) -> AllocationError {
        AllocationError::NodeAllocation {
            message: format!(
                "Could not satisfy {} in {} {}{}",
                self.requested,
                self.params.application,
                self.params.cluster,
                self.failure_details()
            ),
            retryable: self.was_retired_just_now > 0 || self.params.dynamic_provisioning(),
        }
    }
}
