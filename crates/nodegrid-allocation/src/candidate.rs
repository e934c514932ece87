//! Node candidates: nodes that exist, nodes that could be created on a host,
//! and nodes that turned out not to be creatable.
//!
//! Candidates are immutable. Allocation decisions produce new candidates via
//! [`NodeCandidate::with_node`] rather than mutating in place.

use std::cmp::Ordering;
use std::fmt;

use nodegrid_core::{
    ApplicationId, ClusterMembership, DiskSpeed, Flavor, NodeResources, StorageType,
};
use nodegrid_state::{Allocation, IpConfig, Node, NodeList, NodeState, NodeType};

use crate::error::{AllocationError, AllocationResult};

#[derive(Debug, Clone)]
pub enum CandidateKind {
    /// Backed by a node record.
    Concrete(Node),
    /// A node that would be created on the candidate's parent.
    Virtual,
    /// A node that could not be created, with the reason.
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct NodeCandidate {
    kind: CandidateKind,
    node_type: NodeType,
    resources: NodeResources,
    parent: Option<Node>,
    /// Free capacity of the parent, before this candidate is added to it.
    free_parent_capacity: NodeResources,
    violates_spares: bool,
    exclusive_switch: bool,
    is_surplus: bool,
    /// Not yet known to the repository.
    is_new: bool,
    is_resizable: bool,
}

impl NodeCandidate {
    /// A candidate for a node that exists in the repository.
    pub fn existing(
        node: Node,
        parent: Option<&Node>,
        free_parent_capacity: NodeResources,
        violates_spares: bool,
        is_surplus: bool,
        is_resizable: bool,
    ) -> Self {
        Self {
            node_type: node.node_type,
            resources: *node.resources(),
            kind: CandidateKind::Concrete(node),
            parent: parent.cloned(),
            free_parent_capacity,
            violates_spares,
            exclusive_switch: true,
            is_surplus,
            is_new: false,
            is_resizable,
        }
    }

    /// A candidate for a node of `resources` that could be created on `parent`.
    pub fn new_child(
        resources: NodeResources,
        free_parent_capacity: NodeResources,
        parent: &Node,
        violates_spares: bool,
    ) -> Self {
        Self {
            kind: CandidateKind::Virtual,
            node_type: NodeType::Tenant,
            resources,
            parent: Some(parent.clone()),
            free_parent_capacity,
            violates_spares,
            exclusive_switch: true,
            is_surplus: false,
            is_new: true,
            is_resizable: false,
        }
    }

    /// A candidate for the child generated together with a freshly provisioned host.
    pub fn new_exclusive_child(node: Node, parent: &Node) -> Self {
        Self {
            node_type: node.node_type,
            resources: *node.resources(),
            kind: CandidateKind::Concrete(node),
            free_parent_capacity: *parent.resources(),
            parent: Some(parent.clone()),
            violates_spares: false,
            exclusive_switch: true,
            is_surplus: false,
            is_new: true,
            is_resizable: false,
        }
    }

    pub fn kind(&self) -> &CandidateKind {
        &self.kind
    }

    pub fn node(&self) -> Option<&Node> {
        match &self.kind {
            CandidateKind::Concrete(node) => Some(node),
            _ => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self.kind, CandidateKind::Invalid(_))
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn hostname(&self) -> Option<&str> {
        self.node().map(|n| n.hostname.as_str())
    }

    /// State of the node; candidates not yet created would be reserved.
    pub fn state(&self) -> NodeState {
        self.node().map_or(NodeState::Reserved, |n| n.state)
    }

    pub fn allocation(&self) -> Option<&Allocation> {
        self.node().and_then(|n| n.allocation.as_ref())
    }

    pub fn membership(&self) -> Option<&ClusterMembership> {
        self.allocation().map(|a| &a.membership)
    }

    pub fn group(&self) -> Option<u32> {
        self.membership().and_then(ClusterMembership::group)
    }

    pub fn is_retired(&self) -> bool {
        self.membership().is_some_and(|m| m.retired)
    }

    pub fn resources(&self) -> &NodeResources {
        &self.resources
    }

    pub fn flavor(&self) -> Flavor {
        match &self.kind {
            CandidateKind::Concrete(node) => node.flavor.clone(),
            _ => Flavor::custom(self.resources),
        }
    }

    pub fn parent(&self) -> Option<&Node> {
        self.parent.as_ref()
    }

    pub fn parent_hostname(&self) -> Option<&str> {
        self.parent.as_ref().map(|p| p.hostname.as_str())
    }

    pub fn free_parent_capacity(&self) -> &NodeResources {
        &self.free_parent_capacity
    }

    pub fn violates_spares(&self) -> bool {
        self.violates_spares
    }

    pub fn exclusive_switch(&self) -> bool {
        self.exclusive_switch
    }

    pub fn is_surplus(&self) -> bool {
        self.is_surplus
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn is_resizable(&self) -> bool {
        self.is_resizable
    }

    pub fn want_to_retire(&self) -> bool {
        self.node().is_some_and(|n| n.status.want_to_retire)
    }

    pub fn prefer_to_retire(&self) -> bool {
        self.node().is_some_and(|n| n.status.prefer_to_retire)
    }

    pub fn parent_wants_retirement(&self) -> bool {
        self.parent
            .as_ref()
            .is_some_and(|p| p.status.want_to_retire || p.status.prefer_to_retire)
    }

    /// The node of this candidate. Fails unless the candidate is concrete.
    pub fn to_node(&self) -> AllocationResult<Node> {
        match &self.kind {
            CandidateKind::Concrete(node) => Ok(node.clone()),
            CandidateKind::Virtual => Err(AllocationError::InvalidCandidate(format!(
                "candidate on {} has no node yet",
                self.parent_hostname().unwrap_or("no host")
            ))),
            CandidateKind::Invalid(reason) => Err(AllocationError::InvalidCandidate(reason.clone())),
        }
    }

    /// This candidate backed by `node` instead.
    pub fn with_node(&self, node: Node) -> Self {
        Self {
            resources: *node.resources(),
            kind: CandidateKind::Concrete(node),
            ..self.clone()
        }
    }

    pub fn with_exclusive_switch(&self, exclusive_switch: bool) -> Self {
        Self {
            exclusive_switch,
            ..self.clone()
        }
    }

    /// Turn a virtual candidate into a concrete one by claiming the first
    /// unused address slot on its parent. Other kinds are returned as is.
    pub fn materialize(&self, all_nodes: &NodeList, now: u64) -> Self {
        if !matches!(self.kind, CandidateKind::Virtual) {
            return self.clone();
        }
        let Some(parent) = &self.parent else {
            return self.invalid("virtual candidate without a host".to_string());
        };
        let Some(slot) = parent
            .ip_config
            .pool
            .iter()
            .find(|slot| !all_nodes.contains(&slot.hostname))
        else {
            return self.invalid(format!("no free address left on {}", parent.hostname));
        };
        let node = Node::child(slot.hostname.clone(), parent, self.node_type, self.resources, now)
            .with_ip_config(IpConfig::default().with_primary(vec![slot.address.clone()]));
        self.with_node(node)
    }

    /// Materialize this candidate and allocate it to `owner`.
    pub fn allocate(
        &self,
        owner: &ApplicationId,
        membership: ClusterMembership,
        requested: NodeResources,
        all_nodes: &NodeList,
        now: u64,
    ) -> Self {
        let candidate = self.materialize(all_nodes, now);
        match &candidate.kind {
            CandidateKind::Concrete(node) => {
                candidate.with_node(node.allocate(owner.clone(), membership, requested, now))
            }
            _ => candidate,
        }
    }

    fn invalid(&self, reason: String) -> Self {
        Self {
            kind: CandidateKind::Invalid(reason),
            ..self.clone()
        }
    }

    /// Whether one of the offered reserved candidates could take this node's place.
    pub fn replaceable_by(&self, candidates: &[NodeCandidate]) -> bool {
        candidates.iter().any(|c| {
            c.state() == NodeState::Reserved
                && c.is_valid()
                && (c.hostname().is_none() || c.hostname() != self.hostname())
                && !c.want_to_retire()
                && !c.prefer_to_retire()
                && c.resources.satisfies(&self.resources.just_numbers())
        })
    }

    /// Allocation skew of the parent after adding this node, minus the skew before.
    pub fn skew_increase(&self) -> f64 {
        self.skew_with(&self.resources) - self.skew_with(&NodeResources::zero())
    }

    fn skew_with(&self, resources: &NodeResources) -> f64 {
        let Some(parent) = &self.parent else {
            return 0.0;
        };
        let free = self
            .free_parent_capacity
            .just_numbers()
            .subtract(&resources.just_numbers());
        skew(parent.resources(), &free)
    }

    fn is_in_repo_and_reserved(&self) -> bool {
        !self.is_new && self.state() == NodeState::Reserved
    }

    fn less_than_half_the_host(&self) -> bool {
        let Some(parent) = &self.parent else {
            return false;
        };
        let host = parent.resources();
        let node = &self.resources;
        host.vcpu >= node.vcpu * 2.0
            && host.memory_gb >= node.memory_gb * 2.0
            && host.disk_gb >= node.disk_gb * 2.0
    }

    fn host_state_priority(&self) -> i32 {
        match &self.parent {
            Some(parent) => match parent.state {
                NodeState::Provisioned => 0,
                NodeState::Ready => 1,
                NodeState::Active => 2,
                _ => -1,
            },
            None => -2,
        }
    }

    /// Preference order: the most preferred candidate compares as smallest.
    /// Each rule only applies when all previous rules tie.
    pub fn compare(&self, other: &NodeCandidate) -> Ordering {
        prefer(self.is_valid(), other.is_valid())
            .then_with(|| prefer(!self.violates_spares, !other.violates_spares))
            .then_with(|| {
                prefer(
                    self.state() == NodeState::Active,
                    other.state() == NodeState::Active,
                )
            })
            .then_with(|| prefer(!self.is_surplus, !other.is_surplus))
            .then_with(|| prefer(self.is_in_repo_and_reserved(), other.is_in_repo_and_reserved()))
            .then_with(|| prefer(!self.prefer_to_retire(), !other.prefer_to_retire()))
            .then_with(|| {
                prefer(
                    self.state() == NodeState::Inactive,
                    other.state() == NodeState::Inactive,
                )
            })
            .then_with(|| {
                prefer(
                    self.state() == NodeState::Ready,
                    other.state() == NodeState::Ready,
                )
            })
            .then_with(|| self.compare_parents(other))
            .then_with(|| self.skew_increase().total_cmp(&other.skew_increase()))
            .then_with(|| self.flavor().cost.cmp(&other.flavor().cost))
            .then_with(|| other.host_state_priority().cmp(&self.host_state_priority()))
            .then_with(|| match (self.membership(), other.membership()) {
                (Some(a), Some(b)) => a.index.cmp(&b.index),
                _ => Ordering::Equal,
            })
            .then_with(|| other.parent_os_version().cmp(&self.parent_os_version()))
    }

    fn compare_parents(&self, other: &NodeCandidate) -> Ordering {
        let (Some(a), Some(b)) = (&self.parent, &other.parent) else {
            return Ordering::Equal;
        };
        prefer(a.reserved_to.is_some(), b.reserved_to.is_some())
            .then_with(|| prefer(self.exclusive_switch, other.exclusive_switch))
            .then_with(|| DiskSpeed::compare_cost(a.resources().disk_speed, b.resources().disk_speed))
            .then_with(|| {
                StorageType::compare_cost(a.resources().storage_type, b.resources().storage_type)
            })
            .then_with(|| prefer(self.less_than_half_the_host(), other.less_than_half_the_host()))
    }

    fn parent_os_version(&self) -> Option<&semver::Version> {
        self.parent
            .as_ref()
            .and_then(|p| p.status.current_os_version.as_ref())
    }
}

impl fmt::Display for NodeCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            CandidateKind::Concrete(node) => write!(f, "{node}"),
            CandidateKind::Virtual => write!(
                f,
                "new node with {} on {}",
                self.resources,
                self.parent_hostname().unwrap_or("no host")
            ),
            CandidateKind::Invalid(reason) => write!(f, "invalid candidate: {reason}"),
        }
    }
}

/// Orders `true` before `false`.
fn prefer(a: bool, b: bool) -> Ordering {
    b.cmp(&a)
}

/// Standard deviation of the allocated fraction of vcpu, memory and disk on a host.
pub fn skew(total: &NodeResources, free: &NodeResources) -> f64 {
    let all = total.just_numbers();
    let allocated = all.subtract(&free.just_numbers());
    let fractions = [
        fraction(allocated.vcpu, all.vcpu),
        fraction(allocated.memory_gb, all.memory_gb),
        fraction(allocated.disk_gb, all.disk_gb),
    ];
    let mean = fractions.iter().sum::<f64>() / fractions.len() as f64;
    let variance = fractions.iter().map(|f| (f - mean).powi(2)).sum::<f64>() / fractions.len() as f64;
    variance.sqrt()
}

fn fraction(part: f64, whole: f64) -> f64 {
    if whole <= 0.0 { 0.0 } else { part / whole }
}
