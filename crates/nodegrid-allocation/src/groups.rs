//! Distribution of accepted nodes over the requested groups.

use std::cmp::Ordering;

use nodegrid_core::{Flavor, NodeResources};
use nodegrid_state::{Node, NodeState};

use crate::candidate::NodeCandidate;
use crate::node_spec::NodeSpec;

/// Assigns groups to the nodes accepted for a cluster so that every group
/// ends up with at most `group_size` non-retired nodes.
///
/// Passes run in this order: unretire nodes in groups that are short,
/// place nodes without a usable group, move nodes out of groups that no
/// longer exist, retire surplus nodes, and finally drop every node that
/// still has no valid group.
pub struct GroupAssigner<'a> {
    requested: &'a NodeSpec,
}

impl<'a> GroupAssigner<'a> {
    pub fn new(requested: &'a NodeSpec) -> Self {
        Self { requested }
    }

    pub fn assign_to(&self, candidates: Vec<NodeCandidate>) -> Vec<NodeCandidate> {
        if !matches!(self.requested, NodeSpec::Count(_)) {
            return candidates;
        }
        let mut nodes = candidates;
        let mut count_in_group = self.count_in_each_group(&nodes);

        for i in by_unretiring_priority(&nodes) {
            nodes[i] = self.unretire_in_expanded_group(&nodes[i], &mut count_in_group);
        }
        for i in 0..nodes.len() {
            nodes[i] = self.assign_group_to_new_node(&nodes[i], &mut count_in_group);
        }
        for i in by_unretiring_priority(&nodes) {
            nodes[i] = self.move_out_of_removed_group(&nodes[i], &mut count_in_group);
        }
        for i in by_retiring_priority(&nodes) {
            nodes[i] = self.retire_surplus_in_group(&nodes[i], &mut count_in_group);
        }
        nodes.retain(|c| self.has_valid_group(c));
        nodes
    }

    fn groups(&self) -> u32 {
        self.requested.groups()
    }

    fn count_in_each_group(&self, nodes: &[NodeCandidate]) -> Vec<u32> {
        let mut counts = vec![0; self.groups() as usize];
        for candidate in nodes {
            if candidate.is_retired() {
                continue;
            }
            if let Some(group) = candidate.group().filter(|g| *g < self.groups()) {
                counts[group as usize] += 1;
            }
        }
        counts
    }

    fn unretire_in_expanded_group(&self, candidate: &NodeCandidate, counts: &mut [u32]) -> NodeCandidate {
        if candidate.state() != NodeState::Active || !candidate.is_retired() {
            return candidate.clone();
        }
        let Some(group) = candidate.group().filter(|g| *g < self.groups()) else {
            return candidate.clone();
        };
        if counts[group as usize] >= self.requested.group_size() {
            return candidate.clone();
        }
        if candidate.want_to_retire() || candidate.prefer_to_retire() || candidate.parent_wants_retirement() {
            return candidate.clone();
        }
        if !self.requested.is_compatible(&candidate.flavor()) && !candidate.is_resizable() {
            return candidate.clone();
        }
        let Some(node) = candidate.node() else {
            return candidate.clone();
        };
        let mut node = node.unretire();
        if self.requested.needs_resize(&node) {
            if let Some(resources) = self.requested.resources() {
                node = resized(&node, candidate.parent(), resources);
            }
        }
        counts[group as usize] += 1;
        candidate.with_node(node)
    }

    fn assign_group_to_new_node(&self, candidate: &NodeCandidate, counts: &mut [u32]) -> NodeCandidate {
        let active = candidate.state() == NodeState::Active;
        if active && (candidate.is_retired() || candidate.group().is_some()) {
            return candidate.clone();
        }
        // Already counted where it is.
        if !candidate.is_retired() && candidate.group().is_some_and(|g| g < self.groups()) {
            return candidate.clone();
        }
        self.in_first_group_with_deficiency(candidate, counts)
    }

    fn move_out_of_removed_group(&self, candidate: &NodeCandidate, counts: &mut [u32]) -> NodeCandidate {
        match candidate.group() {
            Some(group) if group >= self.groups() => self.in_first_group_with_deficiency(candidate, counts),
            _ => candidate.clone(),
        }
    }

    fn retire_surplus_in_group(&self, candidate: &NodeCandidate, counts: &mut [u32]) -> NodeCandidate {
        if candidate.is_retired() {
            return candidate.clone();
        }
        let Some(group) = candidate.group().filter(|g| *g < self.groups()) else {
            return candidate.clone();
        };
        if counts[group as usize] <= self.requested.group_size() {
            return candidate.clone();
        }
        let Some(node) = candidate.node() else {
            return candidate.clone();
        };
        counts[group as usize] -= 1;
        candidate.with_node(node.retire())
    }

    fn in_first_group_with_deficiency(&self, candidate: &NodeCandidate, counts: &mut [u32]) -> NodeCandidate {
        let group_size = self.requested.group_size();
        match counts.iter().position(|count| *count < group_size) {
            Some(group) => in_group(group as u32, candidate, counts),
            None => candidate.clone(),
        }
    }

    fn has_valid_group(&self, candidate: &NodeCandidate) -> bool {
        candidate.group().is_some_and(|g| g < self.groups())
    }
}

fn in_group(group: u32, candidate: &NodeCandidate, counts: &mut [u32]) -> NodeCandidate {
    let Some(node) = candidate.node() else {
        return candidate.clone();
    };
    let Some(allocation) = &node.allocation else {
        return candidate.clone();
    };
    if !allocation.membership.retired {
        counts[group as usize] += 1;
    }
    let membership = allocation.membership.with_group(Some(group));
    candidate.with_node(node.with_allocation(allocation.with_membership(membership)))
}

/// Positions of `nodes` with nodes that should stay first: those not wanting
/// to retire, then by membership index.
fn by_unretiring_priority(nodes: &[NodeCandidate]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..nodes.len()).collect();
    order.sort_by(|&a, &b| {
        let (a, b) = (&nodes[a], &nodes[b]);
        a.want_to_retire()
            .cmp(&b.want_to_retire())
            .then_with(|| match (a.membership(), b.membership()) {
                (Some(x), Some(y)) => x.index.cmp(&y.index),
                _ => Ordering::Equal,
            })
    });
    order
}

/// Positions of `nodes`, least preferred first.
fn by_retiring_priority(nodes: &[NodeCandidate]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..nodes.len()).collect();
    order.sort_by(|&a, &b| nodes[b].compare(&nodes[a]));
    order
}

/// `node` with `requested` resources, carrying the storage tags of its host.
pub(crate) fn resized(node: &Node, parent: Option<&Node>, requested: NodeResources) -> Node {
    let resources = match parent {
        Some(parent) => requested.with_tags_of(parent.resources()),
        None => requested,
    };
    node.with_flavor(Flavor::custom(resources))
}
