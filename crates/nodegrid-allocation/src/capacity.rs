//! Host capacity accounting.
//!
//! Free capacity of a host is its advertised resources minus the resources
//! of every child on it. Children only ever come from the same snapshot, so
//! the result is consistent for one allocation pass.

use std::cmp::Ordering;

use nodegrid_core::NodeResources;
use nodegrid_state::{Node, NodeList, NodeState, NodeType};

pub struct HostCapacity<'a> {
    all_nodes: &'a NodeList,
}

impl<'a> HostCapacity<'a> {
    pub fn new(all_nodes: &'a NodeList) -> Self {
        Self { all_nodes }
    }

    /// Resources on `host` not used by its children. With `exclude_inactive`,
    /// inactive and retired children count as gone. Zero for non-hosts.
    pub fn free_capacity_of(&self, host: &Node, exclude_inactive: bool) -> NodeResources {
        if !host.is_host() {
            return NodeResources::zero();
        }
        let host_resources = host.resources();
        self.all_nodes
            .children_of(&host.hostname)
            .filter(|child| !(exclude_inactive && is_inactive_or_retired(child)))
            .fold(host_resources.just_numbers(), |free, child| {
                free.subtract(&child.resources().just_numbers())
            })
            .with_tags_of(host_resources)
    }

    /// Whether `host` can fit a new child needing `requested`.
    pub fn has_capacity(&self, host: &Node, requested: &NodeResources) -> bool {
        self.free_capacity_of(host, false).satisfies(requested) && self.free_ips(host) > 0
    }

    /// Number of addresses in the host's pool not taken by any node.
    pub fn free_ips(&self, host: &Node) -> usize {
        host.ip_config
            .pool
            .iter()
            .filter(|slot| !self.all_nodes.contains(&slot.hostname))
            .count()
    }

    /// The `count` hosts with the most free capacity, kept empty so failed
    /// nodes can be replaced.
    pub fn find_spare_hosts(&self, count: usize) -> Vec<Node> {
        if count == 0 {
            return Vec::new();
        }
        let mut hosts: Vec<&Node> = self
            .all_nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Host)
            .filter(|n| n.state == NodeState::Active)
            .filter(|n| n.reserved_to.is_none())
            .filter(|n| self.free_ips(n) > 0)
            .collect();
        hosts.sort_by(|a, b| self.compare_without_inactive(a, b));
        hosts.into_iter().take(count).cloned().collect()
    }

    /// Most free capacity first, then most free addresses.
    fn compare_without_inactive(&self, a: &Node, b: &Node) -> Ordering {
        NodeResources::compare_capacity(
            &self.free_capacity_of(b, true),
            &self.free_capacity_of(a, true),
        )
        .then_with(|| self.free_ips(b).cmp(&self.free_ips(a)))
    }
}

fn is_inactive_or_retired(node: &Node) -> bool {
    node.state == NodeState::Inactive || node.is_retired()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodegrid_core::{ApplicationId, ClusterId, ClusterMembership, ClusterSpec, ClusterType, DiskSpeed, Flavor};
    use nodegrid_state::IpSlot;
    use semver::Version;

    fn host(hostname: &str, resources: NodeResources, slots: usize) -> Node {
        let pool = (0..slots)
            .map(|i| IpSlot::new(format!("{hostname}-{i}"), format!("10.0.0.{i}")))
            .collect();
        let node = Node::new(hostname, NodeType::Host, Flavor::custom(resources), NodeState::Active, 0);
        let ip_config = node.ip_config.clone().with_pool(pool);
        node.with_ip_config(ip_config)
    }

    fn child(hostname: &str, parent: &Node, resources: NodeResources) -> Node {
        Node::child(hostname, parent, NodeType::Tenant, resources, 0).with_state(NodeState::Active, 0)
    }

    #[test]
    fn free_capacity_subtracts_children_exactly() {
        let h = host("h1", NodeResources::new(8.0, 32.0, 200.0, 10.0).with_disk_speed(DiskSpeed::Slow), 4);
        let requested = NodeResources::new(2.0, 8.0, 50.0, 1.0).with_disk_speed(DiskSpeed::Any);

        let empty = NodeList::new(vec![h.clone()]);
        let capacity = HostCapacity::new(&empty);
        assert!(capacity.has_capacity(&h, &requested));

        let with_child = NodeList::new(vec![h.clone(), child("h1-0", &h, requested)]);
        let capacity = HostCapacity::new(&with_child);
        let free = capacity.free_capacity_of(&h, false);
        assert_eq!(free.vcpu, 6.0);
        assert_eq!(free.memory_gb, 24.0);
        assert_eq!(free.disk_gb, 150.0);
        assert_eq!(free.bandwidth_gbps, 9.0);
        assert_eq!(free.disk_speed, DiskSpeed::Slow);
        assert_eq!(capacity.free_ips(&h), 3);
    }

    #[test]
    fn non_hosts_have_no_capacity() {
        let h = host("h1", NodeResources::new(8.0, 32.0, 200.0, 10.0), 1);
        let c = child("h1-0", &h, NodeResources::new(2.0, 8.0, 50.0, 1.0));
        let list = NodeList::new(vec![h, c.clone()]);
        assert!(HostCapacity::new(&list).free_capacity_of(&c, false).is_zero());
    }

    #[test]
    fn exhausted_address_pool_means_no_capacity() {
        let h = host("h1", NodeResources::new(8.0, 32.0, 200.0, 10.0), 1);
        let list = NodeList::new(vec![h.clone(), child("h1-0", &h, NodeResources::new(1.0, 4.0, 10.0, 1.0))]);
        let capacity = HostCapacity::new(&list);
        assert!(!capacity.has_capacity(&h, &NodeResources::new(1.0, 4.0, 10.0, 1.0)));
    }

    #[test]
    fn inactive_and_retired_children_can_be_excluded() {
        let h = host("h1", NodeResources::new(8.0, 32.0, 200.0, 10.0), 4);
        let cluster = ClusterSpec::request(ClusterType::Container, ClusterId::new("c"), Version::new(8, 0, 0));
        let retired = child("h1-0", &h, NodeResources::new(2.0, 8.0, 50.0, 1.0))
            .allocate(
                ApplicationId::new("t", "a", "i"),
                ClusterMembership::from(cluster, 0),
                NodeResources::new(2.0, 8.0, 50.0, 1.0),
                0,
            )
            .retire();
        let inactive = child("h1-1", &h, NodeResources::new(2.0, 8.0, 50.0, 1.0)).with_state(NodeState::Inactive, 0);
        let list = NodeList::new(vec![h.clone(), retired, inactive]);
        let capacity = HostCapacity::new(&list);
        assert_eq!(capacity.free_capacity_of(&h, false).vcpu, 4.0);
        assert_eq!(capacity.free_capacity_of(&h, true).vcpu, 8.0);
    }

    #[test]
    fn spare_hosts_are_the_emptiest() {
        let big = host("big", NodeResources::new(16.0, 64.0, 400.0, 10.0), 2);
        let small = host("small", NodeResources::new(8.0, 32.0, 200.0, 10.0), 2);
        let full = host("full", NodeResources::new(32.0, 128.0, 800.0, 10.0), 1);
        let list = NodeList::new(vec![
            small.clone(),
            big.clone(),
            full.clone(),
            child("full-0", &full, NodeResources::new(1.0, 4.0, 10.0, 1.0)),
        ]);
        let capacity = HostCapacity::new(&list);

        let spares: Vec<_> = capacity.find_spare_hosts(2).into_iter().map(|h| h.hostname).collect();
        assert_eq!(spares, vec!["big", "small"]);
        assert!(capacity.find_spare_hosts(0).is_empty());
    }
}
