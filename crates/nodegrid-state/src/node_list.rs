//! Immutable snapshots of the node repository.
//!
//! A [`NodeList`] owns its nodes in a flat vector and records containment
//! as indices into that vector (host position → child positions), so a
//! snapshot can be filtered and cloned without any back-references.

use std::collections::HashMap;
use std::sync::Arc;

use nodegrid_core::{ApplicationId, ClusterId, ClusterType};

use crate::types::{Node, NodeState, NodeType};

#[derive(Debug, Clone, Default)]
pub struct NodeList {
    nodes: Arc<Vec<Node>>,
    by_hostname: Arc<HashMap<String, usize>>,
    children: Arc<HashMap<usize, Vec<usize>>>,
}

impl NodeList {
    pub fn new(nodes: Vec<Node>) -> Self {
        let by_hostname: HashMap<String, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (node.hostname.clone(), i))
            .collect();
        let mut children: HashMap<usize, Vec<usize>> = HashMap::new();
        for (i, node) in nodes.iter().enumerate() {
            if let Some(parent) = node.parent_hostname.as_ref().and_then(|p| by_hostname.get(p)) {
                children.entry(*parent).or_default().push(i);
            }
        }
        Self {
            nodes: Arc::new(nodes),
            by_hostname: Arc::new(by_hostname),
            children: Arc::new(children),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn first(&self) -> Option<&Node> {
        self.nodes.first()
    }

    pub fn to_vec(&self) -> Vec<Node> {
        self.nodes.as_ref().clone()
    }

    pub fn node(&self, hostname: &str) -> Option<&Node> {
        self.by_hostname.get(hostname).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, hostname: &str) -> bool {
        self.by_hostname.contains_key(hostname)
    }

    /// Children of `hostname` present in this list.
    pub fn children_of(&self, hostname: &str) -> impl Iterator<Item = &Node> {
        self.by_hostname
            .get(hostname)
            .and_then(|i| self.children.get(i))
            .into_iter()
            .flatten()
            .map(|&i| &self.nodes[i])
    }

    pub fn parent_of(&self, node: &Node) -> Option<&Node> {
        node.parent_hostname.as_deref().and_then(|p| self.node(p))
    }

    pub fn matching(&self, predicate: impl Fn(&Node) -> bool) -> NodeList {
        NodeList::new(self.nodes.iter().filter(|n| predicate(n)).cloned().collect())
    }

    pub fn owner(&self, application: &ApplicationId) -> NodeList {
        self.matching(|n| n.owner() == Some(application))
    }

    pub fn cluster(&self, cluster: &ClusterId) -> NodeList {
        self.matching(|n| n.membership().is_some_and(|m| &m.cluster.id == cluster))
    }

    pub fn cluster_type(&self, cluster_type: ClusterType) -> NodeList {
        self.matching(|n| n.membership().is_some_and(|m| m.cluster.cluster_type == cluster_type))
    }

    pub fn state(&self, state: NodeState) -> NodeList {
        self.matching(|n| n.state == state)
    }

    pub fn states(&self, states: &[NodeState]) -> NodeList {
        self.matching(|n| states.contains(&n.state))
    }

    pub fn node_type(&self, node_type: NodeType) -> NodeList {
        self.matching(|n| n.node_type == node_type)
    }

    pub fn hosts(&self) -> NodeList {
        self.matching(Node::is_host)
    }

    pub fn retired(&self) -> NodeList {
        self.matching(Node::is_retired)
    }

    pub fn not_retired(&self) -> NodeList {
        self.matching(|n| !n.is_retired())
    }

    /// Nodes that are failed or about to be failed.
    pub fn failing(&self) -> NodeList {
        self.matching(|n| n.state == NodeState::Failed || n.status.fail_count > 0)
    }

    pub fn hostnames(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.hostname.clone()).collect()
    }
}

impl<'a> IntoIterator for &'a NodeList {
    type Item = &'a Node;
    type IntoIter = std::slice::Iter<'a, Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}

impl FromIterator<Node> for NodeList {
    fn from_iter<I: IntoIterator<Item = Node>>(iter: I) -> Self {
        NodeList::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodegrid_core::{Flavor, NodeResources};

    fn node(hostname: &str, node_type: NodeType, parent: Option<&str>) -> Node {
        let node = Node::new(
            hostname,
            node_type,
            Flavor::custom(NodeResources::new(2.0, 8.0, 50.0, 1.0)),
            NodeState::Ready,
            0,
        );
        match parent {
            Some(p) => node.with_parent(p),
            None => node,
        }
    }

    #[test]
    fn children_are_indexed_by_parent() {
        let list = NodeList::new(vec![
            node("host1", NodeType::Host, None),
            node("host2", NodeType::Host, None),
            node("a", NodeType::Tenant, Some("host1")),
            node("b", NodeType::Tenant, Some("host1")),
            node("c", NodeType::Tenant, Some("host2")),
        ]);

        let children: Vec<_> = list.children_of("host1").map(|n| n.hostname.as_str()).collect();
        assert_eq!(children, vec!["a", "b"]);
        assert_eq!(list.children_of("host2").count(), 1);
        assert_eq!(list.children_of("a").count(), 0);
        assert_eq!(list.children_of("missing").count(), 0);

        let c = list.node("c").unwrap();
        assert_eq!(list.parent_of(c).unwrap().hostname, "host2");
    }

    #[test]
    fn filters_rebuild_relations() {
        let list = NodeList::new(vec![
            node("host1", NodeType::Host, None),
            node("a", NodeType::Tenant, Some("host1")),
        ]);
        assert_eq!(list.hosts().len(), 1);
        let tenants = list.node_type(NodeType::Tenant);
        assert_eq!(tenants.len(), 1);
        assert!(tenants.parent_of(tenants.first().unwrap()).is_none());
    }
}
