//! What a cluster asks for: a number of nodes, or all nodes of a type.

use std::fmt;

use nodegrid_core::{CloudAccount, ClusterType, Flavor, NodeResources};
use nodegrid_state::{Node, NodeState, NodeType};

use crate::candidate::NodeCandidate;

/// A request for `count` nodes of a flavor, spread over `groups` groups.
#[derive(Debug, Clone, PartialEq)]
pub struct CountSpec {
    pub count: u32,
    pub groups: u32,
    pub flavor: Flavor,
    pub exclusive: bool,
    /// Whether failing to satisfy the request is an error.
    pub can_fail: bool,
    /// Whether nodes may be retired to satisfy the request.
    pub consider_retiring: bool,
    pub cloud_account: CloudAccount,
}

/// A request for all nodes of one type, as made by infrastructure applications.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeSpec {
    pub node_type: NodeType,
    /// How many nodes of the type the zone should have.
    pub wanted_count: u32,
    pub can_fail: bool,
    pub cloud_account: CloudAccount,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeSpec {
    Count(CountSpec),
    Type(TypeSpec),
}

impl NodeSpec {
    pub fn count(count: u32, groups: u32, flavor: Flavor) -> Self {
        NodeSpec::Count(CountSpec {
            count,
            groups: groups.max(1),
            flavor,
            exclusive: false,
            can_fail: true,
            consider_retiring: true,
            cloud_account: CloudAccount::unspecified(),
        })
    }

    pub fn of_type(node_type: NodeType, wanted_count: u32) -> Self {
        NodeSpec::Type(TypeSpec {
            node_type,
            wanted_count,
            can_fail: false,
            cloud_account: CloudAccount::unspecified(),
        })
    }

    pub fn with_exclusive(self, exclusive: bool) -> Self {
        match self {
            NodeSpec::Count(spec) => NodeSpec::Count(CountSpec { exclusive, ..spec }),
            other => other,
        }
    }

    pub fn with_can_fail(self, can_fail: bool) -> Self {
        match self {
            NodeSpec::Count(spec) => NodeSpec::Count(CountSpec { can_fail, ..spec }),
            NodeSpec::Type(spec) => NodeSpec::Type(TypeSpec { can_fail, ..spec }),
        }
    }

    pub fn with_cloud_account(self, cloud_account: CloudAccount) -> Self {
        match self {
            NodeSpec::Count(spec) => NodeSpec::Count(CountSpec {
                cloud_account,
                ..spec
            }),
            NodeSpec::Type(spec) => NodeSpec::Type(TypeSpec {
                cloud_account,
                ..spec
            }),
        }
    }

    /// This request with retirement disabled.
    pub fn without_retiring(&self) -> Self {
        match self {
            NodeSpec::Count(spec) => NodeSpec::Count(CountSpec {
                consider_retiring: false,
                ..spec.clone()
            }),
            other => other.clone(),
        }
    }

    pub fn node_type(&self) -> NodeType {
        match self {
            NodeSpec::Count(_) => NodeType::Tenant,
            NodeSpec::Type(spec) => spec.node_type,
        }
    }

    /// Type of host the requested nodes run on, if they run on hosts.
    pub fn host_type(&self) -> Option<NodeType> {
        self.node_type().host_type()
    }

    pub fn node_count(&self) -> Option<u32> {
        match self {
            NodeSpec::Count(spec) => Some(spec.count),
            NodeSpec::Type(_) => None,
        }
    }

    pub fn groups(&self) -> u32 {
        match self {
            NodeSpec::Count(spec) => spec.groups,
            NodeSpec::Type(_) => 1,
        }
    }

    /// Target number of nodes per group: `ceil(count / groups)`.
    pub fn group_size(&self) -> u32 {
        match self {
            NodeSpec::Count(spec) => spec.count.div_ceil(spec.groups.max(1)),
            NodeSpec::Type(spec) => spec.wanted_count,
        }
    }

    pub fn flavor(&self) -> Option<&Flavor> {
        match self {
            NodeSpec::Count(spec) => Some(&spec.flavor),
            NodeSpec::Type(_) => None,
        }
    }

    pub fn resources(&self) -> Option<NodeResources> {
        self.flavor().map(|f| f.resources)
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self, NodeSpec::Count(spec) if spec.exclusive)
    }

    pub fn can_fail(&self) -> bool {
        match self {
            NodeSpec::Count(spec) => spec.can_fail,
            NodeSpec::Type(spec) => spec.can_fail,
        }
    }

    pub fn consider_retiring(&self) -> bool {
        match self {
            NodeSpec::Count(spec) => spec.consider_retiring,
            NodeSpec::Type(_) => true,
        }
    }

    pub fn cloud_account(&self) -> &CloudAccount {
        match self {
            NodeSpec::Count(spec) => &spec.cloud_account,
            NodeSpec::Type(spec) => &spec.cloud_account,
        }
    }

    /// Whether a node of `flavor` can serve this request as is.
    pub fn is_compatible(&self, flavor: &Flavor) -> bool {
        match self {
            NodeSpec::Count(spec) => {
                if spec.flavor.configured {
                    flavor.satisfies(&spec.flavor)
                } else {
                    flavor.resources.compatible_with(&spec.flavor.resources)
                }
            }
            NodeSpec::Type(_) => true,
        }
    }

    /// Whether no more nodes should be accepted once `count` are.
    pub fn saturated_by(&self, count: u32) -> bool {
        match self {
            NodeSpec::Count(spec) => count >= spec.count,
            NodeSpec::Type(_) => false,
        }
    }

    pub fn fulfilled_by(&self, count: u32) -> bool {
        match self {
            NodeSpec::Count(spec) => count >= spec.count,
            NodeSpec::Type(spec) => count >= spec.wanted_count,
        }
    }

    /// Nodes accepted beyond what was asked for. Negative when short.
    pub fn surplus_given(&self, count: u32) -> i64 {
        match self {
            NodeSpec::Count(spec) => i64::from(count) - i64::from(spec.count),
            NodeSpec::Type(_) => 0,
        }
    }

    /// Nodes still missing when `count` are accepted.
    pub fn fulfilled_deficit_count(&self, count: u32) -> u32 {
        match self {
            NodeSpec::Count(spec) => spec.count.saturating_sub(count),
            NodeSpec::Type(spec) => spec.wanted_count.saturating_sub(count),
        }
    }

    /// Whether `node` has other resources than requested.
    pub fn needs_resize(&self, node: &Node) -> bool {
        match self {
            NodeSpec::Count(spec) => !node.resources().compatible_with(&spec.flavor.resources),
            NodeSpec::Type(_) => false,
        }
    }

    /// Whether a node with `current` resources may be resized in place on a
    /// host with `host_unused` capacity left.
    pub fn can_resize(
        &self,
        current: &NodeResources,
        host_unused: &NodeResources,
        cluster_type: ClusterType,
        has_topology_change: bool,
        current_cluster_size: u32,
    ) -> bool {
        let NodeSpec::Count(spec) = self else {
            return false;
        };
        // Exclusive nodes must match their host.
        if spec.exclusive {
            return false;
        }
        if has_topology_change || spec.count < current_cluster_size {
            return false;
        }
        // Content clusters don't grow and shrink node resources in the same change.
        if cluster_type.is_content()
            && spec.count > current_cluster_size
            && !spec.flavor.resources.satisfies(&current.just_numbers())
        {
            return false;
        }
        host_unused
            .add(&current.just_numbers())
            .satisfies(&spec.flavor.resources)
    }

    /// Whether the allocator may take `candidate` at all.
    pub fn acceptable(&self, candidate: &NodeCandidate) -> bool {
        match self {
            NodeSpec::Count(_) => true,
            // All offered nodes are consumed, so skip previously deactivated ones.
            NodeSpec::Type(_) => candidate.state() != NodeState::Inactive,
        }
    }
}

impl fmt::Display for NodeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeSpec::Count(spec) => {
                write!(f, "{} nodes with {}", spec.count, spec.flavor)?;
                if spec.groups > 1 {
                    write!(f, " in {} groups", spec.groups)?;
                }
                if spec.exclusive {
                    f.write_str(" (exclusive)")?;
                }
                Ok(())
            }
            NodeSpec::Type(spec) => write!(f, "request for all nodes of type '{}'", spec.node_type),
        }
    }
}
