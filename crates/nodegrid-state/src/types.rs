//! Persisted records of the node repository.
//!
//! Nodes and load balancers are immutable values: every mutation returns a
//! new record that the caller writes back through the [`crate::StateStore`].

use std::collections::BTreeSet;
use std::fmt;

use nodegrid_core::{
    ApplicationId, ClusterId, ClusterMembership, ClusterType, CloudAccount, Flavor,
    NodeResources, ZoneEndpoint,
};
use semver::Version;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{StateError, StateResult};

// ── Node ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Tenant,
    Host,
    Proxy,
    ProxyHost,
    Config,
    ConfigHost,
    Controller,
    ControllerHost,
}

impl NodeType {
    pub fn is_host(self) -> bool {
        matches!(
            self,
            NodeType::Host | NodeType::ProxyHost | NodeType::ConfigHost | NodeType::ControllerHost
        )
    }

    /// The type of node a host of this type runs.
    pub fn child_type(self) -> Option<NodeType> {
        match self {
            NodeType::Host => Some(NodeType::Tenant),
            NodeType::ProxyHost => Some(NodeType::Proxy),
            NodeType::ConfigHost => Some(NodeType::Config),
            NodeType::ControllerHost => Some(NodeType::Controller),
            _ => None,
        }
    }

    /// The type of host a node of this type runs on.
    pub fn host_type(self) -> Option<NodeType> {
        match self {
            NodeType::Tenant => Some(NodeType::Host),
            NodeType::Proxy => Some(NodeType::ProxyHost),
            NodeType::Config => Some(NodeType::ConfigHost),
            NodeType::Controller => Some(NodeType::ControllerHost),
            _ => None,
        }
    }

    /// Infrastructure types are allocated as "all nodes of this type".
    pub fn is_infrastructure(self) -> bool {
        self != NodeType::Tenant && self != NodeType::Host
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::Tenant => "tenant",
            NodeType::Host => "host",
            NodeType::Proxy => "proxy",
            NodeType::ProxyHost => "proxyhost",
            NodeType::Config => "config",
            NodeType::ConfigHost => "confighost",
            NodeType::Controller => "controller",
            NodeType::ControllerHost => "controllerhost",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Provisioned,
    Ready,
    Reserved,
    Active,
    Inactive,
    Dirty,
    Failed,
    Parked,
    Deprovisioned,
}

impl NodeState {
    /// States in which a node carries an allocation.
    pub fn is_allocated(self) -> bool {
        matches!(
            self,
            NodeState::Reserved
                | NodeState::Active
                | NodeState::Inactive
                | NodeState::Dirty
                | NodeState::Failed
                | NodeState::Parked
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeState::Provisioned => "provisioned",
            NodeState::Ready => "ready",
            NodeState::Reserved => "reserved",
            NodeState::Active => "active",
            NodeState::Inactive => "inactive",
            NodeState::Dirty => "dirty",
            NodeState::Failed => "failed",
            NodeState::Parked => "parked",
            NodeState::Deprovisioned => "deprovisioned",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One address a host can hand out to a child node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IpSlot {
    pub hostname: String,
    pub address: String,
}

impl IpSlot {
    pub fn new(hostname: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            address: address.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IpConfig {
    /// Addresses of the node itself.
    pub primary: Vec<String>,
    /// Addresses a host can assign to its children.
    pub pool: Vec<IpSlot>,
}

impl IpConfig {
    pub fn with_primary(mut self, primary: Vec<String>) -> Self {
        self.primary = primary;
        self
    }

    pub fn with_pool(mut self, pool: Vec<IpSlot>) -> Self {
        self.pool = pool;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Status {
    /// Operator or host event requested retirement.
    pub want_to_retire: bool,
    /// Retire only once a replacement is available.
    pub prefer_to_retire: bool,
    pub want_to_deprovision: bool,
    /// The host should move to a newer flavor generation.
    pub want_to_upgrade_flavor: bool,
    /// The host's root disk should be replaced.
    pub want_to_rebuild: bool,
    pub fail_count: u32,
    pub current_os_version: Option<Version>,
    pub wanted_os_version: Option<Version>,
    pub platform_version: Option<Version>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RestartGeneration {
    pub wanted: u64,
    pub current: u64,
}

impl RestartGeneration {
    pub fn with_increased_wanted(self) -> Self {
        Self {
            wanted: self.wanted + 1,
            ..self
        }
    }

    pub fn pending(&self) -> bool {
        self.wanted > self.current
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkPort {
    pub service: String,
    pub port: u16,
}

/// Ownership of a node by one cluster of one application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub owner: ApplicationId,
    pub membership: ClusterMembership,
    pub requested_resources: NodeResources,
    #[serde(default)]
    pub restart_generation: RestartGeneration,
    /// Marked for removal from the application on the next cleanup.
    #[serde(default)]
    pub removable: bool,
    #[serde(default)]
    pub network_ports: Vec<NetworkPort>,
    pub created_at: u64,
}

impl Allocation {
    pub fn new(
        owner: ApplicationId,
        membership: ClusterMembership,
        requested_resources: NodeResources,
        created_at: u64,
    ) -> Self {
        Self {
            owner,
            membership,
            requested_resources,
            restart_generation: RestartGeneration::default(),
            removable: false,
            network_ports: Vec::new(),
            created_at,
        }
    }

    pub fn with_membership(&self, membership: ClusterMembership) -> Self {
        Self {
            membership,
            ..self.clone()
        }
    }

    pub fn with_requested_resources(&self, requested_resources: NodeResources) -> Self {
        Self {
            requested_resources,
            ..self.clone()
        }
    }

    pub fn removable(&self, removable: bool) -> Self {
        Self {
            removable,
            ..self.clone()
        }
    }

    pub fn with_restart_generation(&self, restart_generation: RestartGeneration) -> Self {
        Self {
            restart_generation,
            ..self.clone()
        }
    }

    pub fn with_network_ports(&self, network_ports: Vec<NetworkPort>) -> Self {
        Self {
            network_ports,
            ..self.clone()
        }
    }
}

/// A host or a node running on a host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub hostname: String,
    /// Set for nodes running on a host. Containment is one level deep.
    pub parent_hostname: Option<String>,
    pub node_type: NodeType,
    pub flavor: Flavor,
    pub state: NodeState,
    pub allocation: Option<Allocation>,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub ip_config: IpConfig,
    /// Tenant this host is reserved to.
    pub reserved_to: Option<String>,
    /// Application this host is dedicated to.
    pub exclusive_to_application: Option<ApplicationId>,
    /// Cluster type this host is dedicated to.
    pub exclusive_to_cluster_type: Option<ClusterType>,
    pub switch_hostname: Option<String>,
    #[serde(default)]
    pub cloud_account: CloudAccount,
    pub created_at: u64,
    pub state_changed_at: u64,
}

impl Node {
    pub fn new(
        hostname: impl Into<String>,
        node_type: NodeType,
        flavor: Flavor,
        state: NodeState,
        created_at: u64,
    ) -> Self {
        let hostname = hostname.into();
        Self {
            id: hostname.clone(),
            hostname,
            parent_hostname: None,
            node_type,
            flavor,
            state,
            allocation: None,
            status: Status::default(),
            ip_config: IpConfig::default(),
            reserved_to: None,
            exclusive_to_application: None,
            exclusive_to_cluster_type: None,
            switch_hostname: None,
            cloud_account: CloudAccount::unspecified(),
            created_at,
            state_changed_at: created_at,
        }
    }

    /// A child node that will run on `parent`, carrying `resources` as a custom flavor.
    pub fn child(
        hostname: impl Into<String>,
        parent: &Node,
        node_type: NodeType,
        resources: NodeResources,
        created_at: u64,
    ) -> Self {
        let mut node = Self::new(
            hostname,
            node_type,
            Flavor::custom(resources),
            NodeState::Reserved,
            created_at,
        );
        node.parent_hostname = Some(parent.hostname.clone());
        node.switch_hostname = parent.switch_hostname.clone();
        node.cloud_account = parent.cloud_account.clone();
        node
    }

    pub fn resources(&self) -> &NodeResources {
        &self.flavor.resources
    }

    pub fn is_host(&self) -> bool {
        self.node_type.is_host()
    }

    pub fn owner(&self) -> Option<&ApplicationId> {
        self.allocation.as_ref().map(|a| &a.owner)
    }

    pub fn membership(&self) -> Option<&ClusterMembership> {
        self.allocation.as_ref().map(|a| &a.membership)
    }

    pub fn is_retired(&self) -> bool {
        self.membership().is_some_and(|m| m.retired)
    }

    pub fn is_removable(&self) -> bool {
        self.allocation.as_ref().is_some_and(|a| a.removable)
    }

    pub fn has_parent(&self, hostname: &str) -> bool {
        self.parent_hostname.as_deref() == Some(hostname)
    }

    pub fn with_state(&self, state: NodeState, at: u64) -> Self {
        Self {
            state,
            state_changed_at: at,
            ..self.clone()
        }
    }

    /// Allocate this node to a cluster of `owner`.
    pub fn allocate(
        &self,
        owner: ApplicationId,
        membership: ClusterMembership,
        requested_resources: NodeResources,
        at: u64,
    ) -> Self {
        Self {
            allocation: Some(Allocation::new(owner, membership, requested_resources, at)),
            ..self.clone()
        }
    }

    pub fn with_allocation(&self, allocation: Allocation) -> Self {
        Self {
            allocation: Some(allocation),
            ..self.clone()
        }
    }

    pub fn without_allocation(&self) -> Self {
        Self {
            allocation: None,
            ..self.clone()
        }
    }

    /// Mark this node's membership retired. No-op without an allocation.
    pub fn retire(&self) -> Self {
        self.map_membership(ClusterMembership::retire)
    }

    pub fn unretire(&self) -> Self {
        self.map_membership(ClusterMembership::unretire)
    }

    fn map_membership(&self, f: impl FnOnce(&ClusterMembership) -> ClusterMembership) -> Self {
        match &self.allocation {
            Some(allocation) => {
                self.with_allocation(allocation.with_membership(f(&allocation.membership)))
            }
            None => self.clone(),
        }
    }

    pub fn with_flavor(&self, flavor: Flavor) -> Self {
        Self {
            flavor,
            ..self.clone()
        }
    }

    pub fn with_status(&self, status: Status) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    pub fn with_want_to_retire(&self, want_to_retire: bool, prefer_to_retire: bool) -> Self {
        Self {
            status: Status {
                want_to_retire,
                prefer_to_retire,
                ..self.status.clone()
            },
            ..self.clone()
        }
    }

    pub fn with_ip_config(&self, ip_config: IpConfig) -> Self {
        Self {
            ip_config,
            ..self.clone()
        }
    }

    pub fn with_exclusive_to(
        &self,
        application: Option<ApplicationId>,
        cluster_type: Option<ClusterType>,
    ) -> Self {
        Self {
            exclusive_to_application: application,
            exclusive_to_cluster_type: cluster_type,
            ..self.clone()
        }
    }

    pub fn with_parent(mut self, parent_hostname: impl Into<String>) -> Self {
        self.parent_hostname = Some(parent_hostname.into());
        self
    }

    pub fn with_switch(mut self, switch_hostname: impl Into<String>) -> Self {
        self.switch_hostname = Some(switch_hostname.into());
        self
    }

    pub fn with_reserved_to(mut self, tenant: impl Into<String>) -> Self {
        self.reserved_to = Some(tenant.into());
        self
    }

    pub fn with_cloud_account(mut self, account: CloudAccount) -> Self {
        self.cloud_account = account;
        self
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} node {}", self.state, self.hostname)?;
        if let Some(allocation) = &self.allocation {
            write!(f, " allocated to {} as {}", allocation.owner, allocation.membership)?;
        }
        Ok(())
    }
}

// ── Load balancer ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LoadBalancerId {
    pub application: ApplicationId,
    pub cluster: ClusterId,
}

impl LoadBalancerId {
    pub fn new(application: ApplicationId, cluster: ClusterId) -> Self {
        Self {
            application,
            cluster,
        }
    }

    pub fn serialized_form(&self) -> String {
        format!("{}:{}", self.application.serialized_form(), self.cluster)
    }

    pub fn table_key(&self) -> String {
        self.serialized_form()
    }
}

impl fmt::Display for LoadBalancerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.application, self.cluster)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancerState {
    Reserved,
    Active,
    Inactive,
    /// Scheduled for removal by the load balancer expirer.
    Removable,
}

impl LoadBalancerState {
    pub fn can_transition_to(self, to: LoadBalancerState) -> bool {
        use LoadBalancerState::*;
        match (self, to) {
            (_, Removable) => true,
            (Removable, _) => false,
            (Reserved, Reserved | Active | Inactive) => true,
            (Active, Active | Inactive) => true,
            (Inactive, Inactive | Active) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LoadBalancerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadBalancerState::Reserved => "reserved",
            LoadBalancerState::Active => "active",
            LoadBalancerState::Inactive => "inactive",
            LoadBalancerState::Removable => "removable",
        };
        f.write_str(name)
    }
}

/// A backend target of a load balancer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Real {
    pub hostname: String,
    pub ip_address: String,
    pub port: u16,
}

/// A load balancer as it exists in the load balancer service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerInstance {
    pub hostname: Option<String>,
    pub ip_address: Option<String>,
    pub ports: Vec<u16>,
    pub reals: BTreeSet<Real>,
    pub settings: ZoneEndpoint,
    pub cloud_account: CloudAccount,
}

impl LoadBalancerInstance {
    pub fn with_reals(&self, reals: BTreeSet<Real>) -> Self {
        Self {
            reals,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub id: LoadBalancerId,
    /// Stable seed the load balancer service derives resource names from.
    pub id_seed: String,
    pub instance: Option<LoadBalancerInstance>,
    pub state: LoadBalancerState,
    pub changed_at: u64,
}

impl LoadBalancer {
    pub fn new(
        id: LoadBalancerId,
        instance: Option<LoadBalancerInstance>,
        state: LoadBalancerState,
        created_at: u64,
    ) -> Self {
        let id_seed = id_seed(&id, created_at);
        Self {
            id,
            id_seed,
            instance,
            state,
            changed_at: created_at,
        }
    }

    /// This load balancer in `to`, failing if the transition is not allowed.
    pub fn with_state(&self, to: LoadBalancerState, at: u64) -> StateResult<Self> {
        if !self.state.can_transition_to(to) {
            return Err(StateError::IllegalTransition {
                what: format!("load balancer {}", self.id),
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        let changed_at = if self.state == to { self.changed_at } else { at };
        Ok(Self {
            state: to,
            changed_at,
            ..self.clone()
        })
    }

    pub fn with_instance(&self, instance: Option<LoadBalancerInstance>, at: u64) -> Self {
        Self {
            instance,
            changed_at: at,
            ..self.clone()
        }
    }
}

fn id_seed(id: &LoadBalancerId, created_at: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.serialized_form().as_bytes());
    hasher.update(created_at.to_be_bytes());
    hex::encode(hasher.finalize())
}
