//! The capacity request contract offered to deployments.
//!
//! A deployment calls [`Provisioner::prepare`] for each of its clusters,
//! then activates all returned hosts in one transaction:
//!
//! ```text
//! let hosts = provisioner.prepare(&app, &cluster, &Capacity::of(3, 1))?;
//! let mut txn = provisioner.begin(&app)?;
//! provisioner.activate(&hosts, generation, &mut txn)?;
//! provisioner.commit(txn)?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use nodegrid_allocation::{
    AllocationParams, CapacityPolicies, NodeResourceLimits, NodeSpec, ResourcesCalculator,
};
use nodegrid_core::{
    ApplicationId, CloudAccount, ClusterId, ClusterMembership, ClusterSpec, ClusterType, Flavor,
    FlavorGraph, NodeResources, Zone, ZoneConfig,
};
use nodegrid_state::{
    ApplicationTransaction, Locks, NetworkPort, Node, NodeState, NodeType, StateStore,
    application_lock_path, epoch_secs,
};
use semver::Version;
use serde::Serialize;
use tracing::info;

use crate::activator::Activator;
use crate::error::ProvisionResult;
use crate::host_provisioner::HostProvisioner;
use crate::lb_service::LoadBalancerService;
use crate::load_balancer::LoadBalancerProvisioner;
use crate::preparer::Preparer;

/// What a deployment asks for one cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct Capacity {
    pub nodes: u32,
    pub groups: u32,
    /// Node resources. Defaults depend on the cluster type.
    pub resources: Option<NodeResources>,
    /// A configured flavor to use instead of `resources`.
    pub flavor: Option<String>,
    /// Exempt from environment-based downsizing.
    pub required: bool,
    pub can_fail: bool,
    pub node_type: NodeType,
    pub cloud_account: CloudAccount,
}

impl Capacity {
    pub fn of(nodes: u32, groups: u32) -> Self {
        Self {
            nodes,
            groups,
            resources: None,
            flavor: None,
            required: false,
            can_fail: true,
            node_type: NodeType::Tenant,
            cloud_account: CloudAccount::unspecified(),
        }
    }

    /// All nodes of an infrastructure type.
    pub fn from_required_node_type(node_type: NodeType) -> Self {
        Self {
            nodes: 0,
            groups: 1,
            required: true,
            can_fail: false,
            node_type,
            ..Self::of(0, 1)
        }
    }

    pub fn with_resources(mut self, resources: NodeResources) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn with_flavor(mut self, flavor: impl Into<String>) -> Self {
        self.flavor = Some(flavor.into());
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn with_can_fail(mut self, can_fail: bool) -> Self {
        self.can_fail = can_fail;
        self
    }

    pub fn with_cloud_account(mut self, cloud_account: CloudAccount) -> Self {
        self.cloud_account = cloud_account;
        self
    }
}

/// One host of a prepared cluster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostSpec {
    pub hostname: String,
    pub real_resources: NodeResources,
    pub advertised_resources: NodeResources,
    pub requested_resources: NodeResources,
    pub membership: ClusterMembership,
    pub version: Option<Version>,
    pub docker_image: Option<String>,
    pub archive_uri: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub network_ports: Vec<NetworkPort>,
}

/// Selects the nodes of an application to restart. An empty filter
/// matches every node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestartFilter {
    hostnames: Vec<String>,
    cluster_type: Option<ClusterType>,
    cluster_id: Option<ClusterId>,
}

impl RestartFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostnames.push(hostname.into());
        self
    }

    pub fn with_cluster_type(mut self, cluster_type: ClusterType) -> Self {
        self.cluster_type = Some(cluster_type);
        self
    }

    pub fn with_cluster_id(mut self, cluster_id: ClusterId) -> Self {
        self.cluster_id = Some(cluster_id);
        self
    }

    pub fn matches(&self, node: &Node) -> bool {
        if !self.hostnames.is_empty() && !self.hostnames.contains(&node.hostname) {
            return false;
        }
        let Some(membership) = node.membership() else {
            return self.cluster_type.is_none() && self.cluster_id.is_none();
        };
        self.cluster_type.is_none_or(|t| t == membership.cluster.cluster_type)
            && self.cluster_id.as_ref().is_none_or(|id| *id == membership.cluster.id)
    }
}

pub struct Provisioner {
    config: ZoneConfig,
    zone: Zone,
    flavors: FlavorGraph,
    calculator: ResourcesCalculator,
    store: StateStore,
    locks: Arc<dyn Locks>,
    lock_timeout: Duration,
    preparer: Preparer,
    activator: Activator,
    load_balancers: Option<Arc<LoadBalancerProvisioner>>,
}

impl Provisioner {
    pub fn new(
        config: ZoneConfig,
        store: StateStore,
        locks: Arc<dyn Locks>,
        host_provisioner: Option<Arc<dyn HostProvisioner>>,
        load_balancer_service: Option<Arc<dyn LoadBalancerService>>,
    ) -> ProvisionResult<Self> {
        let zone = config.zone();
        let flavors = config.flavor_graph()?;
        let calculator = ResourcesCalculator::new(&config.resources);
        let lock_timeout = Duration::from_secs(config.provisioning.lock_timeout_secs);
        let load_balancers = load_balancer_service
            .map(|service| Arc::new(LoadBalancerProvisioner::new(store.clone(), service, zone.clone())));
        let preparer = Preparer::new(store.clone(), locks.clone(), lock_timeout, host_provisioner)
            .with_own_hostname(config.provisioning.hostname.clone());
        let activator = Activator::new(store.clone(), load_balancers.clone());
        Ok(Self {
            config,
            zone,
            flavors,
            calculator,
            store,
            locks,
            lock_timeout,
            preparer,
            activator,
            load_balancers,
        })
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn zone(&self) -> &Zone {
        &self.zone
    }

    /// Reserve nodes for `cluster` and describe them, ordered by membership index.
    pub fn prepare(
        &self,
        application: &ApplicationId,
        cluster: &ClusterSpec,
        capacity: &Capacity,
    ) -> ProvisionResult<Vec<HostSpec>> {
        let now = epoch_secs();
        let (requested, exclusive) = self.requested_nodes(application, cluster, capacity)?;
        let cluster = cluster.clone().with_exclusivity(exclusive);
        info!(%application, cluster = %cluster.id, %requested, "preparing");

        let params = AllocationParams::new(&self.config, application.clone(), cluster.clone(), now);
        let nodes = self.preparer.prepare(&params, &requested)?;
        if let Some(load_balancers) = &self.load_balancers {
            let _lock = self
                .locks
                .lock(&application_lock_path(application), self.lock_timeout)?;
            load_balancers.prepare(application, &cluster, &requested, now)?;
        }

        let docker_image = self.store.docker_image(requested.node_type())?;
        let archive_uri = self.store.archive_uri(&application.tenant)?;
        let mut hosts: Vec<HostSpec> = nodes
            .iter()
            .filter_map(|node| self.host_spec(node, &docker_image, &archive_uri))
            .collect();
        hosts.sort_by_key(|h| h.membership.index);
        Ok(hosts)
    }

    /// A transaction holding the lock of `application`.
    pub fn begin(&self, application: &ApplicationId) -> ProvisionResult<ApplicationTransaction> {
        let lock = self
            .locks
            .lock(&application_lock_path(application), self.lock_timeout)?;
        Ok(ApplicationTransaction::new(application.clone(), lock))
    }

    /// Add activation of `hosts` to `transaction`. Nothing is written until
    /// the transaction is committed.
    pub fn activate(
        &self,
        hosts: &[HostSpec],
        generation: u64,
        transaction: &mut ApplicationTransaction,
    ) -> ProvisionResult<()> {
        self.activator.activate(hosts, generation, transaction, epoch_secs())
    }

    pub fn commit(&self, transaction: ApplicationTransaction) -> ProvisionResult<()> {
        self.store.commit(transaction)?;
        Ok(())
    }

    /// Ask active nodes matching `filter` to restart. Returns how many were asked.
    pub fn restart(&self, application: &ApplicationId, filter: &RestartFilter) -> ProvisionResult<usize> {
        let mut transaction = self.begin(application)?;
        let restarted: Vec<Node> = self
            .store
            .nodes_uncached()?
            .owner(application)
            .state(NodeState::Active)
            .iter()
            .filter(|node| filter.matches(node))
            .filter_map(|node| {
                let allocation = node.allocation.as_ref()?;
                let generation = allocation.restart_generation.with_increased_wanted();
                Some(node.with_allocation(allocation.with_restart_generation(generation)))
            })
            .collect();
        let count = restarted.len();
        transaction.put_nodes(restarted);
        self.store.commit(transaction)?;
        info!(%application, count, "restart requested");
        Ok(count)
    }

    /// Deactivate every node and load balancer of the application in `transaction`.
    pub fn remove(&self, transaction: &mut ApplicationTransaction) -> ProvisionResult<()> {
        let now = epoch_secs();
        let application = transaction.application().clone();
        let deactivated: Vec<Node> = self
            .store
            .nodes_uncached()?
            .owner(&application)
            .states(&[NodeState::Reserved, NodeState::Active])
            .iter()
            .map(|node| node.with_state(NodeState::Inactive, now))
            .collect();
        info!(%application, nodes = deactivated.len(), "removing application");
        transaction.put_nodes(deactivated);
        if let Some(load_balancers) = &self.load_balancers {
            load_balancers.deactivate(transaction, now)?;
        }
        Ok(())
    }

    /// Turn `capacity` into a node request, applying environment policies.
    /// Returns the request and whether the cluster gets exclusive hosts.
    fn requested_nodes(
        &self,
        application: &ApplicationId,
        cluster: &ClusterSpec,
        capacity: &Capacity,
    ) -> ProvisionResult<(NodeSpec, bool)> {
        if capacity.node_type != NodeType::Tenant {
            let requested = NodeSpec::of_type(capacity.node_type, capacity.nodes)
                .with_can_fail(capacity.can_fail)
                .with_cloud_account(capacity.cloud_account.clone());
            return Ok((requested, false));
        }

        let policies = CapacityPolicies::new(&self.zone);
        let exclusive = policies.decide_exclusivity(&capacity.cloud_account, capacity.required, cluster);
        let count = policies.decide_size(
            capacity.nodes,
            capacity.required,
            capacity.can_fail,
            cluster,
            application,
        )?;
        let groups = capacity.groups.clamp(1, count.max(1));
        let flavor = match &capacity.flavor {
            Some(name) => self.flavors.flavor(name)?,
            None => {
                if let Some(resources) = &capacity.resources {
                    NodeResourceLimits::new(&self.zone, self.calculator).ensure_within_advertised_limits(
                        "Requested",
                        resources,
                        application,
                        cluster,
                        exclusive,
                    )?;
                }
                Flavor::custom(policies.decide_node_resources(
                    capacity.resources,
                    capacity.required,
                    exclusive,
                    cluster,
                ))
            }
        };
        let requested = NodeSpec::count(count, groups, flavor)
            .with_exclusive(exclusive)
            .with_can_fail(capacity.can_fail)
            .with_cloud_account(capacity.cloud_account.clone());
        Ok((requested, exclusive))
    }

    fn host_spec(
        &self,
        node: &Node,
        docker_image: &Option<String>,
        archive_uri: &Option<String>,
    ) -> Option<HostSpec> {
        let allocation = node.allocation.as_ref()?;
        Some(HostSpec {
            hostname: node.hostname.clone(),
            real_resources: self.calculator.real_resources_of(node),
            advertised_resources: *node.resources(),
            requested_resources: allocation.requested_resources,
            membership: allocation.membership.clone(),
            version: node.status.platform_version.clone(),
            docker_image: docker_image.clone(),
            archive_uri: archive_uri.clone(),
            network_ports: allocation.network_ports.clone(),
        })
    }
}
