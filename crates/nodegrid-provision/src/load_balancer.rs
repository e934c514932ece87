//! Load balancers in front of container clusters.
//!
//! `prepare` makes sure a load balancer exists for the cluster, `activate`
//! points it at the active nodes. Provider failures leave the record as it
//! was and are retried on the next deployment.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use nodegrid_allocation::NodeSpec;
use nodegrid_core::{ApplicationId, CloudAccount, ClusterId, ClusterSpec, Zone};
use nodegrid_state::{
    ApplicationTransaction, LoadBalancer, LoadBalancerId, LoadBalancerInstance,
    LoadBalancerState, Node, NodeList, Real, StateStore,
};
use tracing::{debug, info, warn};

use crate::error::{LoadBalancerError, ProvisionResult};
use crate::lb_service::{LoadBalancerService, LoadBalancerSpec, Protocol};

/// Port the reals of every load balancer listen on.
pub const REAL_PORT: u16 = 4443;

pub struct LoadBalancerProvisioner {
    store: StateStore,
    service: Arc<dyn LoadBalancerService>,
    zone: Zone,
}

impl LoadBalancerProvisioner {
    pub fn new(store: StateStore, service: Arc<dyn LoadBalancerService>, zone: Zone) -> Self {
        Self {
            store,
            service,
            zone,
        }
    }

    pub fn service(&self) -> &Arc<dyn LoadBalancerService> {
        &self.service
    }

    /// Create the load balancer of `cluster`, or reconcile its settings. The
    /// caller holds the application lock.
    pub fn prepare(
        &self,
        application: &ApplicationId,
        cluster: &ClusterSpec,
        requested: &NodeSpec,
        now: u64,
    ) -> ProvisionResult<()> {
        if !self.service.supports(requested.node_type(), cluster.cluster_type) {
            return Ok(());
        }
        let id = LoadBalancerId::new(application.clone(), cluster.effective_id().clone());
        let account = requested.cloud_account().or(&self.zone.cloud.account);

        let existing = self.store.get_load_balancer(&id)?;
        let current = match &existing {
            Some(lb) if lb.state == LoadBalancerState::Removable => {
                warn!(%id, "load balancer is being removed, cannot prepare it");
                return Err(LoadBalancerError::NotReady(id.to_string()).into());
            }
            Some(lb) => self.discard_mismatched(lb, cluster, &account, now)?,
            None => LoadBalancer::new(id.clone(), None, LoadBalancerState::Reserved, now),
        };

        let reals = current
            .instance
            .as_ref()
            .map(|instance| instance.reals.clone())
            .unwrap_or_default();
        let prepared = match self.configure(&current, cluster, &account, reals) {
            Ok(instance) => with_instance(&current, instance, now),
            Err(e) => {
                warn!(%id, error = %e, "load balancer provisioning failed, will retry on next deployment");
                current
            }
        };

        if existing.as_ref() == Some(&prepared) {
            debug!(%id, "load balancer unchanged");
            return Ok(());
        }
        self.store.put_load_balancer(&prepared)?;
        info!(%id, state = %prepared.state, provisioned = prepared.instance.is_some(), "load balancer prepared");
        Ok(())
    }

    /// Point the load balancers of every cluster in `active_nodes` at those
    /// nodes, and deactivate load balancers of clusters that are gone.
    pub fn activate(
        &self,
        active_nodes: &NodeList,
        transaction: &mut ApplicationTransaction,
        now: u64,
    ) -> ProvisionResult<()> {
        let application = transaction.application().clone();
        let mut clusters: BTreeMap<ClusterId, ClusterSpec> = BTreeMap::new();
        for node in active_nodes {
            let Some(membership) = node.membership() else {
                continue;
            };
            if self.service.supports(node.node_type, membership.cluster.cluster_type) {
                clusters
                    .entry(membership.cluster.effective_id().clone())
                    .or_insert_with(|| membership.cluster.clone());
            }
        }

        let existing = self.store.load_balancers_of(&application)?;
        for (cluster_id, cluster) in &clusters {
            let id = LoadBalancerId::new(application.clone(), cluster_id.clone());
            let Some(lb) = existing.iter().find(|lb| lb.id == id) else {
                return Err(LoadBalancerError::NotPrepared(id.to_string()).into());
            };
            if lb.instance.is_none() {
                warn!(%id, "load balancer has no instance yet");
                return Err(LoadBalancerError::NotReady(id.to_string()).into());
            }
            let nodes = active_nodes.matching(|n| {
                n.membership()
                    .is_some_and(|m| m.cluster.effective_id() == cluster_id)
            });
            let account = nodes
                .first()
                .map(|n| n.cloud_account.or(&self.zone.cloud.account))
                .unwrap_or_else(|| self.zone.cloud.account.clone());

            let lb = self.discard_mismatched(lb, cluster, &account, now)?;
            let reals = self.reals_of(&nodes, &account);
            let instance = self.configure(&lb, cluster, &account, reals).map_err(|e| {
                warn!(%id, error = %e, "could not configure load balancer");
                LoadBalancerError::NotReady(id.to_string())
            })?;
            let activated = with_instance(&lb, instance, now).with_state(LoadBalancerState::Active, now)?;
            info!(%id, reals = activated.instance.as_ref().map_or(0, |i| i.reals.len()), "load balancer activated");
            transaction.put_load_balancer(activated);
        }

        for lb in existing.iter().filter(|lb| !clusters.contains_key(&lb.id.cluster)) {
            if matches!(lb.state, LoadBalancerState::Reserved | LoadBalancerState::Active) {
                info!(id = %lb.id, "load balancer of removed cluster deactivated");
                transaction.put_load_balancer(lb.with_state(LoadBalancerState::Inactive, now)?);
            }
        }
        Ok(())
    }

    /// Deactivate every load balancer of the application in `transaction`.
    pub fn deactivate(&self, transaction: &mut ApplicationTransaction, now: u64) -> ProvisionResult<()> {
        let application = transaction.application().clone();
        for lb in self.store.load_balancers_of(&application)? {
            if matches!(lb.state, LoadBalancerState::Reserved | LoadBalancerState::Active) {
                info!(id = %lb.id, "load balancer deactivated");
                transaction.put_load_balancer(lb.with_state(LoadBalancerState::Inactive, now)?);
            }
        }
        Ok(())
    }

    /// `lb` without its instance if the instance has the wrong account or
    /// visibility. The instance is removed from the service first.
    fn discard_mismatched(
        &self,
        lb: &LoadBalancer,
        cluster: &ClusterSpec,
        account: &CloudAccount,
        now: u64,
    ) -> ProvisionResult<LoadBalancer> {
        let Some(instance) = &lb.instance else {
            return Ok(lb.clone());
        };
        if instance.cloud_account == *account && instance.settings == cluster.zone_endpoint {
            return Ok(lb.clone());
        }
        info!(
            id = %lb.id,
            from_account = %instance.cloud_account,
            to_account = %account,
            "load balancer settings changed, recreating it"
        );
        self.service.remove(lb)?;
        Ok(lb.with_instance(None, now))
    }

    fn configure(
        &self,
        lb: &LoadBalancer,
        cluster: &ClusterSpec,
        account: &CloudAccount,
        reals: BTreeSet<Real>,
    ) -> Result<LoadBalancerInstance, LoadBalancerError> {
        let spec = LoadBalancerSpec {
            id: lb.id.clone(),
            id_seed: lb.id_seed.clone(),
            reals,
            settings: cluster.zone_endpoint,
            cloud_account: account.clone(),
        };
        match &lb.instance {
            Some(instance) => self.service.configure(instance, &spec, false),
            None => self.service.provision(&spec),
        }
    }

    fn reals_of(&self, nodes: &NodeList, account: &CloudAccount) -> BTreeSet<Real> {
        let enclave = self.zone.cloud.allow_enclave && *account != self.zone.cloud.account;
        let protocol = self.service.protocol(enclave);
        nodes
            .iter()
            .filter_map(|node| match address_of(node, protocol) {
                Some(ip_address) => Some(Real {
                    hostname: node.hostname.clone(),
                    ip_address,
                    port: REAL_PORT,
                }),
                None => {
                    warn!(hostname = %node.hostname, %protocol, "node has no usable address, not adding it to load balancer");
                    None
                }
            })
            .collect()
    }
}

fn with_instance(lb: &LoadBalancer, instance: LoadBalancerInstance, now: u64) -> LoadBalancer {
    if lb.instance.as_ref() == Some(&instance) {
        lb.clone()
    } else {
        lb.with_instance(Some(instance), now)
    }
}

fn address_of(node: &Node, protocol: Protocol) -> Option<String> {
    node.ip_config
        .primary
        .iter()
        .find(|address| address.contains(':') == (protocol == Protocol::Ipv6))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockLoadBalancerService;
    use nodegrid_core::{ClusterMembership, ClusterType, Environment, Flavor, NodeResources, ZoneEndpoint};
    use nodegrid_state::{
        InMemoryLocks, IpConfig, Locks, NodeState, NodeType, application_lock_path,
    };
    use semver::Version;
    use std::time::Duration;

    fn app() -> ApplicationId {
        ApplicationId::new("tenant", "music", "default")
    }

    fn cluster() -> ClusterSpec {
        ClusterSpec::request(ClusterType::Container, ClusterId::new("web"), Version::new(8, 1, 0))
    }

    fn requested() -> NodeSpec {
        NodeSpec::count(2, 1, Flavor::custom(NodeResources::new(2.0, 8.0, 50.0, 1.0)))
    }

    fn setup() -> (StateStore, Arc<MockLoadBalancerService>, LoadBalancerProvisioner) {
        let store = StateStore::open_in_memory().unwrap();
        let service = Arc::new(MockLoadBalancerService::new());
        let provisioner = LoadBalancerProvisioner::new(
            store.clone(),
            service.clone(),
            Zone::new(Environment::Prod, "us-east"),
        );
        (store, service, provisioner)
    }

    fn id() -> LoadBalancerId {
        LoadBalancerId::new(app(), ClusterId::new("web"))
    }

    fn active_node(hostname: &str, address: &str, cluster: &ClusterSpec) -> Node {
        let resources = NodeResources::new(2.0, 8.0, 50.0, 1.0);
        Node::new(hostname, NodeType::Tenant, Flavor::custom(resources), NodeState::Active, 0)
            .with_ip_config(IpConfig::default().with_primary(vec![address.to_string()]))
            .allocate(app(), ClusterMembership::from(cluster.clone().with_group(Some(0)), 0), resources, 0)
    }

    fn transaction(locks: &InMemoryLocks) -> ApplicationTransaction {
        let lock = locks
            .lock(&application_lock_path(&app()), Duration::from_secs(1))
            .unwrap();
        ApplicationTransaction::new(app(), lock)
    }

    #[test]
    fn prepare_creates_reserved_load_balancer_once() {
        let (store, service, provisioner) = setup();
        provisioner.prepare(&app(), &cluster(), &requested(), 10).unwrap();

        let lb = store.get_load_balancer(&id()).unwrap().unwrap();
        assert_eq!(lb.state, LoadBalancerState::Reserved);
        assert!(lb.instance.is_some());
        assert!(service.instance(&id()).is_some());

        provisioner.prepare(&app(), &cluster(), &requested(), 20).unwrap();
        assert_eq!(store.get_load_balancer(&id()).unwrap().unwrap(), lb);
    }

    #[test]
    fn unsupported_cluster_gets_no_load_balancer() {
        let (store, _, provisioner) = setup();
        let content = ClusterSpec::request(ClusterType::Content, ClusterId::new("web"), Version::new(8, 1, 0));
        provisioner.prepare(&app(), &content, &requested(), 10).unwrap();
        assert!(store.get_load_balancer(&id()).unwrap().is_none());
    }

    #[test]
    fn changed_visibility_recreates_instance() {
        let (store, service, provisioner) = setup();
        provisioner.prepare(&app(), &cluster(), &requested(), 10).unwrap();

        let private = cluster().with_zone_endpoint(ZoneEndpoint::private_only());
        provisioner.prepare(&app(), &private, &requested(), 20).unwrap();

        assert_eq!(service.removed(), vec![id()]);
        let lb = store.get_load_balancer(&id()).unwrap().unwrap();
        assert_eq!(lb.instance.unwrap().settings, ZoneEndpoint::private_only());
    }

    #[test]
    fn provider_failure_leaves_reserved_and_activation_not_ready() {
        let (store, service, provisioner) = setup();
        service.set_failing(true);
        provisioner.prepare(&app(), &cluster(), &requested(), 10).unwrap();

        let lb = store.get_load_balancer(&id()).unwrap().unwrap();
        assert_eq!(lb.state, LoadBalancerState::Reserved);
        assert!(lb.instance.is_none());

        let locks = InMemoryLocks::new();
        let mut txn = transaction(&locks);
        let nodes = NodeList::new(vec![active_node("node1", "10.0.0.1", &cluster())]);
        let err = provisioner.activate(&nodes, &mut txn, 20).unwrap_err();
        assert!(err.is_retryable());
        assert!(txn.load_balancers().is_empty());
    }

    #[test]
    fn activate_configures_reals_and_deactivates_removed_clusters() {
        let (store, service, provisioner) = setup();
        provisioner.prepare(&app(), &cluster(), &requested(), 10).unwrap();
        let other = ClusterSpec::request(ClusterType::Container, ClusterId::new("api"), Version::new(8, 1, 0));
        provisioner.prepare(&app(), &other, &requested(), 10).unwrap();

        let locks = InMemoryLocks::new();
        let mut txn = transaction(&locks);
        let nodes = NodeList::new(vec![
            active_node("node1", "10.0.0.1", &cluster()),
            active_node("node2", "10.0.0.2", &cluster()),
        ]);
        provisioner.activate(&nodes, &mut txn, 20).unwrap();
        store.commit(txn).unwrap();

        let web = store.get_load_balancer(&id()).unwrap().unwrap();
        assert_eq!(web.state, LoadBalancerState::Active);
        let reals: Vec<_> = web.instance.unwrap().reals.into_iter().map(|r| r.hostname).collect();
        assert_eq!(reals, vec!["node1", "node2"]);
        assert_eq!(service.instance(&id()).unwrap().reals.len(), 2);

        let api = store
            .get_load_balancer(&LoadBalancerId::new(app(), ClusterId::new("api")))
            .unwrap()
            .unwrap();
        assert_eq!(api.state, LoadBalancerState::Inactive);
    }

    #[test]
    fn activate_without_prepare_fails() {
        let (_, _, provisioner) = setup();
        let locks = InMemoryLocks::new();
        let mut txn = transaction(&locks);
        let nodes = NodeList::new(vec![active_node("node1", "10.0.0.1", &cluster())]);
        assert!(matches!(
            provisioner.activate(&nodes, &mut txn, 20),
            Err(crate::ProvisionError::LoadBalancer(LoadBalancerError::NotPrepared(_)))
        ));
    }
}
