//! Periodic maintainers.
//!
//! Each maintainer makes one pass over the stored state per call to
//! [`Maintainer::maintain`]. The daemon drives them with [`run_maintainer`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use nodegrid_core::{ApplicationId, CloudAccount};
use nodegrid_core::config::ProvisioningConfig;
use nodegrid_state::{
    LoadBalancerState, Locks, Node, NodeState, NodeType, StateStore, Status, UNALLOCATED_LOCK,
    application_lock_path, epoch_secs,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{ProvisionError, ProvisionResult};
use crate::host_provisioner::HostProvisioner;
use crate::lb_service::LoadBalancerService;

pub trait Maintainer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run one pass at time `now`. Returns the number of records changed.
    fn maintain(&self, now: u64) -> ProvisionResult<usize>;
}

/// Run `maintainer` every `interval` until `shutdown` changes.
pub async fn run_maintainer(
    maintainer: Arc<dyn Maintainer>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let name = maintainer.name();
    info!(maintainer = name, interval_secs = interval.as_secs(), "maintainer started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let pass = maintainer.clone();
                match tokio::task::spawn_blocking(move || pass.maintain(epoch_secs())).await {
                    Ok(Ok(changed)) => debug!(maintainer = name, changed, "maintenance pass done"),
                    Ok(Err(e)) => error!(maintainer = name, error = %e, "maintenance pass failed"),
                    Err(e) => error!(maintainer = name, error = %e, "maintenance task aborted"),
                }
            }
            _ = shutdown.changed() => {
                info!(maintainer = name, "maintainer shutting down");
                break;
            }
        }
    }
}

// ── Load balancer expirer ──────────────────────────────────────────

/// Removes load balancers that are removable, or inactive for longer than
/// the expiry.
pub struct LoadBalancerExpirer {
    store: StateStore,
    locks: Arc<dyn Locks>,
    service: Arc<dyn LoadBalancerService>,
    lock_timeout: Duration,
    expiry_secs: u64,
}

impl LoadBalancerExpirer {
    pub fn new(
        store: StateStore,
        locks: Arc<dyn Locks>,
        service: Arc<dyn LoadBalancerService>,
        config: &ProvisioningConfig,
    ) -> Self {
        Self {
            store,
            locks,
            service,
            lock_timeout: Duration::from_secs(config.lock_timeout_secs),
            expiry_secs: config.load_balancer_expiry_secs,
        }
    }

    fn expired(&self, state: LoadBalancerState, changed_at: u64, now: u64) -> bool {
        match state {
            LoadBalancerState::Removable => true,
            LoadBalancerState::Inactive => now.saturating_sub(changed_at) >= self.expiry_secs,
            _ => false,
        }
    }
}

impl Maintainer for LoadBalancerExpirer {
    fn name(&self) -> &'static str {
        "load-balancer-expirer"
    }

    fn maintain(&self, now: u64) -> ProvisionResult<usize> {
        let mut removed = 0;
        for lb in self.store.load_balancers()? {
            if !self.expired(lb.state, lb.changed_at, now) {
                continue;
            }
            let _lock = self
                .locks
                .lock(&application_lock_path(&lb.id.application), self.lock_timeout)?;
            let Some(lb) = self.store.get_load_balancer(&lb.id)? else {
                continue;
            };
            if !self.expired(lb.state, lb.changed_at, now) {
                continue;
            }
            if let Err(e) = self.service.remove(&lb) {
                warn!(id = %lb.id, error = %e, "could not remove load balancer, will retry");
                continue;
            }
            self.store.remove_load_balancer(&lb.id)?;
            info!(id = %lb.id, state = %lb.state, "load balancer removed");
            removed += 1;
        }
        Ok(removed)
    }
}

// ── Reservation expirer ────────────────────────────────────────────

/// Frees nodes that stayed reserved longer than the reservation TTL.
/// Tenant children are deleted, which returns their address to the host pool.
pub struct ReservationExpirer {
    store: StateStore,
    locks: Arc<dyn Locks>,
    lock_timeout: Duration,
    ttl_secs: u64,
}

impl ReservationExpirer {
    pub fn new(store: StateStore, locks: Arc<dyn Locks>, config: &ProvisioningConfig) -> Self {
        Self {
            store,
            locks,
            lock_timeout: Duration::from_secs(config.lock_timeout_secs),
            ttl_secs: config.reservation_ttl_secs,
        }
    }

    fn expired(&self, node: &Node, now: u64) -> bool {
        node.state == NodeState::Reserved && now.saturating_sub(node.state_changed_at) >= self.ttl_secs
    }
}

impl Maintainer for ReservationExpirer {
    fn name(&self) -> &'static str {
        "reservation-expirer"
    }

    fn maintain(&self, now: u64) -> ProvisionResult<usize> {
        let mut by_owner: BTreeMap<Option<ApplicationId>, Vec<String>> = BTreeMap::new();
        for node in self.store.nodes_uncached()?.iter().filter(|n| self.expired(n, now)) {
            by_owner
                .entry(node.owner().cloned())
                .or_default()
                .push(node.hostname.clone());
        }

        let mut expired = 0;
        for (owner, hostnames) in by_owner {
            let _application_lock = match &owner {
                Some(application) => Some(
                    self.locks
                        .lock(&application_lock_path(application), self.lock_timeout)?,
                ),
                None => None,
            };
            let _unallocated_lock = self.locks.lock(UNALLOCATED_LOCK, self.lock_timeout)?;

            let mut freed = Vec::new();
            let mut removed = Vec::new();
            for hostname in hostnames {
                let Some(node) = self.store.get_node(&hostname)? else {
                    continue;
                };
                if !self.expired(&node, now) {
                    continue;
                }
                if node.node_type == NodeType::Tenant && node.parent_hostname.is_some() {
                    removed.push(node.hostname);
                } else {
                    freed.push(node.without_allocation().with_state(NodeState::Ready, now));
                }
            }
            if freed.is_empty() && removed.is_empty() {
                continue;
            }
            self.store.put_nodes(&freed)?;
            self.store.remove_nodes(&removed)?;
            info!(
                application = owner.as_ref().map(ToString::to_string).unwrap_or_default(),
                freed = freed.len(),
                removed = removed.len(),
                "expired reservations"
            );
            expired += freed.len() + removed.len();
        }
        Ok(expired)
    }
}

// ── Host maintainers ───────────────────────────────────────────────

/// Completes provisioned hosts and moves them to ready.
pub struct HostResumeProvisioner {
    store: StateStore,
    locks: Arc<dyn Locks>,
    provisioner: Arc<dyn HostProvisioner>,
    lock_timeout: Duration,
}

impl HostResumeProvisioner {
    pub fn new(
        store: StateStore,
        locks: Arc<dyn Locks>,
        provisioner: Arc<dyn HostProvisioner>,
        config: &ProvisioningConfig,
    ) -> Self {
        Self {
            store,
            locks,
            provisioner,
            lock_timeout: Duration::from_secs(config.lock_timeout_secs),
        }
    }

    /// Apply `update` to the stored host if it is still provisioned.
    fn update_host(&self, hostname: &str, update: impl FnOnce(Node) -> Node) -> ProvisionResult<bool> {
        let _lock = self.locks.lock(UNALLOCATED_LOCK, self.lock_timeout)?;
        match self.store.get_node(hostname)? {
            Some(host) if host.state == NodeState::Provisioned => {
                self.store.put_node(&update(host))?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

impl Maintainer for HostResumeProvisioner {
    fn name(&self) -> &'static str {
        "host-resume-provisioner"
    }

    fn maintain(&self, now: u64) -> ProvisionResult<usize> {
        let nodes = self.store.nodes_uncached()?;
        let mut hosts: Vec<&Node> = nodes
            .iter()
            .filter(|n| n.is_host() && n.state == NodeState::Provisioned && !n.status.want_to_deprovision)
            .collect();
        hosts.sort_by(|a, b| a.hostname.cmp(&b.hostname));

        let mut resumed = 0;
        for host in hosts {
            match self.provisioner.provision(host) {
                Ok(ip_config) => {
                    if self.update_host(&host.hostname, |h| {
                        h.with_ip_config(ip_config).with_state(NodeState::Ready, now)
                    })? {
                        info!(hostname = %host.hostname, "host provisioned");
                        resumed += 1;
                    }
                }
                Err(ProvisionError::Throttled(message)) => {
                    warn!(hostname = %host.hostname, %message, "host provisioning throttled, stopping pass");
                    break;
                }
                Err(e @ ProvisionError::FatalProvisioning { .. }) => {
                    warn!(hostname = %host.hostname, error = %e, "host provisioning failed, deprovisioning");
                    self.update_host(&host.hostname, |h| {
                        let status = Status {
                            want_to_deprovision: true,
                            want_to_retire: true,
                            ..h.status.clone()
                        };
                        h.with_status(status)
                    })?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(resumed)
    }
}

/// Deprovisions hosts marked for it once no children remain, then deletes them.
pub struct HostDeprovisioner {
    store: StateStore,
    locks: Arc<dyn Locks>,
    provisioner: Arc<dyn HostProvisioner>,
    lock_timeout: Duration,
}

impl HostDeprovisioner {
    pub fn new(
        store: StateStore,
        locks: Arc<dyn Locks>,
        provisioner: Arc<dyn HostProvisioner>,
        config: &ProvisioningConfig,
    ) -> Self {
        Self {
            store,
            locks,
            provisioner,
            lock_timeout: Duration::from_secs(config.lock_timeout_secs),
        }
    }
}

impl Maintainer for HostDeprovisioner {
    fn name(&self) -> &'static str {
        "host-deprovisioner"
    }

    fn maintain(&self, _now: u64) -> ProvisionResult<usize> {
        let candidates = self
            .store
            .nodes_uncached()?
            .matching(|n| n.is_host() && n.status.want_to_deprovision)
            .hostnames();

        let mut deprovisioned = 0;
        for hostname in candidates {
            let _lock = self.locks.lock(UNALLOCATED_LOCK, self.lock_timeout)?;
            let nodes = self.store.nodes_uncached()?;
            let Some(host) = nodes.node(&hostname) else {
                continue;
            };
            if nodes.children_of(&hostname).next().is_some() {
                debug!(%hostname, "host still has children");
                continue;
            }
            if let Err(e) = self.provisioner.deprovision(host) {
                warn!(%hostname, error = %e, "could not deprovision host, will retry");
                continue;
            }
            self.store.remove_nodes(std::slice::from_ref(&hostname))?;
            info!(%hostname, "host deprovisioned");
            deprovisioned += 1;
        }
        Ok(deprovisioned)
    }
}

/// Replaces the root disk of hosts marked for a rebuild.
pub struct HostDiskReplacer {
    store: StateStore,
    locks: Arc<dyn Locks>,
    provisioner: Arc<dyn HostProvisioner>,
    lock_timeout: Duration,
}

impl HostDiskReplacer {
    pub fn new(
        store: StateStore,
        locks: Arc<dyn Locks>,
        provisioner: Arc<dyn HostProvisioner>,
        config: &ProvisioningConfig,
    ) -> Self {
        Self {
            store,
            locks,
            provisioner,
            lock_timeout: Duration::from_secs(config.lock_timeout_secs),
        }
    }
}

impl Maintainer for HostDiskReplacer {
    fn name(&self) -> &'static str {
        "host-disk-replacer"
    }

    fn maintain(&self, _now: u64) -> ProvisionResult<usize> {
        let nodes = self.store.nodes_uncached()?;
        let mut hosts: Vec<&Node> = nodes
            .iter()
            .filter(|n| n.is_host() && n.status.want_to_rebuild && !n.status.want_to_deprovision)
            .collect();
        hosts.sort_by(|a, b| a.hostname.cmp(&b.hostname));

        let mut replaced = 0;
        for host in hosts {
            let rebuilt = match self.provisioner.replace_root_disk(host) {
                Ok(rebuilt) => rebuilt,
                Err(ProvisionError::Throttled(message)) => {
                    warn!(hostname = %host.hostname, %message, "root disk replacement throttled, stopping pass");
                    break;
                }
                Err(e) => {
                    warn!(hostname = %host.hostname, error = %e, "could not replace root disk, will retry");
                    continue;
                }
            };
            let _lock = self.locks.lock(UNALLOCATED_LOCK, self.lock_timeout)?;
            match self.store.get_node(&host.hostname)? {
                Some(current) if current.status.want_to_rebuild => {
                    let status = Status {
                        want_to_rebuild: false,
                        ..current.status.clone()
                    };
                    self.store.put_node(&rebuilt.with_status(status))?;
                    info!(hostname = %host.hostname, "root disk replaced");
                    replaced += 1;
                }
                _ => debug!(hostname = %host.hostname, "host changed during root disk replacement"),
            }
        }
        Ok(replaced)
    }
}

/// Marks hosts with scheduled cloud events for retirement.
pub struct HostRetirer {
    store: StateStore,
    locks: Arc<dyn Locks>,
    provisioner: Arc<dyn HostProvisioner>,
    lock_timeout: Duration,
    zone_account: CloudAccount,
}

impl HostRetirer {
    pub fn new(
        store: StateStore,
        locks: Arc<dyn Locks>,
        provisioner: Arc<dyn HostProvisioner>,
        config: &ProvisioningConfig,
        zone_account: CloudAccount,
    ) -> Self {
        Self {
            store,
            locks,
            provisioner,
            lock_timeout: Duration::from_secs(config.lock_timeout_secs),
            zone_account,
        }
    }
}

impl Maintainer for HostRetirer {
    fn name(&self) -> &'static str {
        "host-retirer"
    }

    fn maintain(&self, _now: u64) -> ProvisionResult<usize> {
        let nodes = self.store.nodes_uncached()?;
        let mut accounts: Vec<CloudAccount> = nodes
            .iter()
            .filter(|n| n.is_host())
            .map(|n| n.cloud_account.or(&self.zone_account))
            .collect();
        accounts.push(self.zone_account.clone());
        accounts.sort();
        accounts.dedup();

        let events = self.provisioner.host_events_in(&accounts)?;
        if events.is_empty() {
            return Ok(0);
        }
        let _lock = self.locks.lock(UNALLOCATED_LOCK, self.lock_timeout)?;
        let mut retired = Vec::new();
        for event in events {
            let Some(host) = self.store.get_node(&event.hostname)? else {
                debug!(hostname = %event.hostname, event = %event.id, "event for unknown host");
                continue;
            };
            if !host.is_host() || host.status.want_to_retire {
                continue;
            }
            info!(
                hostname = %host.hostname,
                event = %event.id,
                kind = %event.kind,
                description = %event.description,
                "retiring host with scheduled event"
            );
            retired.push(host.with_want_to_retire(true, host.status.prefer_to_retire));
        }
        self.store.put_nodes(&retired)?;
        Ok(retired.len())
    }
}

/// Moves one active host per pass to a newer flavor generation by retiring it.
pub struct HostFlavorUpgrader {
    store: StateStore,
    locks: Arc<dyn Locks>,
    provisioner: Arc<dyn HostProvisioner>,
    lock_timeout: Duration,
}

impl HostFlavorUpgrader {
    pub fn new(
        store: StateStore,
        locks: Arc<dyn Locks>,
        provisioner: Arc<dyn HostProvisioner>,
        config: &ProvisioningConfig,
    ) -> Self {
        Self {
            store,
            locks,
            provisioner,
            lock_timeout: Duration::from_secs(config.lock_timeout_secs),
        }
    }
}

impl Maintainer for HostFlavorUpgrader {
    fn name(&self) -> &'static str {
        "host-flavor-upgrader"
    }

    fn maintain(&self, _now: u64) -> ProvisionResult<usize> {
        let _lock = self.locks.lock(UNALLOCATED_LOCK, self.lock_timeout)?;
        let nodes = self.store.nodes_uncached()?;
        let mut hosts: Vec<&Node> = nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Host && n.state == NodeState::Active)
            .filter(|n| !n.status.want_to_retire && !n.status.want_to_upgrade_flavor)
            .collect();
        hosts.sort_by(|a, b| a.hostname.cmp(&b.hostname));

        let upgradable = hosts.into_iter().find(|host| {
            let mut children = nodes.children_of(&host.hostname).peekable();
            children.peek().is_some()
                && children.all(|child| self.provisioner.can_upgrade_flavor(host, child))
        });
        let Some(host) = upgradable else {
            return Ok(0);
        };
        let status = Status {
            want_to_retire: true,
            want_to_upgrade_flavor: true,
            ..host.status.clone()
        };
        self.store.put_node(&host.with_status(status))?;
        info!(hostname = %host.hostname, flavor = %host.flavor.name, "host marked for flavor upgrade");
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use nodegrid_core::{ClusterId, ClusterMembership, ClusterSpec, ClusterType, Flavor, NodeResources};
    use nodegrid_state::{InMemoryLocks, IpConfig, IpSlot, LoadBalancer, LoadBalancerId};
    use semver::Version;

    use crate::host_provisioner::HostEvent;
    use crate::mock::{MockFailure, MockHostProvisioner, MockLoadBalancerService};

    fn resources() -> NodeResources {
        NodeResources::new(8.0, 32.0, 500.0, 10.0)
    }

    fn app() -> ApplicationId {
        ApplicationId::new("t", "a", "i")
    }

    fn host(hostname: &str, state: NodeState) -> Node {
        Node::new(hostname, NodeType::Host, Flavor::custom(resources()), state, 0)
            .with_ip_config(IpConfig::default().with_pool(vec![IpSlot::new(
                format!("{hostname}-1"),
                "10.0.0.1",
            )]))
    }

    fn child(hostname: &str, parent: &Node, state: NodeState, at: u64) -> Node {
        let res = NodeResources::new(2.0, 8.0, 50.0, 1.0);
        let cluster = ClusterSpec::request(ClusterType::Container, ClusterId::new("c"), Version::new(8, 1, 0));
        Node::child(hostname, parent, NodeType::Tenant, res, at)
            .allocate(app(), ClusterMembership::from(cluster, 0), res, at)
            .with_state(state, at)
    }

    fn locks() -> Arc<dyn Locks> {
        Arc::new(InMemoryLocks::new())
    }

    #[test]
    fn expires_removable_and_old_inactive_load_balancers() {
        let store = StateStore::open_in_memory().unwrap();
        let service = Arc::new(MockLoadBalancerService::new());
        let config = ProvisioningConfig::default();
        let expiry = config.load_balancer_expiry_secs;
        let lb = |cluster: &str, state| {
            LoadBalancer::new(LoadBalancerId::new(app(), ClusterId::new(cluster)), None, state, 100)
        };
        store.put_load_balancer(&lb("old", LoadBalancerState::Inactive)).unwrap();
        store.put_load_balancer(&lb("gone", LoadBalancerState::Removable)).unwrap();
        store.put_load_balancer(&lb("live", LoadBalancerState::Active)).unwrap();

        let expirer = LoadBalancerExpirer::new(store.clone(), locks(), service.clone(), &config);
        assert_eq!(expirer.maintain(100 + expiry - 1).unwrap(), 1);
        assert_eq!(expirer.maintain(100 + expiry).unwrap(), 1);

        let remaining: Vec<String> = store
            .load_balancers()
            .unwrap()
            .into_iter()
            .map(|lb| lb.id.cluster.to_string())
            .collect();
        assert_eq!(remaining, vec!["live".to_string()]);
        assert_eq!(service.removed().len(), 2);
    }

    #[test]
    fn load_balancer_kept_when_service_fails() {
        let store = StateStore::open_in_memory().unwrap();
        let service = Arc::new(MockLoadBalancerService::new());
        service.set_failing(true);
        let id = LoadBalancerId::new(app(), ClusterId::new("c"));
        store
            .put_load_balancer(&LoadBalancer::new(id.clone(), None, LoadBalancerState::Removable, 0))
            .unwrap();

        let expirer = LoadBalancerExpirer::new(store.clone(), locks(), service, &ProvisioningConfig::default());
        assert_eq!(expirer.maintain(10).unwrap(), 0);
        assert!(store.get_load_balancer(&id).unwrap().is_some());
    }

    #[test]
    fn expired_reservations_are_freed() {
        let store = StateStore::open_in_memory().unwrap();
        let config = ProvisioningConfig::default();
        let ttl = config.reservation_ttl_secs;
        let parent = host("host1", NodeState::Active);
        let old_child = child("host1-1", &parent, NodeState::Reserved, 0);
        let new_child = child("host1-2", &parent, NodeState::Reserved, ttl);
        let bare = Node::new("bare1", NodeType::Tenant, Flavor::custom(resources()), NodeState::Ready, 0)
            .allocate(
                app(),
                old_child.membership().unwrap().clone(),
                resources(),
                0,
            )
            .with_state(NodeState::Reserved, 0);
        store
            .put_nodes(&[parent, old_child, new_child, bare])
            .unwrap();

        let expirer = ReservationExpirer::new(store.clone(), locks(), &config);
        assert_eq!(expirer.maintain(ttl).unwrap(), 2);

        assert!(store.get_node("host1-1").unwrap().is_none());
        assert_eq!(store.require_node("host1-2").unwrap().state, NodeState::Reserved);
        let bare = store.require_node("bare1").unwrap();
        assert_eq!(bare.state, NodeState::Ready);
        assert!(bare.allocation.is_none());
    }

    #[test]
    fn provisioned_hosts_are_resumed() {
        let store = StateStore::open_in_memory().unwrap();
        let provisioner = Arc::new(MockHostProvisioner::new());
        provisioner.fail_resume("host2", MockFailure::Fatal);
        store
            .put_nodes(&[host("host1", NodeState::Provisioned), host("host2", NodeState::Provisioned)])
            .unwrap();

        let resumer = HostResumeProvisioner::new(
            store.clone(),
            locks(),
            provisioner.clone(),
            &ProvisioningConfig::default(),
        );
        assert_eq!(resumer.maintain(5).unwrap(), 1);

        let ready = store.require_node("host1").unwrap();
        assert_eq!(ready.state, NodeState::Ready);
        assert_eq!(ready.ip_config.primary, vec!["10.0.0.0".to_string()]);
        let failed = store.require_node("host2").unwrap();
        assert_eq!(failed.state, NodeState::Provisioned);
        assert!(failed.status.want_to_deprovision);

        // Hosts marked for deprovisioning are not retried.
        assert_eq!(resumer.maintain(6).unwrap(), 0);
        assert_eq!(provisioner.resumed(), vec!["host1".to_string()]);
    }

    #[test]
    fn throttling_stops_the_pass() {
        let store = StateStore::open_in_memory().unwrap();
        let provisioner = Arc::new(MockHostProvisioner::new());
        provisioner.fail_resume("host1", MockFailure::Throttled);
        store
            .put_nodes(&[host("host1", NodeState::Provisioned), host("host2", NodeState::Provisioned)])
            .unwrap();

        let resumer =
            HostResumeProvisioner::new(store.clone(), locks(), provisioner.clone(), &ProvisioningConfig::default());
        assert_eq!(resumer.maintain(5).unwrap(), 0);
        assert!(provisioner.resumed().is_empty());
        assert!(!store.require_node("host1").unwrap().status.want_to_deprovision);
    }

    #[test]
    fn hosts_are_deprovisioned_once_empty() {
        let store = StateStore::open_in_memory().unwrap();
        let provisioner = Arc::new(MockHostProvisioner::new());
        let mark = |n: Node| {
            let status = Status {
                want_to_deprovision: true,
                ..n.status.clone()
            };
            n.with_status(status)
        };
        let busy = mark(host("host1", NodeState::Active));
        let busy_child = child("host1-1", &busy, NodeState::Active, 0);
        store
            .put_nodes(&[busy, busy_child, mark(host("host2", NodeState::Ready))])
            .unwrap();

        let deprovisioner =
            HostDeprovisioner::new(store.clone(), locks(), provisioner.clone(), &ProvisioningConfig::default());
        assert_eq!(deprovisioner.maintain(0).unwrap(), 1);
        assert_eq!(provisioner.deprovisioned(), vec!["host2".to_string()]);
        assert!(store.get_node("host2").unwrap().is_none());
        assert!(store.get_node("host1").unwrap().is_some());
    }

    #[test]
    fn disk_replacer_rebuilds_marked_hosts_once() {
        let store = StateStore::open_in_memory().unwrap();
        let provisioner = Arc::new(MockHostProvisioner::new());
        let rebuild = |n: Node| {
            let status = Status {
                want_to_rebuild: true,
                ..n.status.clone()
            };
            n.with_status(status)
        };
        let mut leaving = rebuild(host("host3", NodeState::Active));
        leaving.status.want_to_deprovision = true;
        store
            .put_nodes(&[
                rebuild(host("host1", NodeState::Active)),
                host("host2", NodeState::Active),
                leaving,
            ])
            .unwrap();

        let replacer =
            HostDiskReplacer::new(store.clone(), locks(), provisioner.clone(), &ProvisioningConfig::default());
        assert_eq!(replacer.maintain(0).unwrap(), 1);
        assert_eq!(replacer.maintain(0).unwrap(), 0);

        assert_eq!(provisioner.replaced_root_disks(), vec!["host1".to_string()]);
        let host1 = store.get_node("host1").unwrap().unwrap();
        assert!(!host1.status.want_to_rebuild);
        assert_eq!(host1.state, NodeState::Active);
    }

    #[test]
    fn disk_replacer_stops_when_throttled() {
        let store = StateStore::open_in_memory().unwrap();
        let provisioner = Arc::new(MockHostProvisioner::new());
        provisioner.fail_root_disk_replacement(Some(MockFailure::Throttled));
        let mut marked = host("host1", NodeState::Active);
        marked.status.want_to_rebuild = true;
        store.put_node(&marked).unwrap();

        let replacer =
            HostDiskReplacer::new(store.clone(), locks(), provisioner.clone(), &ProvisioningConfig::default());
        assert_eq!(replacer.maintain(0).unwrap(), 0);
        assert!(store.get_node("host1").unwrap().unwrap().status.want_to_rebuild);
        assert!(provisioner.replaced_root_disks().is_empty());
    }

    #[test]
    fn host_events_retire_hosts() {
        let store = StateStore::open_in_memory().unwrap();
        let provisioner = Arc::new(MockHostProvisioner::new());
        store
            .put_nodes(&[host("host1", NodeState::Active), host("host2", NodeState::Active)])
            .unwrap();
        provisioner.add_event(HostEvent {
            id: "ev-1".to_string(),
            hostname: "host2".to_string(),
            kind: "reboot".to_string(),
            description: "scheduled maintenance".to_string(),
        });
        provisioner.add_event(HostEvent {
            id: "ev-2".to_string(),
            hostname: "unknown".to_string(),
            kind: "reboot".to_string(),
            description: String::new(),
        });

        let retirer = HostRetirer::new(
            store.clone(),
            locks(),
            provisioner,
            &ProvisioningConfig::default(),
            CloudAccount::unspecified(),
        );
        assert_eq!(retirer.maintain(0).unwrap(), 1);
        assert!(store.require_node("host2").unwrap().status.want_to_retire);
        assert!(!store.require_node("host1").unwrap().status.want_to_retire);
        // Already retiring.
        assert_eq!(retirer.maintain(0).unwrap(), 0);
    }

    #[test]
    fn one_host_per_pass_is_upgraded() {
        let store = StateStore::open_in_memory().unwrap();
        let provisioner = Arc::new(MockHostProvisioner::new());
        let (h1, h2, h3) = (
            host("host1", NodeState::Active),
            host("host2", NodeState::Active),
            host("host3", NodeState::Active),
        );
        let children = vec![
            child("host1-1", &h1, NodeState::Active, 0),
            child("host2-1", &h2, NodeState::Active, 0),
        ];
        store.put_nodes(&[h1, h2, h3]).unwrap();
        store.put_nodes(&children).unwrap();
        for h in ["host1", "host2", "host3"] {
            provisioner.allow_flavor_upgrade(h);
        }

        let upgrader =
            HostFlavorUpgrader::new(store.clone(), locks(), provisioner, &ProvisioningConfig::default());
        assert_eq!(upgrader.maintain(0).unwrap(), 1);
        let h1 = store.require_node("host1").unwrap();
        assert!(h1.status.want_to_upgrade_flavor && h1.status.want_to_retire);
        assert!(!store.require_node("host2").unwrap().status.want_to_upgrade_flavor);

        assert_eq!(upgrader.maintain(0).unwrap(), 1);
        assert!(store.require_node("host2").unwrap().status.want_to_upgrade_flavor);
        // host3 has no children to move.
        assert_eq!(upgrader.maintain(0).unwrap(), 0);
    }

    struct Counting(AtomicUsize);

    impl Maintainer for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn maintain(&self, _now: u64) -> ProvisionResult<usize> {
            Ok(self.0.fetch_add(1, Ordering::SeqCst))
        }
    }

    #[tokio::test]
    async fn maintainer_loop_runs_until_shutdown() {
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_maintainer(
            counting.clone(),
            Duration::from_millis(10),
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop stops")
            .unwrap();
        assert!(counting.0.load(Ordering::SeqCst) >= 1);
    }
}
