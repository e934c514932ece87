//! In-memory backends for tests and for running without a cloud.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use nodegrid_core::{CloudAccount, ClusterType, Flavor, NodeResources};
use nodegrid_state::{
    IpConfig, IpSlot, LoadBalancer, LoadBalancerId, LoadBalancerInstance, Node, NodeState,
    NodeType, epoch_secs,
};
use tracing::debug;

use crate::error::{LoadBalancerError, ProvisionError, ProvisionResult};
use crate::host_provisioner::{
    HostEvent, HostProvisionRequest, HostProvisioner, ProvisionedCallback, ProvisionedHost,
};
use crate::lb_service::{LoadBalancerService, LoadBalancerSpec, Protocol};

const DOMAIN: &str = "nodegrid.local";

/// How a mock call should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    Fatal,
    Throttled,
    /// Hand the hosts to the callback, then fail.
    AfterProvisioned,
}

// ── Host provisioner ───────────────────────────────────────────────

#[derive(Debug, Default)]
struct HostState {
    requests: Vec<HostProvisionRequest>,
    provision_failure: Option<MockFailure>,
    resume_failures: HashMap<String, MockFailure>,
    resumed: Vec<String>,
    deprovisioned: Vec<String>,
    root_disk_failure: Option<MockFailure>,
    root_disks_replaced: BTreeSet<String>,
    events: Vec<HostEvent>,
    upgradable: HashSet<String>,
}

/// Creates hosts named `host{index}.nodegrid.local`, each with a pool of
/// child addresses.
#[derive(Debug)]
pub struct MockHostProvisioner {
    /// Flavor of shared hosts. Exclusive hosts are sized to their child.
    shared_host_resources: Option<NodeResources>,
    slots_per_host: usize,
    state: Mutex<HostState>,
}

impl MockHostProvisioner {
    pub fn new() -> Self {
        Self {
            shared_host_resources: None,
            slots_per_host: 4,
            state: Mutex::new(HostState::default()),
        }
    }

    pub fn with_shared_host_resources(mut self, resources: NodeResources) -> Self {
        self.shared_host_resources = Some(resources);
        self
    }

    pub fn fail_provisioning(&self, failure: Option<MockFailure>) {
        self.state().provision_failure = failure;
    }

    pub fn fail_resume(&self, hostname: &str, failure: MockFailure) {
        self.state().resume_failures.insert(hostname.to_string(), failure);
    }

    pub fn add_event(&self, event: HostEvent) {
        self.state().events.push(event);
    }

    pub fn allow_flavor_upgrade(&self, host: &str) {
        self.state().upgradable.insert(host.to_string());
    }

    pub fn requests(&self) -> Vec<HostProvisionRequest> {
        self.state().requests.clone()
    }

    pub fn resumed(&self) -> Vec<String> {
        self.state().resumed.clone()
    }

    pub fn deprovisioned(&self) -> Vec<String> {
        self.state().deprovisioned.clone()
    }

    pub fn fail_root_disk_replacement(&self, failure: Option<MockFailure>) {
        self.state().root_disk_failure = failure;
    }

    pub fn replaced_root_disks(&self) -> Vec<String> {
        self.state().root_disks_replaced.iter().cloned().collect()
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn create_host(&self, request: &HostProvisionRequest, index: u64, now: u64) -> ProvisionedHost {
        let stem = format!("{}{index}", host_prefix(request.host_type));
        let resources = match (request.exclusive, self.shared_host_resources) {
            (false, Some(shared)) => shared,
            _ => request.resources,
        };
        let pool: Vec<IpSlot> = (1..=self.slots_per_host)
            .map(|k| IpSlot::new(format!("{stem}-{k}.{DOMAIN}"), address(index, k as u64)))
            .collect();

        let mut host = Node::new(
            format!("{stem}.{DOMAIN}"),
            request.host_type,
            Flavor::custom(resources),
            NodeState::Provisioned,
            now,
        )
        .with_cloud_account(request.cloud_account.clone());
        if request.exclusive {
            host = host.with_exclusive_to(Some(request.owner.clone()), Some(request.cluster_type));
        }
        host.status.current_os_version = request.os_version.clone();
        host.ip_config = IpConfig::default().with_pool(pool.clone());

        let child_type = request.host_type.child_type().unwrap_or(NodeType::Tenant);
        let slot = &pool[0];
        let child = Node::child(
            slot.hostname.clone(),
            &host,
            child_type,
            request.resources.with_tags_of(&resources),
            now,
        )
        .with_ip_config(IpConfig::default().with_primary(vec![slot.address.clone()]));
        ProvisionedHost { host, child }
    }
}

impl Default for MockHostProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl HostProvisioner for MockHostProvisioner {
    fn provision_hosts(
        &self,
        request: &HostProvisionRequest,
        on_provisioned: &mut ProvisionedCallback<'_>,
    ) -> ProvisionResult<()> {
        let failure = {
            let mut state = self.state();
            state.requests.push(request.clone());
            state.provision_failure
        };
        match failure {
            Some(MockFailure::Fatal) => {
                return Err(ProvisionError::FatalProvisioning {
                    hostname: format!("{} new hosts", request.count()),
                    message: "no capacity".to_string(),
                });
            }
            Some(MockFailure::Throttled) => {
                return Err(ProvisionError::Throttled("too many requests".to_string()));
            }
            _ => {}
        }

        let now = epoch_secs();
        let hosts: Vec<ProvisionedHost> = request
            .indices
            .iter()
            .map(|index| self.create_host(request, *index, now))
            .collect();
        debug!(count = hosts.len(), host_type = %request.host_type, "mock hosts created");
        let first = hosts.first().map(|h| h.host.hostname.clone()).unwrap_or_default();
        on_provisioned(hosts)?;

        if failure == Some(MockFailure::AfterProvisioned) {
            return Err(ProvisionError::FatalProvisioning {
                hostname: first,
                message: "host failed to boot".to_string(),
            });
        }
        Ok(())
    }

    fn provision(&self, host: &Node) -> ProvisionResult<IpConfig> {
        let mut state = self.state();
        match state.resume_failures.get(&host.hostname) {
            Some(MockFailure::Throttled) => {
                return Err(ProvisionError::Throttled("too many requests".to_string()));
            }
            Some(_) => {
                return Err(ProvisionError::FatalProvisioning {
                    hostname: host.hostname.clone(),
                    message: "host failed to boot".to_string(),
                });
            }
            None => {}
        }
        state.resumed.push(host.hostname.clone());
        let primary = host
            .ip_config
            .pool
            .first()
            .and_then(|slot| slot.address.rsplit_once('.'))
            .map(|(network, _)| format!("{network}.0"))
            .into_iter()
            .collect();
        Ok(host.ip_config.clone().with_primary(primary))
    }

    fn deprovision(&self, host: &Node) -> ProvisionResult<()> {
        self.state().deprovisioned.push(host.hostname.clone());
        Ok(())
    }

    fn replace_root_disk(&self, host: &Node) -> ProvisionResult<Node> {
        let mut state = self.state();
        match state.root_disk_failure {
            Some(MockFailure::Throttled) => {
                return Err(ProvisionError::Throttled("too many requests".to_string()));
            }
            Some(_) => {
                return Err(ProvisionError::FatalProvisioning {
                    hostname: host.hostname.clone(),
                    message: "disk replacement failed".to_string(),
                });
            }
            None => {}
        }
        if !state.root_disks_replaced.insert(host.hostname.clone()) {
            debug!(hostname = %host.hostname, "root disk already replaced");
        }
        Ok(host.clone())
    }

    fn host_events_in(&self, _accounts: &[CloudAccount]) -> ProvisionResult<Vec<HostEvent>> {
        Ok(self.state().events.clone())
    }

    fn can_upgrade_flavor(&self, host: &Node, _child: &Node) -> bool {
        self.state().upgradable.contains(&host.hostname)
    }
}

fn host_prefix(host_type: NodeType) -> &'static str {
    match host_type {
        NodeType::ProxyHost => "proxyhost",
        NodeType::ConfigHost => "cfghost",
        NodeType::ControllerHost => "controllerhost",
        _ => "host",
    }
}

fn address(index: u64, slot: u64) -> String {
    format!("10.{}.{}.{}", index / 250, index % 250, slot)
}

// ── Load balancer service ──────────────────────────────────────────

#[derive(Debug, Default)]
struct BalancerState {
    instances: HashMap<LoadBalancerId, LoadBalancerInstance>,
    removed: Vec<LoadBalancerId>,
    failing: bool,
}

/// Keeps load balancer instances in a map. Supports container clusters on
/// tenant nodes.
#[derive(Debug, Default)]
pub struct MockLoadBalancerService {
    state: Mutex<BalancerState>,
}

impl MockLoadBalancerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.state().failing = failing;
    }

    pub fn instance(&self, id: &LoadBalancerId) -> Option<LoadBalancerInstance> {
        self.state().instances.get(id).cloned()
    }

    pub fn removed(&self) -> Vec<LoadBalancerId> {
        self.state().removed.clone()
    }

    fn state(&self) -> MutexGuard<'_, BalancerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn unavailable(id: &LoadBalancerId) -> LoadBalancerError {
    LoadBalancerError::Service {
        id: id.to_string(),
        message: "service unavailable".to_string(),
    }
}

impl LoadBalancerService for MockLoadBalancerService {
    fn provision(&self, spec: &LoadBalancerSpec) -> Result<LoadBalancerInstance, LoadBalancerError> {
        let mut state = self.state();
        if state.failing {
            return Err(unavailable(&spec.id));
        }
        let name = spec.id_seed.get(..12).unwrap_or(&spec.id_seed);
        let instance = LoadBalancerInstance {
            hostname: Some(format!("lb-{name}.{DOMAIN}")),
            ip_address: None,
            ports: vec![4443],
            reals: spec.reals.clone(),
            settings: spec.settings.clone(),
            cloud_account: spec.cloud_account.clone(),
        };
        state.instances.insert(spec.id.clone(), instance.clone());
        Ok(instance)
    }

    fn configure(
        &self,
        instance: &LoadBalancerInstance,
        spec: &LoadBalancerSpec,
        _force_reload: bool,
    ) -> Result<LoadBalancerInstance, LoadBalancerError> {
        let mut state = self.state();
        if state.failing {
            return Err(unavailable(&spec.id));
        }
        if !state.instances.contains_key(&spec.id) {
            return Err(LoadBalancerError::Service {
                id: spec.id.to_string(),
                message: "no such load balancer".to_string(),
            });
        }
        let configured = instance.with_reals(spec.reals.clone());
        state.instances.insert(spec.id.clone(), configured.clone());
        Ok(configured)
    }

    fn remove(&self, load_balancer: &LoadBalancer) -> Result<(), LoadBalancerError> {
        let mut state = self.state();
        if state.failing {
            return Err(unavailable(&load_balancer.id));
        }
        state.instances.remove(&load_balancer.id);
        state.removed.push(load_balancer.id.clone());
        Ok(())
    }

    fn supports(&self, node_type: NodeType, cluster_type: ClusterType) -> bool {
        node_type == NodeType::Tenant && cluster_type.is_container()
    }

    fn protocol(&self, enclave: bool) -> Protocol {
        if enclave { Protocol::Ipv6 } else { Protocol::Ipv4 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> Node {
        Node::new(
            "host1.nodegrid.local",
            NodeType::Host,
            Flavor::custom(NodeResources::new(8.0, 32.0, 200.0, 10.0)),
            NodeState::Active,
            0,
        )
    }

    #[test]
    fn replacing_root_disk_twice_is_a_noop() {
        let provisioner = MockHostProvisioner::new();
        let first = provisioner.replace_root_disk(&host()).unwrap();
        let second = provisioner.replace_root_disk(&first).unwrap();

        assert_eq!(first, second);
        assert_eq!(provisioner.replaced_root_disks(), vec!["host1.nodegrid.local".to_string()]);
    }

    #[test]
    fn failed_root_disk_replacement_is_not_recorded() {
        let provisioner = MockHostProvisioner::new();
        provisioner.fail_root_disk_replacement(Some(MockFailure::Fatal));

        let err = provisioner.replace_root_disk(&host()).unwrap_err();
        assert!(matches!(err, ProvisionError::FatalProvisioning { .. }));
        assert!(provisioner.replaced_root_disks().is_empty());
    }
}
