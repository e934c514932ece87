//! Prepare → activate flows against the in-memory backends.

use std::sync::Arc;

use nodegrid_allocation::HostCapacity;
use nodegrid_core::config::FlavorConfig;
use nodegrid_core::{
    ApplicationId, ClusterId, ClusterSpec, ClusterType, Environment, Flavor, NodeResources,
    ZoneConfig,
};
use nodegrid_provision::{
    Capacity, HostResumeProvisioner, HostSpec, LoadBalancerExpirer, Maintainer, MockHostProvisioner,
    MockLoadBalancerService, ProvisionError, Provisioner, REAL_PORT, RestartFilter,
};
use nodegrid_state::{
    InMemoryLocks, IpConfig, IpSlot, LoadBalancerId, LoadBalancerState, Node, NodeList, NodeState,
    NodeType, StateStore, epoch_secs,
};
use semver::Version;

fn app() -> ApplicationId {
    ApplicationId::new("tenant", "music", "default")
}

fn container(id: &str) -> ClusterSpec {
    ClusterSpec::request(ClusterType::Container, ClusterId::new(id), Version::new(8, 1, 0))
}

fn content(id: &str) -> ClusterSpec {
    ClusterSpec::request(ClusterType::Content, ClusterId::new(id), Version::new(8, 1, 0))
}

fn host_resources() -> NodeResources {
    NodeResources::new(8.0, 64.0, 1000.0, 10.0)
}

/// An active host with three child address slots.
fn host(index: u32) -> Node {
    let pool = (1..=3)
        .map(|k| IpSlot::new(format!("host{index}-{k}.test"), format!("10.1.{index}.{k}")))
        .collect();
    Node::new(
        format!("host{index}.test"),
        NodeType::Host,
        Flavor::custom(host_resources()),
        NodeState::Active,
        0,
    )
    .with_ip_config(IpConfig::default().with_pool(pool))
}

fn store_with_hosts(count: u32) -> StateStore {
    let store = StateStore::open_in_memory().unwrap();
    let hosts: Vec<Node> = (1..=count).map(host).collect();
    store.put_nodes(&hosts).unwrap();
    store
}

fn provisioner(config: ZoneConfig, store: &StateStore) -> Provisioner {
    Provisioner::new(config, store.clone(), Arc::new(InMemoryLocks::new()), None, None).unwrap()
}

fn deploy(provisioner: &Provisioner, hosts: &[HostSpec], generation: u64) {
    let mut txn = provisioner.begin(&app()).unwrap();
    provisioner.activate(hosts, generation, &mut txn).unwrap();
    provisioner.commit(txn).unwrap();
}

fn snapshot(store: &StateStore) -> String {
    let mut nodes = store.nodes_uncached().unwrap().to_vec();
    nodes.sort_by(|a, b| a.hostname.cmp(&b.hostname));
    serde_json::to_string(&nodes).unwrap()
}

fn application_nodes(store: &StateStore, state: NodeState) -> NodeList {
    store.nodes_uncached().unwrap().owner(&app()).state(state)
}

#[test]
fn fresh_cluster_gets_consecutive_indices_in_one_group() {
    let store = store_with_hosts(3);
    let provisioner = provisioner(ZoneConfig::default(), &store);

    let hosts = provisioner
        .prepare(&app(), &container("web"), &Capacity::of(3, 1))
        .unwrap();

    let indices: Vec<u32> = hosts.iter().map(|h| h.membership.index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    assert!(hosts.iter().all(|h| h.membership.cluster.group == Some(0)));
    assert!(hosts.iter().all(|h| !h.membership.retired));
    assert_eq!(application_nodes(&store, NodeState::Reserved).len(), 3);

    // Each node lands on its own host.
    let all = store.nodes_uncached().unwrap();
    let mut parents: Vec<String> = hosts
        .iter()
        .map(|h| all.node(&h.hostname).unwrap().parent_hostname.clone().unwrap())
        .collect();
    parents.sort();
    parents.dedup();
    assert_eq!(parents.len(), 3);
}

#[test]
fn repeated_prepare_is_identical_and_writes_nothing() {
    let store = store_with_hosts(3);
    let provisioner = provisioner(ZoneConfig::default(), &store);
    let capacity = Capacity::of(2, 1);

    let first = provisioner.prepare(&app(), &container("web"), &capacity).unwrap();
    let before = snapshot(&store);
    let second = provisioner.prepare(&app(), &container("web"), &capacity).unwrap();

    assert_eq!(
        serde_json::to_vec(&first).unwrap(),
        serde_json::to_vec(&second).unwrap()
    );
    assert_eq!(snapshot(&store), before);

    // Also after activation.
    deploy(&provisioner, &first, 1);
    let before = snapshot(&store);
    let third = provisioner.prepare(&app(), &container("web"), &capacity).unwrap();
    assert_eq!(third, first);
    assert_eq!(snapshot(&store), before);
}

#[test]
fn single_node_content_cluster_in_prod_is_rejected_untouched() {
    let store = store_with_hosts(3);
    let provisioner = provisioner(ZoneConfig::default(), &store);
    let before = snapshot(&store);

    let err = provisioner
        .prepare(&app(), &content("music"), &Capacity::of(1, 1))
        .unwrap_err();

    assert!(err.to_string().contains("redundancy"), "{err}");
    assert!(!err.is_retryable());
    assert_eq!(snapshot(&store), before);
}

#[test]
fn single_node_is_fine_outside_prod() {
    let mut config = ZoneConfig::default();
    config.zone.environment = Environment::Dev;
    let store = store_with_hosts(1);
    let provisioner = provisioner(config, &store);

    let hosts = provisioner
        .prepare(&app(), &content("music"), &Capacity::of(3, 1))
        .unwrap();
    assert_eq!(hosts.len(), 1);
}

fn flavor(name: &str, vcpu: f64, memory_gb: f64, disk_gb: f64) -> FlavorConfig {
    FlavorConfig {
        name: name.to_string(),
        vcpu,
        memory_gb,
        disk_gb,
        bandwidth_gbps: 1.0,
        ..FlavorConfig::default()
    }
}

#[test]
fn incompatible_active_nodes_are_retired_before_removal() {
    let mut config = ZoneConfig::default();
    config.flavors = vec![flavor("small", 2.0, 8.0, 50.0), flavor("large", 4.0, 16.0, 100.0)];
    let graph = config.flavor_graph().unwrap();
    let store = StateStore::open_in_memory().unwrap();
    let bare = |name: &str, flavor: &str, address: &str| {
        Node::new(
            format!("{name}.test"),
            NodeType::Tenant,
            graph.flavor(flavor).unwrap(),
            NodeState::Ready,
            0,
        )
        .with_ip_config(IpConfig::default().with_primary(vec![address.to_string()]))
    };
    store
        .put_nodes(&[
            bare("small1", "small", "10.2.0.1"),
            bare("small2", "small", "10.2.0.2"),
            bare("large1", "large", "10.2.0.3"),
            bare("large2", "large", "10.2.0.4"),
        ])
        .unwrap();
    let provisioner = provisioner(config, &store);

    let small = provisioner
        .prepare(&app(), &container("web"), &Capacity::of(2, 1).with_flavor("small"))
        .unwrap();
    deploy(&provisioner, &small, 1);

    let large = provisioner
        .prepare(&app(), &container("web"), &Capacity::of(2, 1).with_flavor("large"))
        .unwrap();
    assert_eq!(large.len(), 4);
    let retired: Vec<&str> = large
        .iter()
        .filter(|h| h.membership.retired)
        .map(|h| h.hostname.as_str())
        .collect();
    assert_eq!(retired.len(), 2);
    assert!(retired.iter().all(|h| h.starts_with("small")));

    deploy(&provisioner, &large, 2);
    let active = application_nodes(&store, NodeState::Active);
    assert_eq!(active.len(), 4);
    assert_eq!(active.retired().len(), 2);
}

#[test]
fn shrinking_to_one_group_keeps_all_nodes() {
    let store = store_with_hosts(4);
    let provisioner = provisioner(ZoneConfig::default(), &store);

    let two_groups = provisioner
        .prepare(&app(), &content("music"), &Capacity::of(4, 2))
        .unwrap();
    for group in [0, 1] {
        let size = two_groups
            .iter()
            .filter(|h| h.membership.cluster.group == Some(group))
            .count();
        assert_eq!(size, 2);
    }
    deploy(&provisioner, &two_groups, 1);

    let one_group = provisioner
        .prepare(&app(), &content("music"), &Capacity::of(4, 1))
        .unwrap();
    assert_eq!(one_group.len(), 4);
    assert!(one_group.iter().all(|h| h.membership.cluster.group == Some(0)));
    assert!(one_group.iter().all(|h| !h.membership.retired));

    let mut before: Vec<&str> = two_groups.iter().map(|h| h.hostname.as_str()).collect();
    let mut after: Vec<&str> = one_group.iter().map(|h| h.hostname.as_str()).collect();
    before.sort();
    after.sort();
    assert_eq!(before, after);
}

#[test]
fn host_capacity_reflects_accepted_node() {
    let mut config = ZoneConfig::default();
    config.zone.environment = Environment::Dev;
    let store = store_with_hosts(1);
    let provisioner = provisioner(config, &store);
    let wanted = NodeResources::new(2.0, 8.0, 50.0, 1.0);

    let before = store.nodes_uncached().unwrap();
    let host = before.node("host1.test").unwrap();
    let capacity = HostCapacity::new(&before);
    assert!(capacity.has_capacity(host, &wanted));
    let free_before = capacity.free_capacity_of(host, false);

    provisioner
        .prepare(&app(), &container("web"), &Capacity::of(1, 1).with_resources(wanted))
        .unwrap();

    let after = store.nodes_uncached().unwrap();
    let host = after.node("host1.test").unwrap();
    let free_after = HostCapacity::new(&after).free_capacity_of(host, false);
    assert_eq!(free_after.vcpu, free_before.vcpu - wanted.vcpu);
    assert_eq!(free_after.memory_gb, free_before.memory_gb - wanted.memory_gb);
    assert_eq!(free_after.disk_gb, free_before.disk_gb - wanted.disk_gb);
}

#[test]
fn lower_generation_cannot_be_activated() {
    let store = store_with_hosts(3);
    let provisioner = provisioner(ZoneConfig::default(), &store);
    let hosts = provisioner
        .prepare(&app(), &container("web"), &Capacity::of(2, 1))
        .unwrap();
    deploy(&provisioner, &hosts, 5);

    let mut txn = provisioner.begin(&app()).unwrap();
    let err = provisioner.activate(&hosts, 4, &mut txn).unwrap_err();
    assert!(matches!(err, ProvisionError::ActivationConflict(_)));
    assert_eq!(store.activated_generation(&app()).unwrap(), Some(5));
}

#[test]
fn unprepared_host_cannot_be_activated() {
    let store = store_with_hosts(3);
    let provisioner = provisioner(ZoneConfig::default(), &store);
    let mut hosts = provisioner
        .prepare(&app(), &container("web"), &Capacity::of(2, 1))
        .unwrap();
    hosts[0].hostname = "host3-3.test".to_string();

    let mut txn = provisioner.begin(&app()).unwrap();
    assert!(matches!(
        provisioner.activate(&hosts, 1, &mut txn),
        Err(ProvisionError::ActivationConflict(_))
    ));
}

#[test]
fn activation_deactivates_dropped_nodes() {
    let store = store_with_hosts(3);
    let provisioner = provisioner(ZoneConfig::default(), &store);
    let hosts = provisioner
        .prepare(&app(), &container("web"), &Capacity::of(3, 1))
        .unwrap();
    deploy(&provisioner, &hosts, 1);

    deploy(&provisioner, &hosts[..2], 2);
    assert_eq!(application_nodes(&store, NodeState::Active).len(), 2);
    let inactive = application_nodes(&store, NodeState::Inactive);
    assert_eq!(inactive.hostnames(), vec![hosts[2].hostname.clone()]);
}

#[test]
fn restart_bumps_wanted_generation_of_matching_nodes() {
    let store = store_with_hosts(3);
    let provisioner = provisioner(ZoneConfig::default(), &store);
    let web = provisioner
        .prepare(&app(), &container("web"), &Capacity::of(2, 1))
        .unwrap();
    let music = provisioner
        .prepare(&app(), &content("music"), &Capacity::of(2, 1))
        .unwrap();
    let all: Vec<HostSpec> = web.iter().chain(&music).cloned().collect();
    deploy(&provisioner, &all, 1);

    let filter = RestartFilter::all().with_cluster_type(ClusterType::Content);
    assert_eq!(provisioner.restart(&app(), &filter).unwrap(), 2);

    for node in &application_nodes(&store, NodeState::Active) {
        let generation = node.allocation.as_ref().unwrap().restart_generation;
        let is_music = node.membership().unwrap().cluster.cluster_type == ClusterType::Content;
        assert_eq!(generation.wanted, u64::from(is_music));
        assert_eq!(generation.pending(), is_music);
    }
}

#[test]
fn load_balancer_follows_cluster_lifecycle() {
    let store = store_with_hosts(3);
    let service = Arc::new(MockLoadBalancerService::new());
    let provisioner = Provisioner::new(
        ZoneConfig::default(),
        store.clone(),
        Arc::new(InMemoryLocks::new()),
        None,
        Some(service.clone()),
    )
    .unwrap();
    let id = LoadBalancerId::new(app(), ClusterId::new("web"));

    let web = provisioner
        .prepare(&app(), &container("web"), &Capacity::of(2, 1))
        .unwrap();
    let music = provisioner
        .prepare(&app(), &content("music"), &Capacity::of(2, 1))
        .unwrap();
    let lb = store.get_load_balancer(&id).unwrap().unwrap();
    assert_eq!(lb.state, LoadBalancerState::Reserved);
    assert!(lb.instance.is_some());
    // Content clusters get no load balancer.
    assert_eq!(store.load_balancers().unwrap().len(), 1);

    let all: Vec<HostSpec> = web.iter().chain(&music).cloned().collect();
    deploy(&provisioner, &all, 1);
    let lb = store.get_load_balancer(&id).unwrap().unwrap();
    assert_eq!(lb.state, LoadBalancerState::Active);
    let reals = &lb.instance.as_ref().unwrap().reals;
    let mut hostnames: Vec<&str> = reals.iter().map(|r| r.hostname.as_str()).collect();
    hostnames.sort();
    let mut expected: Vec<&str> = web.iter().map(|h| h.hostname.as_str()).collect();
    expected.sort();
    assert_eq!(hostnames, expected);
    assert!(reals.iter().all(|r| r.port == REAL_PORT && r.ip_address.starts_with("10.1.")));
    assert_eq!(service.instance(&id).unwrap().reals, *reals);

    let mut txn = provisioner.begin(&app()).unwrap();
    provisioner.remove(&mut txn).unwrap();
    provisioner.commit(txn).unwrap();
    assert!(application_nodes(&store, NodeState::Active).is_empty());
    assert_eq!(application_nodes(&store, NodeState::Inactive).len(), 4);
    let lb = store.get_load_balancer(&id).unwrap().unwrap();
    assert_eq!(lb.state, LoadBalancerState::Inactive);

    let expirer = LoadBalancerExpirer::new(
        store.clone(),
        Arc::new(InMemoryLocks::new()),
        service.clone(),
        &ZoneConfig::default().provisioning,
    );
    let later = epoch_secs() + ZoneConfig::default().provisioning.load_balancer_expiry_secs;
    assert_eq!(expirer.maintain(later).unwrap(), 1);
    assert!(store.get_load_balancer(&id).unwrap().is_none());
    assert_eq!(service.removed(), vec![id]);
}

#[test]
fn dynamic_zone_provisions_and_resumes_hosts() {
    let mut config = ZoneConfig::default();
    config.zone.cloud.dynamic_provisioning = true;
    let store = StateStore::open_in_memory().unwrap();
    let host_provisioner = Arc::new(MockHostProvisioner::new());
    let locks = Arc::new(InMemoryLocks::new());
    let provisioner = Provisioner::new(
        config.clone(),
        store.clone(),
        locks.clone(),
        Some(host_provisioner.clone()),
        None,
    )
    .unwrap();

    let hosts = provisioner
        .prepare(&app(), &container("web"), &Capacity::of(2, 1))
        .unwrap();
    assert_eq!(hosts.len(), 2);
    assert_eq!(host_provisioner.requests().len(), 1);
    let provisioned = store.nodes_uncached().unwrap().hosts();
    assert_eq!(provisioned.state(NodeState::Provisioned).len(), 2);

    let resumer = HostResumeProvisioner::new(store.clone(), locks, host_provisioner.clone(), &config.provisioning);
    assert_eq!(resumer.maintain(epoch_secs()).unwrap(), 2);
    assert_eq!(store.nodes_uncached().unwrap().hosts().state(NodeState::Ready).len(), 2);

    deploy(&provisioner, &hosts, 1);
    assert_eq!(application_nodes(&store, NodeState::Active).len(), 2);

    // Nothing new is asked of the cloud on redeploy.
    provisioner
        .prepare(&app(), &container("web"), &Capacity::of(2, 1))
        .unwrap();
    assert_eq!(host_provisioner.requests().len(), 1);
}

#[test]
fn host_specs_carry_zone_maps() {
    let store = store_with_hosts(3);
    store.set_docker_image(NodeType::Tenant, "registry.test/nodegrid:8").unwrap();
    store
        .set_archive_uri("tenant", Some("s3://archive/tenant/"))
        .unwrap();
    let provisioner = provisioner(ZoneConfig::default(), &store);

    let hosts = provisioner
        .prepare(&app(), &container("web"), &Capacity::of(2, 1))
        .unwrap();
    for host in &hosts {
        assert_eq!(host.docker_image.as_deref(), Some("registry.test/nodegrid:8"));
        assert_eq!(host.archive_uri.as_deref(), Some("s3://archive/tenant/"));
        assert!(host.real_resources.memory_gb < host.advertised_resources.memory_gb);
    }
}

#[test]
fn state_survives_reopening_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nodegrid.redb");
    let hostnames = {
        let store = StateStore::open(&path).unwrap();
        store.put_nodes(&[host(1), host(2), host(3)]).unwrap();
        let provisioner = provisioner(ZoneConfig::default(), &store);
        let hosts = provisioner
            .prepare(&app(), &container("web"), &Capacity::of(2, 1))
            .unwrap();
        deploy(&provisioner, &hosts, 3);
        hosts.into_iter().map(|h| h.hostname).collect::<Vec<_>>()
    };

    let store = StateStore::open(&path).unwrap();
    assert_eq!(store.activated_generation(&app()).unwrap(), Some(3));
    let mut active = application_nodes(&store, NodeState::Active).hostnames();
    active.sort();
    let mut expected = hostnames;
    expected.sort();
    assert_eq!(active, expected);
}
