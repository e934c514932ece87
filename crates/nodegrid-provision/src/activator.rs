//! Activation of prepared nodes.

use std::collections::HashMap;
use std::sync::Arc;

use nodegrid_state::{ApplicationTransaction, Node, NodeList, NodeState, StateStore};
use tracing::info;

use crate::error::{ProvisionError, ProvisionResult};
use crate::load_balancer::LoadBalancerProvisioner;
use crate::provisioner::HostSpec;

/// Turns a prepared host list into the application's active node set.
///
/// Reserved nodes in the list become active, active nodes missing from it
/// become inactive. Nothing is reserved here: every host must already be
/// allocated to the application.
pub struct Activator {
    store: StateStore,
    load_balancers: Option<Arc<LoadBalancerProvisioner>>,
}

impl Activator {
    pub fn new(store: StateStore, load_balancers: Option<Arc<LoadBalancerProvisioner>>) -> Self {
        Self {
            store,
            load_balancers,
        }
    }

    /// Add the activation of `hosts` at `generation` to `transaction`.
    pub fn activate(
        &self,
        hosts: &[HostSpec],
        generation: u64,
        transaction: &mut ApplicationTransaction,
        now: u64,
    ) -> ProvisionResult<()> {
        let application = transaction.application().clone();
        if let Some(current) = self.store.activated_generation(&application)? {
            if generation < current {
                return Err(ProvisionError::ActivationConflict(format!(
                    "cannot activate generation {generation} of {application}, generation {current} is already active"
                )));
            }
        }

        let application_nodes = self.store.nodes_uncached()?.owner(&application);
        let wanted: HashMap<&str, &HostSpec> = hosts.iter().map(|h| (h.hostname.as_str(), h)).collect();
        for host in hosts {
            let Some(node) = application_nodes.node(&host.hostname) else {
                return Err(ProvisionError::ActivationConflict(format!(
                    "{} is not allocated to {application}",
                    host.hostname
                )));
            };
            if !matches!(node.state, NodeState::Reserved | NodeState::Active) {
                return Err(ProvisionError::ActivationConflict(format!(
                    "{} is {}, expected reserved or active",
                    host.hostname, node.state
                )));
            }
        }

        let mut active = Vec::new();
        let mut changed = Vec::new();
        let (mut activated, mut deactivated) = (0, 0);
        for node in &application_nodes {
            match (node.state, wanted.get(node.hostname.as_str())) {
                (NodeState::Reserved, Some(host)) => {
                    let node = with_host_info(node, host).with_state(NodeState::Active, now);
                    activated += 1;
                    active.push(node.clone());
                    changed.push(node);
                }
                (NodeState::Active, Some(host)) => {
                    let updated = with_host_info(node, host);
                    if updated != *node {
                        changed.push(updated.clone());
                    }
                    active.push(updated);
                }
                (NodeState::Active, None) => {
                    deactivated += 1;
                    changed.push(node.with_state(NodeState::Inactive, now));
                }
                _ => {}
            }
        }
        transaction.put_nodes(changed);

        if let Some(load_balancers) = &self.load_balancers {
            load_balancers.activate(&NodeList::new(active), transaction, now)?;
        }
        transaction.set_generation(generation);
        info!(%application, generation, activated, deactivated, "activation prepared");
        Ok(())
    }
}

/// `node` with the membership and ports the host list assigns it.
fn with_host_info(node: &Node, host: &HostSpec) -> Node {
    let Some(allocation) = &node.allocation else {
        return node.clone();
    };
    let mut allocation = allocation.with_membership(host.membership.clone());
    if !host.network_ports.is_empty() {
        allocation = allocation.with_network_ports(host.network_ports.clone());
    }
    node.with_allocation(allocation)
}
