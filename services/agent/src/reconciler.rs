//! Desired-vs-actual reconciliation.
//!
//! The planner compares the node descriptor with the live instance map
//! and emits create / update / delete actions; the applier executes them
//! with either the all-at-once strategy (every action attempted, errors
//! collected) or the rolling strategy (deletes, then creates, then
//! updates one at a time with a cancellable pause between them).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use firework_spec::NodeDescriptor;
use firework_spec::ServiceDescriptor;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::UpdateStrategy;
use crate::healthcheck::Monitor;
use crate::network::NetworkManager;
use crate::vm::{Instance, VmRuntime, VmState};

/// A reconciliation action.
#[derive(Debug, Clone)]
pub enum Action {
    Create {
        service: ServiceDescriptor,
    },
    /// Carries the previous descriptor so the applier can tear down the
    /// old network identity, which may differ from the new one.
    Update {
        service: ServiceDescriptor,
        previous: ServiceDescriptor,
    },
    /// Carries the captured descriptor so teardown can undo networking
    /// and port forwards.
    Delete {
        service: ServiceDescriptor,
    },
}

/// Plans and applies VM changes.
pub struct Reconciler {
    vm: Arc<dyn VmRuntime>,
    health: Option<Arc<Monitor>>,
    network: Option<Arc<NetworkManager>>,
    strategy: UpdateStrategy,
    update_delay: Duration,
}

impl Reconciler {
    pub fn new(
        vm: Arc<dyn VmRuntime>,
        health: Option<Arc<Monitor>>,
        network: Option<Arc<NetworkManager>>,
        strategy: UpdateStrategy,
        update_delay: Duration,
    ) -> Self {
        Self {
            vm,
            health,
            network,
            strategy,
            update_delay,
        }
    }

    /// Compute the actions needed to reach the desired state.
    pub fn plan(&self, desired: &NodeDescriptor) -> Vec<Action> {
        let actual = self.vm.list();
        let mut actions = Vec::new();

        for svc in &desired.services {
            match actual.get(&svc.name) {
                None => actions.push(Action::Create {
                    service: svc.clone(),
                }),
                Some(inst) if needs_update(inst, svc) => actions.push(Action::Update {
                    service: svc.clone(),
                    previous: inst.descriptor.clone(),
                }),
                Some(_) => {}
            }
        }

        // Instances with no desired counterpart are deleted using their
        // captured descriptor, in stable order.
        let mut stale: Vec<&Instance> = actual
            .values()
            .filter(|inst| !desired.services.iter().any(|svc| svc.name == inst.name))
            .collect();
        stale.sort_by(|a, b| a.name.cmp(&b.name));
        for inst in stale {
            actions.push(Action::Delete {
                service: inst.descriptor.clone(),
            });
        }

        actions
    }

    /// Plan and apply in one step.
    pub async fn reconcile(
        &self,
        desired: &NodeDescriptor,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let actions = self.plan(desired);

        if actions.is_empty() {
            debug!("no changes needed, state is converged");
            return Ok(());
        }

        let (creates, updates, deletes) = count_actions(&actions);
        info!(creates, updates, deletes, "reconciliation plan");

        self.apply(actions, shutdown).await
    }

    /// Execute the actions with the configured strategy.
    pub async fn apply(
        &self,
        actions: Vec<Action>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        match self.strategy {
            UpdateStrategy::Rolling => self.apply_rolling(actions, shutdown).await,
            UpdateStrategy::AllAtOnce => self.apply_all_at_once(actions).await,
        }
    }

    /// Apply every action in input order; failures are collected and the
    /// rest still run.
    async fn apply_all_at_once(&self, actions: Vec<Action>) -> Result<()> {
        let mut errs = Vec::new();

        for action in actions {
            match action {
                Action::Create { service } => {
                    info!(service = %service.name, "creating service");
                    if let Err(e) = self.create_service(&service).await {
                        error!(service = %service.name, error = %e, "failed to create service");
                        errs.push(format!("create {}: {e:#}", service.name));
                    }
                }
                Action::Update { service, previous } => {
                    info!(service = %service.name, "updating service (stop + start)");
                    self.delete_service(&previous).await;
                    if let Err(e) = self.create_service(&service).await {
                        error!(service = %service.name, error = %e, "failed to start service during update");
                        errs.push(format!("update {}: {e:#}", service.name));
                    }
                }
                Action::Delete { service } => {
                    info!(service = %service.name, "deleting service");
                    self.delete_service(&service).await;
                }
            }
        }

        if !errs.is_empty() {
            bail!("reconciliation had {} error(s): {}", errs.len(), errs.join("; "));
        }
        Ok(())
    }

    /// Deletes first, then creates, then updates one at a time with a
    /// pause between them (not after the last). A failed update skips the
    /// remaining updates; a cancelled pause aborts the apply.
    async fn apply_rolling(
        &self,
        actions: Vec<Action>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let mut errs = Vec::new();

        for action in &actions {
            if let Action::Delete { service } = action {
                info!(service = %service.name, "deleting service");
                self.delete_service(service).await;
            }
        }

        for action in &actions {
            if let Action::Create { service } = action {
                info!(service = %service.name, "creating service");
                if let Err(e) = self.create_service(service).await {
                    error!(service = %service.name, error = %e, "failed to create service");
                    errs.push(format!("create {}: {e:#}", service.name));
                }
            }
        }

        let updates: Vec<_> = actions
            .iter()
            .filter_map(|a| match a {
                Action::Update { service, previous } => Some((service, previous)),
                _ => None,
            })
            .collect();
        let total = updates.len();

        for (i, (service, previous)) in updates.into_iter().enumerate() {
            info!(service = %service.name, "updating service (stop + start)");
            self.delete_service(previous).await;
            if let Err(e) = self.create_service(service).await {
                error!(service = %service.name, error = %e, "failed to start service during update");
                errs.push(format!("update {}: {e:#}", service.name));
                break;
            }

            if i < total - 1 && !self.update_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.update_delay) => {}
                    _ = shutdown.changed() => {
                        bail!("rolling update interrupted");
                    }
                }
            }
        }

        if !errs.is_empty() {
            bail!("reconciliation had {} error(s): {}", errs.len(), errs.join("; "));
        }
        Ok(())
    }

    /// Acquire networking, start the VM (rolling back the network on
    /// failure), add port forwards, and register the liveness probe.
    async fn create_service(&self, svc: &ServiceDescriptor) -> Result<()> {
        if let Some(network) = &self.network {
            network.setup(svc).await.context("network setup")?;
        }

        if let Err(e) = self.vm.start(svc).await {
            if let Some(network) = &self.network {
                let _ = network.teardown(svc).await;
            }
            return Err(e).context("starting VM");
        }

        if let Some(network) = &self.network {
            if let Some(net) = &svc.network {
                let guest_ip = net.guest_ip.as_deref().unwrap_or_default();
                for forward in &svc.port_forwards {
                    if let Err(e) = network
                        .setup_port_forward(
                            forward.host_port,
                            firework_spec::strip_cidr(guest_ip),
                            forward.vm_port,
                        )
                        .await
                    {
                        warn!(
                            service = %svc.name,
                            host_port = forward.host_port,
                            error = %e,
                            "failed to setup port forward"
                        );
                    }
                }
            }
        }

        if let Some(health) = &self.health {
            health.register(svc);
        }

        Ok(())
    }

    /// Deregister the probe, remove port forwards, stop the VM, and tear
    /// down networking. Teardown failures are logged and survived.
    async fn delete_service(&self, svc: &ServiceDescriptor) {
        if let Some(health) = &self.health {
            health.deregister(&svc.name);
        }

        if let Some(network) = &self.network {
            if let Some(net) = &svc.network {
                let guest_ip = net.guest_ip.as_deref().unwrap_or_default();
                for forward in &svc.port_forwards {
                    if let Err(e) = network
                        .teardown_port_forward(
                            forward.host_port,
                            firework_spec::strip_cidr(guest_ip),
                            forward.vm_port,
                        )
                        .await
                    {
                        warn!(
                            service = %svc.name,
                            host_port = forward.host_port,
                            error = %e,
                            "failed to teardown port forward"
                        );
                    }
                }
            }
        }

        if let Err(e) = self.vm.remove(&svc.name).await {
            warn!(service = %svc.name, error = %e, "failed to remove VM");
        }

        if let Some(network) = &self.network {
            if let Err(e) = network.teardown(svc).await {
                warn!(service = %svc.name, error = %e, "failed to tear down network");
            }
        }
    }
}

/// A live instance needs recreating when any launch-relevant field
/// differs from the desired descriptor, or when the VM is no longer
/// Running (crashed services are recreated on the next tick).
fn needs_update(inst: &Instance, desired: &ServiceDescriptor) -> bool {
    let cur = &inst.descriptor;

    cur.image != desired.image
        || cur.kernel != desired.kernel
        || cur.vcpus != desired.vcpus
        || cur.memory_mb != desired.memory_mb
        || cur.kernel_args != desired.kernel_args
        || cur.network != desired.network
        || cur.port_forwards != desired.port_forwards
        || inst.state != VmState::Running
}

fn count_actions(actions: &[Action]) -> (usize, usize, usize) {
    let mut counts = (0, 0, 0);
    for action in actions {
        match action {
            Action::Create { .. } => counts.0 += 1,
            Action::Update { .. } => counts.1 += 1,
            Action::Delete { .. } => counts.2 += 1,
        }
    }
    counts
}
