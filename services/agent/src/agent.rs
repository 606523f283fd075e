//! The agent's reconciliation loop.
//!
//! A single-threaded loop that fires immediately on start and then on a
//! fixed interval. Each tick publishes node capacity, fetches and merges
//! the node's descriptors, assigns guest network identity, resolves
//! same-node links, injects environment into kernel arguments, gates on
//! capacity, syncs images, reconciles the VM population, and refreshes
//! the reverse-proxy config directory. Ticks never overlap and a failing
//! tick never terminates the agent; the next tick retries.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use firework_spec::{NodeDescriptor, ServiceDescriptor};
use firework_store::Store;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::api::{self, ApiState};
use crate::capacity::{CapacityReader, NodeCapacity, OsReader};
use crate::config::AgentConfig;
use crate::healthcheck::{tenant_for, Monitor, RestartFn};
use crate::imagesync::{DirImageSource, Syncer};
use crate::metrics::AgentMetrics;
use crate::network::{subnet_mask_bits, NetworkManager};
use crate::proxy::ProxyManager;
use crate::reconciler::Reconciler;
use crate::vm::{VmManager, VmRuntime};

/// The per-node reconciliation agent.
pub struct Agent {
    cfg: AgentConfig,
    store: Arc<dyn Store>,
    vm: Arc<VmManager>,
    reconciler: Reconciler,
    health: Option<Arc<Monitor>>,
    image_sync: Option<Syncer>,
    capacity: Option<Box<dyn CapacityReader>>,
    proxy: Option<ProxyManager>,
    metrics: Arc<AgentMetrics>,
    last_revision: Arc<Mutex<String>>,
}

impl Agent {
    /// Wire up the agent and initialize host networking.
    pub async fn new(cfg: AgentConfig, store: Arc<dyn Store>) -> Result<Agent> {
        let vm = Arc::new(VmManager::new(&cfg.hypervisor_bin, &cfg.state_dir));
        let metrics =
            Arc::new(AgentMetrics::new(&cfg.node_name).context("registering metrics")?);

        let health = if cfg.enable_health_checks {
            Some(Monitor::new(restart_fn(Arc::clone(&vm), Arc::clone(&metrics))))
        } else {
            None
        };

        let network = if cfg.enable_network_setup {
            let mut manager = NetworkManager::new();
            if !cfg.vm_bridge.is_empty() {
                if let Err(e) = manager
                    .init_bridge(&cfg.vm_bridge, &cfg.vm_gateway, &cfg.vm_subnet)
                    .await
                {
                    error!(error = %e, "failed to initialize shared bridge");
                }
                if let Some(out_interface) = &cfg.out_interface {
                    if let Err(e) = manager.setup_masquerade(&cfg.vm_subnet, out_interface).await
                    {
                        error!(error = %e, "failed to setup masquerade");
                    }
                }
            }
            Some(Arc::new(manager))
        } else {
            None
        };

        let reconciler = Reconciler::new(
            Arc::clone(&vm) as Arc<dyn VmRuntime>,
            health.clone(),
            network,
            cfg.update_strategy,
            cfg.update_delay.unwrap_or_default(),
        );

        let image_sync = cfg
            .image_source_dir
            .as_ref()
            .map(|src| Syncer::new(Box::new(DirImageSource::new(src)), &cfg.images_dir));

        let capacity: Option<Box<dyn CapacityReader>> = cfg
            .enable_capacity_check
            .then(|| Box::new(OsReader) as Box<dyn CapacityReader>);

        let proxy = cfg.proxy_config_dir.as_ref().map(ProxyManager::new);

        Ok(Agent {
            cfg,
            store,
            vm,
            reconciler,
            health,
            image_sync,
            capacity,
            proxy,
            metrics,
            last_revision: Arc::new(Mutex::new(String::new())),
        })
    }

    /// Run the reconciliation loop until shutdown is signalled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            node = %self.cfg.node_name,
            labels = ?self.cfg.node_names,
            poll_interval_secs = self.cfg.poll_interval.as_secs(),
            "agent starting"
        );

        if let Some(addr) = self.cfg.api_listen_addr {
            let state = ApiState {
                node: self.cfg.node_name.clone(),
                vm: Arc::clone(&self.vm) as Arc<dyn VmRuntime>,
                health: self.health.clone(),
                metrics: Arc::clone(&self.metrics),
                last_revision: Arc::clone(&self.last_revision),
            };
            let api_shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = api::serve(addr, state, api_shutdown).await {
                    error!(error = %e, "API server error");
                }
            });
        }

        // Ticks get their own receiver so a rolling-update pause can
        // observe shutdown while the loop watches the same channel.
        let mut tick_shutdown = shutdown.clone();

        // Initial convergence pass, then the fixed cadence.
        self.tick(&mut tick_shutdown).await;

        let mut ticker = tokio::time::interval(self.cfg.poll_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(&mut tick_shutdown).await;
                }
                changed = shutdown.changed() => {
                    // A closed channel means the process is going away too.
                    if changed.is_err() || *shutdown.borrow() {
                        info!("agent shutting down");
                        if let Some(health) = &self.health {
                            health.stop();
                        }
                        self.store.close().await;
                        return Ok(());
                    }
                }
            }
        }
    }

    /// A single reconciliation cycle.
    async fn tick(&self, shutdown: &mut watch::Receiver<bool>) {
        debug!("reconciliation tick starting");

        // Publish capacity unconditionally so the scheduler can discover
        // this node even before any descriptor is assigned to it. The
        // capacity gate below overwrites the used gauges with actuals.
        if let Some(reader) = &self.capacity {
            if let Ok(capacity) = reader.read() {
                self.metrics.set_capacity(capacity, NodeCapacity::default());
            }
        }

        let Some(mut merged) = self.fetch_and_merge().await else {
            // No local descriptor, but peers may still need proxy routes.
            self.sync_proxy_configs(&[]).await;
            return;
        };

        // Revision is checked after the fetch so transports that refresh
        // their revision during fetch are evaluated against fresh data.
        // Multi-label nodes never short-circuit: revisions are
        // store-scoped, not label-scoped.
        let mut revision = String::new();
        if self.cfg.node_names.len() == 1 {
            match self.store.revision().await {
                Ok(rev) => {
                    if !rev.is_empty() && rev == *self.last_revision.lock().unwrap() {
                        debug!(revision = %rev, "config unchanged, skipping reconciliation");
                        self.refresh_runtime_metrics();
                        return;
                    }
                    revision = rev;
                }
                Err(e) => {
                    error!(error = %e, "failed to get store revision");
                }
            }
        }

        assign_networking(&mut merged.services, &self.cfg.vm_subnet, &self.cfg.vm_gateway);
        resolve_links(&mut merged.services);
        inject_env_vars(&mut merged.services);

        if !self.check_capacity(&merged.services) {
            return;
        }

        if let Some(syncer) = &self.image_sync {
            let started = Instant::now();
            let result = syncer.sync(&merged.services).await;
            self.metrics
                .observe_image_sync(started.elapsed(), result.is_err());
            if let Err(e) = result {
                error!(error = %e, "image sync failed");
                return;
            }
        }

        let started = Instant::now();
        let result = self.reconciler.reconcile(&merged, shutdown).await;
        self.metrics
            .observe_reconcile(started.elapsed(), result.is_err());
        if let Err(e) = result {
            error!(error = %e, "reconciliation failed");
            return;
        }

        self.sync_proxy_configs(&merged.services).await;

        if !revision.is_empty() {
            *self.last_revision.lock().unwrap() = revision.clone();
        }
        let applied = if revision.is_empty() {
            self.last_revision.lock().unwrap().clone()
        } else {
            revision.clone()
        };
        self.metrics.record_config_apply(&applied, Utc::now());
        self.refresh_runtime_metrics();

        debug!(revision = %revision, "reconciliation tick completed");
    }

    /// Fetch descriptors for every configured label and merge the service
    /// lists (duplicates: last label wins). Returns `None` when every
    /// fetch failed; individual label failures are survived.
    async fn fetch_and_merge(&self) -> Option<NodeDescriptor> {
        let mut seen: HashMap<String, ServiceDescriptor> = HashMap::new();
        let mut fetched_any = false;

        for label in &self.cfg.node_names {
            let data = match self.store.fetch(label).await {
                Ok(data) => data,
                Err(e) => {
                    error!(label = %label, error = %e, "failed to fetch descriptor from store");
                    continue;
                }
            };
            self.metrics.record_config_fetch_success(label, Utc::now());
            if let Some(provider) = self.store.as_enrichment_timestamps() {
                if let Some(ts) = provider.last_enrichment_timestamp(label) {
                    self.metrics.record_enrichment_timestamp(label, ts);
                }
            }

            let nd = match firework_spec::parse_node_descriptor(&data) {
                Ok(nd) => nd,
                Err(e) => {
                    error!(label = %label, error = %e, "failed to parse node descriptor");
                    continue;
                }
            };

            fetched_any = true;
            for svc in nd.services {
                if seen.contains_key(&svc.name) {
                    warn!(service = %svc.name, label = %label,
                        "duplicate service across labels, last wins");
                }
                seen.insert(svc.name.clone(), svc);
            }
        }

        if !fetched_any {
            error!("all descriptor fetches failed");
            return None;
        }

        // Sorted by name: deterministic ordering drives IP allocation.
        let mut services: Vec<ServiceDescriptor> = seen.into_values().collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));

        Some(NodeDescriptor {
            node: self.cfg.node_name.clone(),
            services,
            ..Default::default()
        })
    }

    /// Compare requested resources against node capacity. Exceeding
    /// capacity is not an error; the tick is skipped with gauges updated.
    fn check_capacity(&self, services: &[ServiceDescriptor]) -> bool {
        let Some(reader) = &self.capacity else {
            return true;
        };

        let capacity = match reader.read() {
            Ok(capacity) => capacity,
            Err(e) => {
                debug!(error = %e, "capacity check skipped");
                return true;
            }
        };

        let used = sum_resources(services);
        self.metrics.set_capacity(capacity, used);

        if used.vcpus > capacity.vcpus || used.memory_mb > capacity.memory_mb {
            warn!(
                cap_vcpus = capacity.vcpus,
                used_vcpus = used.vcpus,
                cap_memory_mb = capacity.memory_mb,
                used_memory_mb = used.memory_mb,
                "desired services exceed node capacity, skipping reconciliation"
            );
            return false;
        }

        true
    }

    /// Synchronize reverse-proxy files for local services and, when the
    /// store can enumerate peers, remote routes for peer-node services.
    async fn sync_proxy_configs(&self, services: &[ServiceDescriptor]) {
        let Some(proxy) = &self.proxy else {
            return;
        };

        let mut remote_nodes = Vec::new();
        if let Some(lister) = self.store.as_lister() {
            match lister.list_all_node_descriptors().await {
                Ok(all) => {
                    remote_nodes = all
                        .into_iter()
                        .filter(|nd| !self.cfg.node_names.contains(&nd.node))
                        .collect();
                }
                Err(e) => {
                    warn!(error = %e, "failed to list peer descriptors, remote routing skipped");
                }
            }
        }

        if let Err(e) = proxy.sync(services, &remote_nodes) {
            warn!(error = %e, "failed to sync proxy configs");
        }
    }

    fn refresh_runtime_metrics(&self) {
        let results = self
            .health
            .as_ref()
            .map(|h| h.results())
            .unwrap_or_default();
        self.metrics.set_service_snapshot(&self.vm.list(), &results);
    }
}

/// Restart callback handed to the health monitor: stop + start through
/// the VM manager, counting the restart.
fn restart_fn(vm: Arc<VmManager>, metrics: Arc<AgentMetrics>) -> RestartFn {
    Arc::new(move |name: String| {
        let vm = Arc::clone(&vm);
        let metrics = Arc::clone(&metrics);
        Box::pin(async move {
            let Some(inst) = vm.get(&name) else {
                return Ok(());
            };
            metrics.record_service_restart(&name, &tenant_for(&inst.descriptor));
            if let Err(e) = vm.stop(&name).await {
                warn!(service = %name, error = %e, "failed to stop service during health restart");
            }
            vm.start(&inst.descriptor).await
        })
    })
}

/// Assign guest addresses, MACs, and the kernel IP autoconfig token to
/// every networked service. Services must already be sorted by name;
/// allocation is positional, so the same population always produces the
/// same addresses.
fn assign_networking(services: &mut [ServiceDescriptor], subnet: &str, gateway: &str) {
    if subnet.is_empty() {
        return;
    }

    let gateway = firework_spec::strip_cidr(gateway).to_string();
    let netmask = subnet_mask_bits(subnet);

    let base: Ipv4Addr = match firework_spec::strip_cidr(subnet).parse() {
        Ok(ip) => ip,
        Err(e) => {
            error!(subnet = %subnet, error = %e, "invalid vm_subnet");
            return;
        }
    };
    let octets = base.octets();

    let mut idx: u8 = 0;
    for svc in services.iter_mut() {
        let Some(network) = &mut svc.network else {
            continue;
        };

        let guest_ip = Ipv4Addr::new(octets[0], octets[1], octets[2], 2 + idx).to_string();
        let mac = format!("AA:FC:00:00:00:{:02X}", idx + 1);

        network.guest_ip = Some(guest_ip.clone());
        network.guest_mac = Some(mac);

        // Kernel IP autoconfig: the guest configures eth0 before init
        // runs, so no guest-side tooling is needed.
        let ip_arg = format!("ip={guest_ip}::{gateway}:{netmask}::eth0:off");
        if !has_kernel_arg_prefix(&svc.kernel_args, "ip=") {
            svc.kernel_args = insert_kernel_arg(&svc.kernel_args, &ip_arg);
        }

        idx += 1;
    }
}

/// Resolve same-node links to concrete URLs using each target's assigned
/// guest address, injected into the declaring service's env map. Must run
/// after networking assignment.
fn resolve_links(services: &mut [ServiceDescriptor]) {
    let ip_by_name: HashMap<String, String> = services
        .iter()
        .filter_map(|svc| {
            let ip = svc.network.as_ref()?.guest_ip.clone()?;
            Some((svc.name.clone(), ip))
        })
        .collect();

    for svc in services.iter_mut() {
        if svc.links.is_empty() {
            continue;
        }

        let links = svc.links.clone();
        for link in &links {
            let Some(target_ip) = ip_by_name.get(&link.service) else {
                warn!(service = %svc.name, link_target = %link.service,
                    "linked service not found or has no network");
                continue;
            };

            let scheme = link.protocol.as_deref().unwrap_or("http");
            let url = format!(
                "{scheme}://{}:{}",
                firework_spec::strip_cidr(target_ip),
                link.port
            );

            debug!(service = %svc.name, target = %link.service, env = %link.env, url = %url,
                "resolved service link");
            svc.env.insert(link.env.clone(), url);
        }
    }
}

/// Emit every env entry as a `firework.env.KEY=VALUE` kernel-argument
/// token (sorted by key), inserted before the `--` separator so the guest
/// init finds them in /proc/cmdline and exports them before launching the
/// workload.
fn inject_env_vars(services: &mut [ServiceDescriptor]) {
    for svc in services.iter_mut() {
        if svc.env.is_empty() {
            continue;
        }

        for (key, value) in &svc.env {
            let arg = format!("firework.env.{key}={value}");
            svc.kernel_args = insert_kernel_arg(&svc.kernel_args, &arg);
        }

        debug!(service = %svc.name, env_count = svc.env.len(),
            "injected env vars into kernel args");
    }
}

/// Whether the kernel-argument section (before any `--` separator)
/// already has a token with the given prefix.
fn has_kernel_arg_prefix(kernel_args: &str, prefix: &str) -> bool {
    for token in kernel_args.split_whitespace() {
        if token == "--" {
            break;
        }
        if token.starts_with(prefix) {
            return true;
        }
    }
    false
}

/// Insert a kernel argument before the optional `--` separator; append
/// when no separator exists.
fn insert_kernel_arg(kernel_args: &str, arg: &str) -> String {
    if kernel_args.is_empty() {
        return arg.to_string();
    }

    let tokens: Vec<&str> = kernel_args.split_whitespace().collect();
    if let Some(pos) = tokens.iter().position(|t| *t == "--") {
        let mut updated = Vec::with_capacity(tokens.len() + 1);
        updated.extend_from_slice(&tokens[..pos]);
        updated.push(arg);
        updated.extend_from_slice(&tokens[pos..]);
        return updated.join(" ");
    }

    format!("{kernel_args} {arg}")
}

fn sum_resources(services: &[ServiceDescriptor]) -> NodeCapacity {
    let mut total = NodeCapacity::default();
    for svc in services {
        total.vcpus += svc.vcpus;
        total.memory_mb += svc.memory_mb;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use firework_spec::{NetworkConfig, ServiceLink};
    use firework_store::StoreError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeStore {
        data: HashMap<String, Vec<u8>>,
        revision: Mutex<String>,
        /// Simulates transports that refresh their revision during fetch.
        revision_on_fetch: Option<String>,
        fetch_count: AtomicUsize,
        revision_calls: AtomicUsize,
    }

    impl FakeStore {
        fn serving(node: &str, doc: &str, revision: &str) -> Self {
            Self {
                data: HashMap::from([(node.to_string(), doc.as_bytes().to_vec())]),
                revision: Mutex::new(revision.to_string()),
                revision_on_fetch: None,
                fetch_count: AtomicUsize::new(0),
                revision_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Store for FakeStore {
        async fn fetch(&self, node: &str) -> Result<Vec<u8>, StoreError> {
            self.fetch_count.fetch_add(1, Ordering::SeqCst);
            if let Some(rev) = &self.revision_on_fetch {
                *self.revision.lock().unwrap() = rev.clone();
            }
            self.data.get(node).cloned().ok_or_else(|| StoreError::NotFound {
                node: node.to_string(),
            })
        }

        async fn revision(&self) -> Result<String, StoreError> {
            self.revision_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.revision.lock().unwrap().clone())
        }

        async fn check_revision(&self, _node: &str) -> Result<String, StoreError> {
            Ok(self.revision.lock().unwrap().clone())
        }
    }

    struct FakeCapacity(NodeCapacity);

    impl CapacityReader for FakeCapacity {
        fn read(&self) -> Result<NodeCapacity> {
            Ok(self.0)
        }
    }

    fn test_config(state_dir: &std::path::Path) -> AgentConfig {
        AgentConfig {
            node_name: "web".to_string(),
            node_names: vec!["web".to_string()],
            store_dir: state_dir.join("store"),
            poll_interval: std::time::Duration::from_secs(1),
            hypervisor_bin: "/usr/bin/true".into(),
            state_dir: state_dir.to_path_buf(),
            log_level: "info".to_string(),
            api_listen_addr: None,
            enable_health_checks: false,
            enable_network_setup: false,
            enable_capacity_check: false,
            image_source_dir: None,
            images_dir: state_dir.join("images"),
            vm_subnet: "172.16.0.0/24".to_string(),
            vm_gateway: "172.16.0.1".to_string(),
            vm_bridge: String::new(),
            out_interface: None,
            update_strategy: crate::config::UpdateStrategy::AllAtOnce,
            update_delay: None,
            proxy_config_dir: None,
        }
    }

    async fn test_agent(store: Arc<FakeStore>, state_dir: &std::path::Path) -> Agent {
        Agent::new(test_config(state_dir), store as Arc<dyn Store>)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn single_label_fetches_before_checking_revision() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FakeStore::serving("web", "node: web\nservices: []\n", "rev-1"));
        let agent = test_agent(Arc::clone(&store), dir.path()).await;
        *agent.last_revision.lock().unwrap() = "rev-1".to_string();

        let (_tx, mut rx) = tokio::sync::watch::channel(false);
        agent.tick(&mut rx).await;

        assert_eq!(store.fetch_count.load(Ordering::SeqCst), 1);
        assert_eq!(store.revision_calls.load(Ordering::SeqCst), 1);
        // Unchanged revision: no apply, so no reconcile observation.
        assert!(agent
            .metrics
            .render()
            .contains("firework_agent_reconcile_runs_total{node=\"web\"} 0"));
    }

    #[tokio::test]
    async fn revision_refreshed_during_fetch_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FakeStore::serving("web", "node: web\nservices: []\n", "rev-old");
        store.revision_on_fetch = Some("rev-new".to_string());
        let store = Arc::new(store);

        let agent = test_agent(Arc::clone(&store), dir.path()).await;
        *agent.last_revision.lock().unwrap() = "rev-old".to_string();

        let (_tx, mut rx) = tokio::sync::watch::channel(false);
        agent.tick(&mut rx).await;

        assert_eq!(store.fetch_count.load(Ordering::SeqCst), 1);
        assert_eq!(*agent.last_revision.lock().unwrap(), "rev-new");
    }

    #[tokio::test]
    async fn failed_fetch_abandons_the_tick() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FakeStore::serving("other", "node: other\n", "rev-1"));
        let agent = test_agent(Arc::clone(&store), dir.path()).await;

        let (_tx, mut rx) = tokio::sync::watch::channel(false);
        agent.tick(&mut rx).await;

        assert!(agent
            .metrics
            .render()
            .contains("firework_agent_reconcile_runs_total{node=\"web\"} 0"));
    }

    #[tokio::test]
    async fn capacity_gate_skips_reconciliation_when_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let doc = "node: web\nservices:\n  - name: big\n    image: /img/big.ext4\n    kernel: /img/k\n    vcpus: 64\n    memory_mb: 999999\n";
        let store = Arc::new(FakeStore::serving("web", doc, "rev-1"));
        let mut agent = test_agent(Arc::clone(&store), dir.path()).await;
        agent.capacity = Some(Box::new(FakeCapacity(NodeCapacity {
            vcpus: 4,
            memory_mb: 2048,
        })));

        let (_tx, mut rx) = tokio::sync::watch::channel(false);
        agent.tick(&mut rx).await;

        let text = agent.metrics.render();
        assert!(text.contains("firework_agent_reconcile_runs_total{node=\"web\"} 0"));
        assert!(text.contains("firework_node_used_vcpus{node=\"web\"} 64"));
    }

    #[tokio::test]
    async fn empty_descriptor_reconciles_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FakeStore::serving("web", "node: web\nservices: []\n", "rev-1"));
        let agent = test_agent(Arc::clone(&store), dir.path()).await;

        let (_tx, mut rx) = tokio::sync::watch::channel(false);
        agent.tick(&mut rx).await;

        let text = agent.metrics.render();
        assert!(text.contains("firework_agent_reconcile_runs_total{node=\"web\"} 1"));
        assert!(text.contains("firework_agent_reconcile_errors_total{node=\"web\"} 0"));
        assert_eq!(*agent.last_revision.lock().unwrap(), "rev-1");
    }

    fn networked(name: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            name: name.to_string(),
            image: format!("/img/{name}.ext4"),
            vcpus: 1,
            memory_mb: 256,
            network: Some(NetworkConfig {
                interface: firework_spec::tap_ifname(name),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn insert_before_separator() {
        let args = "console=ttyS0 reboot=k -- /usr/bin/app --flag";
        let out = insert_kernel_arg(args, "ip=172.16.0.2");
        assert_eq!(out, "console=ttyS0 reboot=k ip=172.16.0.2 -- /usr/bin/app --flag");
    }

    #[test]
    fn append_without_separator() {
        let out = insert_kernel_arg("console=ttyS0", "ip=172.16.0.2");
        assert_eq!(out, "console=ttyS0 ip=172.16.0.2");
        assert_eq!(insert_kernel_arg("", "a=1"), "a=1");
    }

    #[test]
    fn prefix_check_stops_at_separator() {
        assert!(has_kernel_arg_prefix("a=1 ip=10.0.0.1 -- x", "ip="));
        assert!(!has_kernel_arg_prefix("a=1 -- ip=10.0.0.1", "ip="));
        assert!(!has_kernel_arg_prefix("", "ip="));
    }

    #[test]
    fn networking_is_deterministic_and_positional() {
        let mut services = vec![networked("api"), networked("web"), networked("worker")];
        assign_networking(&mut services, "172.16.0.0/24", "172.16.0.1");

        let ips: Vec<_> = services
            .iter()
            .map(|s| s.network.as_ref().unwrap().guest_ip.clone().unwrap())
            .collect();
        assert_eq!(ips, vec!["172.16.0.2", "172.16.0.3", "172.16.0.4"]);

        let macs: Vec<_> = services
            .iter()
            .map(|s| s.network.as_ref().unwrap().guest_mac.clone().unwrap())
            .collect();
        assert_eq!(
            macs,
            vec!["AA:FC:00:00:00:01", "AA:FC:00:00:00:02", "AA:FC:00:00:00:03"]
        );

        for (svc, ip) in services.iter().zip(&ips) {
            let token = format!("ip={ip}::172.16.0.1:255.255.255.0::eth0:off");
            assert!(svc.kernel_args.contains(&token));
        }
    }

    #[test]
    fn ip_token_lands_before_separator() {
        let mut svc = networked("web");
        svc.kernel_args = "console=ttyS0 -- /bin/web".to_string();
        let mut services = vec![svc];
        assign_networking(&mut services, "172.16.0.0/24", "172.16.0.1");

        let args = &services[0].kernel_args;
        let ip_pos = args.find("ip=").unwrap();
        let sep_pos = args.find(" -- ").unwrap();
        assert!(ip_pos < sep_pos);
    }

    #[test]
    fn existing_ip_token_is_respected() {
        let mut svc = networked("web");
        svc.kernel_args = "ip=10.9.9.9::10.9.9.1:255.255.255.0::eth0:off".to_string();
        let mut services = vec![svc];
        assign_networking(&mut services, "172.16.0.0/24", "172.16.0.1");

        let args = &services[0].kernel_args;
        assert!(args.contains("ip=10.9.9.9"));
        assert!(!args.contains("ip=172.16.0.2"));
        // The address is still allocated (positional), just not re-announced.
        assert_eq!(
            services[0].network.as_ref().unwrap().guest_ip.as_deref(),
            Some("172.16.0.2")
        );
    }

    #[test]
    fn non_networked_services_are_skipped_in_allocation() {
        let mut plain = networked("plain");
        plain.network = None;
        let mut services = vec![networked("api"), plain, networked("web")];
        assign_networking(&mut services, "172.16.0.0/24", "172.16.0.1");

        assert_eq!(
            services[0].network.as_ref().unwrap().guest_ip.as_deref(),
            Some("172.16.0.2")
        );
        assert_eq!(
            services[2].network.as_ref().unwrap().guest_ip.as_deref(),
            Some("172.16.0.3")
        );
    }

    #[test]
    fn links_resolve_to_guest_urls_and_kernel_args() {
        let mut es = networked("elasticsearch");
        es.kernel_args = "console=ttyS0".to_string();
        let mut kibana = networked("kibana");
        kibana.kernel_args = "console=ttyS0 -- /usr/bin/kibana".to_string();
        kibana.links = vec![ServiceLink {
            service: "elasticsearch".to_string(),
            env: "ES_HOSTS".to_string(),
            port: 9200,
            protocol: None,
        }];

        // Sorted order: elasticsearch, kibana.
        let mut services = vec![es, kibana];
        assign_networking(&mut services, "172.16.0.0/24", "172.16.0.1");
        resolve_links(&mut services);
        inject_env_vars(&mut services);

        let kibana = &services[1];
        assert_eq!(kibana.env["ES_HOSTS"], "http://172.16.0.2:9200");

        let args = &kibana.kernel_args;
        let env_pos = args
            .find("firework.env.ES_HOSTS=http://172.16.0.2:9200")
            .unwrap();
        let sep_pos = args.find(" -- ").unwrap();
        assert!(env_pos < sep_pos);
    }

    #[test]
    fn missing_link_target_is_skipped() {
        let mut kibana = networked("kibana");
        kibana.links = vec![ServiceLink {
            service: "nowhere".to_string(),
            env: "X".to_string(),
            port: 1,
            protocol: None,
        }];
        let mut services = vec![kibana];
        assign_networking(&mut services, "172.16.0.0/24", "172.16.0.1");
        resolve_links(&mut services);

        assert!(!services[0].env.contains_key("X"));
    }

    #[test]
    fn env_injection_is_sorted_by_key() {
        let mut svc = networked("web");
        svc.network = None;
        svc.kernel_args = "console=ttyS0".to_string();
        svc.env.insert("ZED".to_string(), "z".to_string());
        svc.env.insert("ALPHA".to_string(), "a".to_string());

        let mut services = vec![svc];
        inject_env_vars(&mut services);

        let args = &services[0].kernel_args;
        let alpha = args.find("firework.env.ALPHA=a").unwrap();
        let zed = args.find("firework.env.ZED=z").unwrap();
        assert!(alpha < zed);
    }

    #[test]
    fn resources_sum_over_all_services() {
        let services = vec![networked("a"), networked("b")];
        let total = sum_resources(&services);
        assert_eq!(total.vcpus, 2);
        assert_eq!(total.memory_mb, 512);
    }
}
