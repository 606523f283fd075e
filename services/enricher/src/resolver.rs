//! Peer host address resolution and cross-node link injection.
//!
//! Placement produces descriptors keyed by instance id; services that
//! declare cross-node links need the peer node's private host address.
//! Resolution is best-effort: partial results are accepted and failures
//! degrade to "skip cross-node links" rather than failing the run.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use firework_spec::NodeDescriptor;

/// Resolves cloud instance ids to private host addresses.
#[async_trait]
pub trait PeerResolver: Send + Sync {
    async fn resolve(&self, instance_ids: &[String]) -> Result<HashMap<String, String>>;
}

/// Fixed id → address map loaded from a YAML file, for tests and fleets
/// without a cloud metadata service.
pub struct StaticResolver {
    addrs: HashMap<String, String>,
}

impl StaticResolver {
    pub fn new(addrs: HashMap<String, String>) -> Self {
        Self { addrs }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(Self::new(serde_yaml::from_str(&data)?))
    }
}

#[async_trait]
impl PeerResolver for StaticResolver {
    async fn resolve(&self, instance_ids: &[String]) -> Result<HashMap<String, String>> {
        Ok(instance_ids
            .iter()
            .filter_map(|id| self.addrs.get(id).map(|a| (id.clone(), a.clone())))
            .collect())
    }
}

/// Stamp resolved host addresses onto descriptors whose node id looks like
/// a cloud instance id. Nodes the resolver does not know stay unresolved.
pub async fn resolve_node_ips(
    resolver: &dyn PeerResolver,
    mut descriptors: Vec<NodeDescriptor>,
) -> Result<Vec<NodeDescriptor>> {
    let ids: Vec<String> = descriptors
        .iter()
        .filter(|nd| nd.node.starts_with("i-"))
        .map(|nd| nd.node.clone())
        .collect();
    if ids.is_empty() {
        return Ok(descriptors);
    }

    let addrs = resolver.resolve(&ids).await?;
    for nd in &mut descriptors {
        if let Some(addr) = addrs.get(&nd.node) {
            nd.host_ip = Some(addr.clone());
        }
    }
    Ok(descriptors)
}

/// Inject env vars for cross-node links and own-host-address requests.
///
/// For each service with cross-node links, the peer service's node is
/// looked up; when both the peer and its host address are known,
/// `<env> = <peer_host>:<host_port>` lands in the declaring service's env
/// map. Missing peers and peers without an address are skipped silently.
pub fn resolve_cross_node_links(descriptors: Vec<NodeDescriptor>) -> Vec<NodeDescriptor> {
    let host_by_service: HashMap<String, Option<String>> = descriptors
        .iter()
        .flat_map(|nd| {
            nd.services
                .iter()
                .map(|svc| (svc.name.clone(), nd.host_ip.clone()))
        })
        .collect();

    let mut out = descriptors;
    for nd in &mut out {
        let node_host = nd.host_ip.clone();
        for svc in &mut nd.services {
            let links = svc.cross_node_links.clone();
            for link in &links {
                let Some(Some(peer_host)) = host_by_service.get(&link.service) else {
                    continue;
                };
                svc.env
                    .insert(link.env.clone(), format!("{peer_host}:{}", link.host_port));
            }
            if let (Some(env), Some(host)) = (&svc.node_host_ip_env, &node_host) {
                svc.env.insert(env.clone(), host.clone());
            }
        }
    }
    out
}
