//! Reverse-proxy dynamic configuration files.
//!
//! The agent manages a directory watched by the reverse proxy's file
//! provider: one YAML document per routed service, written when the
//! service appears and removed when it goes away, so routes follow the
//! VM population without a proxy reload.
//!
//! Local services route to their guest address; services on peer nodes
//! route to the peer's host address and forwarded port as
//! `remote-<service>.yaml`. Non-YAML files in the directory are never
//! touched.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use anyhow::{Context, Result};
use firework_spec::{NodeDescriptor, ServiceDescriptor};
use serde::Serialize;

/// Writes and deletes per-service dynamic config files.
pub struct ProxyManager {
    config_dir: PathBuf,
}

impl ProxyManager {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    /// Bring the config directory in line with the desired services.
    ///
    /// A local service is routed when it has a `host` metadata entry, a
    /// guest address, and a backend port. A remote service is routed when
    /// its node has a host address and the service has a `host` entry and
    /// at least one port forward. Stale managed files are removed.
    pub fn sync(&self, services: &[ServiceDescriptor], remote_nodes: &[NodeDescriptor]) -> Result<()> {
        std::fs::create_dir_all(&self.config_dir).context("creating proxy config dir")?;

        let mut active: HashSet<String> = HashSet::new();

        for svc in services {
            let Some(host) = svc.metadata.get("host") else {
                continue;
            };
            let Some(guest_ip) = svc.network.as_ref().and_then(|n| n.guest_ip.as_deref()) else {
                continue;
            };
            let Some(port) = backend_port(svc) else {
                continue;
            };

            let filename = format!("{}.yaml", svc.name);
            self.write_route(&filename, &svc.name, host, firework_spec::strip_cidr(guest_ip), port)
                .with_context(|| format!("writing proxy config for {}", svc.name))?;
            active.insert(filename);
        }

        for nd in remote_nodes {
            let Some(host_ip) = nd.host_ip.as_deref() else {
                continue;
            };
            for svc in &nd.services {
                let Some(host) = svc.metadata.get("host") else {
                    continue;
                };
                let Some(forward) = svc.port_forwards.first() else {
                    continue;
                };

                let filename = format!("remote-{}.yaml", svc.name);
                self.write_route(&filename, &svc.name, host, host_ip, forward.host_port)
                    .with_context(|| format!("writing remote proxy config for {}", svc.name))?;
                active.insert(filename);
            }
        }

        // Sweep managed files that no longer correspond to a route.
        for entry in std::fs::read_dir(&self.config_dir).context("reading proxy config dir")? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.ends_with(".yaml") || active.contains(name) {
                continue;
            }
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(true) {
                continue;
            }
            std::fs::remove_file(entry.path())
                .with_context(|| format!("removing stale proxy config {name}"))?;
        }

        Ok(())
    }

    fn write_route(
        &self,
        filename: &str,
        name: &str,
        host: &str,
        backend_addr: &str,
        port: u16,
    ) -> Result<()> {
        let config = FileConfig {
            http: HttpSection {
                routers: BTreeMap::from([(
                    name.to_string(),
                    Router {
                        rule: format!("Host(`{host}`)"),
                        entry_points: vec!["web".to_string()],
                        service: name.to_string(),
                    },
                )]),
                services: BTreeMap::from([(
                    name.to_string(),
                    ProxyService {
                        load_balancer: LoadBalancer {
                            servers: vec![Server {
                                url: format!("http://{backend_addr}:{port}"),
                            }],
                        },
                    },
                )]),
            },
        };

        let data = serde_yaml::to_string(&config)?;
        std::fs::write(self.config_dir.join(filename), data)?;
        Ok(())
    }
}

/// The guest port the proxy should target: the first port forward's VM
/// port, else the liveness probe port.
fn backend_port(svc: &ServiceDescriptor) -> Option<u16> {
    if let Some(forward) = svc.port_forwards.first() {
        return Some(forward.vm_port);
    }
    match &svc.health_check {
        Some(hc) if hc.port > 0 => Some(hc.port),
        _ => None,
    }
}

#[derive(Debug, Serialize)]
struct FileConfig {
    http: HttpSection,
}

#[derive(Debug, Serialize)]
struct HttpSection {
    routers: BTreeMap<String, Router>,
    services: BTreeMap<String, ProxyService>,
}

#[derive(Debug, Serialize)]
struct Router {
    rule: String,
    #[serde(rename = "entryPoints")]
    entry_points: Vec<String>,
    service: String,
}

#[derive(Debug, Serialize)]
struct ProxyService {
    #[serde(rename = "loadBalancer")]
    load_balancer: LoadBalancer,
}

#[derive(Debug, Serialize)]
struct LoadBalancer {
    servers: Vec<Server>,
}

#[derive(Debug, Serialize)]
struct Server {
    url: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use firework_spec::{HealthCheck, NetworkConfig, PortForward, ProbeKind};
    use std::time::Duration;

    fn routed_service(name: &str, host: &str, guest_ip: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            name: name.to_string(),
            image: format!("/img/{name}.ext4"),
            metadata: [("host".to_string(), host.to_string())].into(),
            network: Some(NetworkConfig {
                interface: format!("tap-{name}"),
                guest_ip: Some(guest_ip.to_string()),
                ..Default::default()
            }),
            port_forwards: vec![PortForward {
                host_port: 8080,
                vm_port: 80,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn local_service_gets_a_route_file() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProxyManager::new(dir.path());

        manager
            .sync(&[routed_service("web", "web.example.com", "172.16.0.2/24")], &[])
            .unwrap();

        let content = std::fs::read_to_string(dir.path().join("web.yaml")).unwrap();
        assert!(content.contains("Host(`web.example.com`)"));
        assert!(content.contains("http://172.16.0.2:80"));
    }

    #[test]
    fn service_without_host_metadata_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProxyManager::new(dir.path());

        let mut svc = routed_service("web", "x", "172.16.0.2");
        svc.metadata.clear();
        manager.sync(&[svc], &[]).unwrap();

        assert!(!dir.path().join("web.yaml").exists());
    }

    #[test]
    fn probe_port_is_the_backend_fallback() {
        let mut svc = routed_service("web", "web.example.com", "172.16.0.2");
        svc.port_forwards.clear();
        svc.health_check = Some(HealthCheck {
            kind: ProbeKind::Http,
            target: None,
            port: 5601,
            path: String::new(),
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
            retries: 3,
        });
        assert_eq!(backend_port(&svc), Some(5601));

        svc.health_check = None;
        assert_eq!(backend_port(&svc), None);
    }

    #[test]
    fn remote_services_route_to_peer_host() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProxyManager::new(dir.path());

        let peer = NodeDescriptor {
            node: "i-2".to_string(),
            host_ip: Some("10.0.1.6".to_string()),
            services: vec![routed_service("kibana", "kibana.example.com", "172.16.0.2")],
        };
        manager.sync(&[], &[peer]).unwrap();

        let content = std::fs::read_to_string(dir.path().join("remote-kibana.yaml")).unwrap();
        assert!(content.contains("http://10.0.1.6:8080"));
    }

    #[test]
    fn peer_without_host_address_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProxyManager::new(dir.path());

        let peer = NodeDescriptor {
            node: "i-2".to_string(),
            host_ip: None,
            services: vec![routed_service("kibana", "kibana.example.com", "172.16.0.2")],
        };
        manager.sync(&[], &[peer]).unwrap();

        assert!(!dir.path().join("remote-kibana.yaml").exists());
    }

    #[test]
    fn stale_yaml_is_removed_and_non_yaml_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProxyManager::new(dir.path());

        manager
            .sync(&[routed_service("old", "old.example.com", "172.16.0.2")], &[])
            .unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"keep me").unwrap();

        manager
            .sync(&[routed_service("new", "new.example.com", "172.16.0.3")], &[])
            .unwrap();

        assert!(!dir.path().join("old.yaml").exists());
        assert!(dir.path().join("new.yaml").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn empty_local_set_still_syncs_peer_routes() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProxyManager::new(dir.path());

        let peer = NodeDescriptor {
            node: "i-2".to_string(),
            host_ip: Some("10.0.1.6".to_string()),
            services: vec![routed_service("api", "api.example.com", "172.16.0.4")],
        };
        manager.sync(&[], &[peer]).unwrap();

        assert!(dir.path().join("remote-api.yaml").exists());
    }
}
