//! Agent configuration, loaded from a YAML file with defaults applied to
//! any unset field.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// How service updates are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateStrategy {
    /// All updates applied in one pass (default).
    #[default]
    AllAtOnce,
    /// Updates applied one at a time with a pause between each.
    Rolling,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// This node's identifier, used for logging and metrics. Falls back to
    /// the hostname, then to the first label.
    #[serde(default)]
    pub node_name: String,

    /// All labels this node fetches descriptors for. Duplicate services
    /// across labels merge with last-wins. Defaults to `[node_name]`.
    #[serde(default)]
    pub node_names: Vec<String>,

    /// Root of the configuration store directory.
    pub store_dir: PathBuf,

    /// How often the agent polls the store.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Path to the hypervisor binary.
    #[serde(default = "default_hypervisor_bin")]
    pub hypervisor_bin: PathBuf,

    /// Where the agent keeps per-VM runtime state.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Address for the status/health HTTP API. Unset disables the server.
    #[serde(default)]
    pub api_listen_addr: Option<SocketAddr>,

    #[serde(default = "default_true")]
    pub enable_health_checks: bool,

    #[serde(default = "default_true")]
    pub enable_network_setup: bool,

    #[serde(default = "default_true")]
    pub enable_capacity_check: bool,

    /// Source directory mirrored into `images_dir`. Unset disables image
    /// sync (images must be pre-placed on disk).
    #[serde(default)]
    pub image_source_dir: Option<PathBuf>,

    /// Local directory where VM images are cached.
    #[serde(default = "default_images_dir")]
    pub images_dir: PathBuf,

    /// CIDR subnet for guest addresses.
    #[serde(default = "default_vm_subnet")]
    pub vm_subnet: String,

    /// Gateway address assigned to the shared bridge.
    #[serde(default = "default_vm_gateway")]
    pub vm_gateway: String,

    /// Name of the shared bridge device.
    #[serde(default = "default_vm_bridge")]
    pub vm_bridge: String,

    /// Host's external interface, enables masquerade for guest egress.
    #[serde(default)]
    pub out_interface: Option<String>,

    #[serde(default)]
    pub update_strategy: UpdateStrategy,

    /// Pause between individual service updates in rolling mode.
    #[serde(default, with = "humantime_serde::option")]
    pub update_delay: Option<Duration>,

    /// Directory for reverse-proxy dynamic config files. Unset disables
    /// proxy config management.
    #[serde(default)]
    pub proxy_config_dir: Option<PathBuf>,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_hypervisor_bin() -> PathBuf {
    PathBuf::from("/usr/bin/firecracker")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/firework")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_images_dir() -> PathBuf {
    PathBuf::from("/var/lib/images")
}

fn default_vm_subnet() -> String {
    "172.16.0.0/24".to_string()
}

fn default_vm_gateway() -> String {
    "172.16.0.1".to_string()
}

fn default_vm_bridge() -> String {
    "fw-br0".to_string()
}

fn default_true() -> bool {
    true
}

impl AgentConfig {
    /// Read the configuration file and normalize the node labels.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading agent config {}", path.display()))?;
        let mut cfg: AgentConfig = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing agent config {}", path.display()))?;

        if cfg.node_name.is_empty() && cfg.node_names.is_empty() {
            cfg.node_name = hostname().context("node_name not set and hostname unavailable")?;
        }
        if cfg.node_names.is_empty() {
            cfg.node_names = vec![cfg.node_name.clone()];
        }
        if cfg.node_name.is_empty() {
            cfg.node_name = cfg.node_names[0].clone();
        }

        Ok(cfg)
    }
}

fn hostname() -> Result<String> {
    let name = nix::unistd::gethostname().context("gethostname")?;
    Ok(name.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.yaml");
        std::fs::write(&path, "node_name: node-a\nstore_dir: /var/lib/firework/store\n").unwrap();

        let cfg = AgentConfig::load(&path).unwrap();
        assert_eq!(cfg.node_name, "node-a");
        assert_eq!(cfg.node_names, vec!["node-a"]);
        assert_eq!(cfg.poll_interval, Duration::from_secs(30));
        assert_eq!(cfg.vm_subnet, "172.16.0.0/24");
        assert_eq!(cfg.update_strategy, UpdateStrategy::AllAtOnce);
        assert!(cfg.enable_health_checks);
        assert!(cfg.api_listen_addr.is_none());
    }

    #[test]
    fn node_name_defaults_to_first_label() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.yaml");
        std::fs::write(
            &path,
            "node_names: [web, worker]\nstore_dir: /srv/store\n",
        )
        .unwrap();

        let cfg = AgentConfig::load(&path).unwrap();
        assert_eq!(cfg.node_name, "web");
        assert_eq!(cfg.node_names, vec!["web", "worker"]);
    }

    #[test]
    fn rolling_strategy_parses_with_delay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.yaml");
        std::fs::write(
            &path,
            "node_name: n\nstore_dir: /srv/store\nupdate_strategy: rolling\nupdate_delay: 15s\n",
        )
        .unwrap();

        let cfg = AgentConfig::load(&path).unwrap();
        assert_eq!(cfg.update_strategy, UpdateStrategy::Rolling);
        assert_eq!(cfg.update_delay, Some(Duration::from_secs(15)));
    }
}
