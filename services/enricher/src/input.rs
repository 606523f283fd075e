//! Loading user-authored service specs from the input tree.
//!
//! Expected layout: `defaults.yaml` (optional), `services/*.yaml`
//! (optional directory; standalone tenant fleets have none),
//! `tenants/<id>/*.yaml` (handled in [`crate::tenant`]).

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use firework_spec::{CrossNodeLink, PortForward, ServiceLink};
use serde::Deserialize;

/// Lightweight user-facing service definition.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceSpec {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub image: String,

    #[serde(default)]
    pub kernel: String,

    #[serde(default)]
    pub vcpus: u32,

    #[serde(default)]
    pub memory_mb: u32,

    #[serde(default)]
    pub kernel_args: String,

    /// Node-class label used for grouping; in scheduler mode the grouping
    /// is replaced by per-instance placement.
    #[serde(default)]
    pub node_type: String,

    #[serde(default)]
    pub network: bool,

    #[serde(default)]
    pub port_forwards: Vec<PortForward>,

    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub links: Vec<ServiceLink>,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    #[serde(default)]
    pub anti_affinity_group: Option<String>,

    #[serde(default)]
    pub cross_node_links: Vec<CrossNodeLink>,

    /// When set, the enricher injects this node's own host address into
    /// the named env var.
    #[serde(default)]
    pub node_host_ip_env: Option<String>,
}

/// User-facing liveness probe definition. Uses port + path so the agent
/// can compose the full target from the guest address allocated at
/// runtime. The probe type stays a plain string here; validation rejects
/// anything other than `http` or `tcp`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthCheckSpec {
    #[serde(rename = "type", default)]
    pub kind: String,

    #[serde(default)]
    pub port: u16,

    #[serde(default)]
    pub path: String,

    #[serde(default, with = "humantime_serde::option")]
    pub interval: Option<Duration>,

    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,

    #[serde(default)]
    pub retries: u32,
}

/// Global fallback values applied to every service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Defaults {
    #[serde(default)]
    pub kernel: String,

    #[serde(default)]
    pub vcpus: u32,

    #[serde(default)]
    pub memory_mb: u32,

    #[serde(default)]
    pub kernel_args: String,

    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
}

/// Fully parsed input tree.
#[derive(Debug, Default)]
pub struct InputConfig {
    pub services: Vec<ServiceSpec>,
    pub defaults: Defaults,
}

/// Read defaults and service specs from the input directory.
pub fn load_input(dir: &Path) -> Result<InputConfig> {
    let defaults = parse_defaults(&dir.join("defaults.yaml"))?;
    let services = parse_services(&dir.join("services"))?;
    Ok(InputConfig { services, defaults })
}

/// Parse `defaults.yaml`, returning zero-value defaults when the file does
/// not exist (all hardcoded fallbacks apply).
fn parse_defaults(path: &Path) -> Result<Defaults> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Defaults::default()),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    serde_yaml::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Parse every YAML file in the services directory, in filename order.
/// A missing directory yields an empty list (standalone tenant mode).
fn parse_services(dir: &Path) -> Result<Vec<ServiceSpec>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("reading directory {}", dir.display())),
    };

    let mut files: Vec<_> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|e| e.path())
        .filter(|p| is_yaml(p))
        .collect();
    files.sort();

    let mut services = Vec::with_capacity(files.len());
    for path in files {
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let spec: ServiceSpec =
            serde_yaml::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        services.push(spec);
    }

    Ok(services)
}

pub(crate) fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}
