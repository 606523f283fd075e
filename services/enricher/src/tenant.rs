//! Per-tenant overlays.
//!
//! A tenant directory holds one YAML file per service. In *override mode*
//! (a base service with the same filename exists) the overlay's non-zero
//! fields are applied on top of a deep clone of the base. In *standalone
//! mode* (no base, but `node_type` is set) the file is a complete spec on
//! its own. Either way the produced service is renamed
//! `<tenant>-<base>`, its image path gets the tenant prefix, and link
//! targets are rewritten into the tenant namespace.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::input::{is_yaml, HealthCheckSpec, ServiceSpec};

/// Parsed overlay for one base service. All fields optional; zero values
/// mean "inherit from the base".
pub type TenantOverlay = ServiceSpec;

/// One overlay file within a tenant directory.
#[derive(Debug, Clone)]
pub struct TenantServiceFile {
    /// Base service name, derived from the filename (e.g. `kibana`).
    pub base_name: String,
    pub overlay: TenantOverlay,
}

/// All overlays for one tenant.
#[derive(Debug, Clone)]
pub struct TenantConfig {
    /// Tenant directory name (e.g. `tenant-1`).
    pub id: String,
    pub services: Vec<TenantServiceFile>,
}

/// Read `<input_dir>/tenants/*/`. A missing tenants directory yields an
/// empty list.
pub fn load_tenants(input_dir: &Path) -> Result<Vec<TenantConfig>> {
    let tenants_dir = input_dir.join("tenants");
    let entries = match std::fs::read_dir(&tenants_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).context("reading tenants directory"),
    };

    let mut dirs: Vec<_> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.path())
        .collect();
    dirs.sort();

    let mut tenants = Vec::with_capacity(dirs.len());
    for dir in dirs {
        let id = dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let tc = load_tenant(&dir, &id).with_context(|| format!("loading tenant {id}"))?;
        tenants.push(tc);
    }
    Ok(tenants)
}

fn load_tenant(tenant_dir: &Path, id: &str) -> Result<TenantConfig> {
    let mut files: Vec<_> = std::fs::read_dir(tenant_dir)
        .context("reading tenant directory")?
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
        let overlay: TenantOverlay =
            serde_yaml::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;

        let base_name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        services.push(TenantServiceFile { base_name, overlay });
    }

    Ok(TenantConfig {
        id: id.to_string(),
        services,
    })
}

/// Generate per-tenant specs from base services plus tenant overlays.
///
/// Overlays with no matching base and no `node_type` are dropped silently.
pub fn expand_tenants(base: &[ServiceSpec], tenants: &[TenantConfig]) -> Vec<ServiceSpec> {
    let mut expanded = Vec::new();

    for tenant in tenants {
        for tsf in &tenant.services {
            match base.iter().find(|s| s.name == tsf.base_name) {
                Some(base_svc) => {
                    expanded.push(apply_overlay(&tenant.id, base_svc, &tsf.overlay));
                }
                None if !tsf.overlay.node_type.is_empty() => {
                    expanded.push(standalone_spec(&tenant.id, tsf));
                }
                None => {
                    debug!(
                        tenant = %tenant.id,
                        base = %tsf.base_name,
                        "overlay has no base service and no node_type, dropping"
                    );
                }
            }
        }
    }

    expanded
}

/// Override mode: clone the base, rename into the tenant namespace, and
/// apply the overlay's non-zero fields. Env and metadata merge with the
/// overlay winning; port forwards and links are replaced wholesale.
fn apply_overlay(tenant_id: &str, base: &ServiceSpec, ov: &TenantOverlay) -> ServiceSpec {
    let mut spec = base.clone();
    spec.name = format!("{tenant_id}-{}", base.name);
    spec.image = derive_tenant_image(&base.image, tenant_id);

    if ov.vcpus != 0 {
        spec.vcpus = ov.vcpus;
    }
    if ov.memory_mb != 0 {
        spec.memory_mb = ov.memory_mb;
    }
    if !ov.kernel_args.is_empty() {
        spec.kernel_args = ov.kernel_args.clone();
    }
    if ov.health_check.is_some() {
        spec.health_check = ov.health_check.clone();
    }
    if ov.anti_affinity_group.is_some() {
        spec.anti_affinity_group = ov.anti_affinity_group.clone();
    }
    if ov.node_host_ip_env.is_some() {
        spec.node_host_ip_env = ov.node_host_ip_env.clone();
    }

    for (k, v) in &ov.env {
        spec.env.insert(k.clone(), v.clone());
    }
    for (k, v) in &ov.metadata {
        spec.metadata.insert(k.clone(), v.clone());
    }

    if !ov.port_forwards.is_empty() {
        spec.port_forwards = ov.port_forwards.clone();
    }
    if !ov.links.is_empty() {
        spec.links = ov.links.clone();
    }
    if !ov.cross_node_links.is_empty() {
        spec.cross_node_links = ov.cross_node_links.clone();
    }

    rewrite_link_targets(&mut spec, tenant_id);
    spec
}

/// Standalone mode: the tenant file is a complete spec. The image defaults
/// to the conventional tenant rootfs path when unset.
fn standalone_spec(tenant_id: &str, tsf: &TenantServiceFile) -> ServiceSpec {
    let mut spec = tsf.overlay.clone();
    spec.name = format!("{tenant_id}-{}", tsf.base_name);
    if spec.image.is_empty() {
        spec.image = format!("/var/lib/images/{tenant_id}-{}-rootfs.ext4", tsf.base_name);
    }
    rewrite_link_targets(&mut spec, tenant_id);
    spec
}

/// Point every link at the tenant-namespaced service name.
fn rewrite_link_targets(spec: &mut ServiceSpec, tenant_id: &str) {
    for link in &mut spec.links {
        link.service = format!("{tenant_id}-{}", link.service);
    }
    for link in &mut spec.cross_node_links {
        link.service = format!("{tenant_id}-{}", link.service);
    }
}

/// Prepend the tenant id to the image filename:
/// `/var/lib/images/kibana-rootfs.ext4` →
/// `/var/lib/images/tenant-1-kibana-rootfs.ext4`.
fn derive_tenant_image(base_image: &str, tenant_id: &str) -> String {
    let path = Path::new(base_image);
    let file = path
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or(base_image);
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => {
            format!("{}/{tenant_id}-{file}", dir.display())
        }
        _ => format!("{tenant_id}-{file}"),
    }
}
