//! Filling specs out into complete service descriptors.
//!
//! Priority for every field: explicit spec value > defaults.yaml value >
//! hardcoded fallback. Network details (guest address, MAC, TAP wiring)
//! are not decided here; the agent owns per-instance networking at
//! runtime, so a networked service only gets its interface name, and the
//! liveness probe carries port + path rather than a composed URL.

use std::time::Duration;

use firework_spec::{HealthCheck, NetworkConfig, ProbeKind, ServiceDescriptor};

use crate::input::{Defaults, HealthCheckSpec, ServiceSpec};

const FALLBACK_KERNEL: &str = "/var/lib/images/vmlinux-5.10";
const FALLBACK_VCPUS: u32 = 1;
const FALLBACK_MEMORY_MB: u32 = 256;
const FALLBACK_KERNEL_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off init=/sbin/fc-init";

const FALLBACK_PROBE_INTERVAL: Duration = Duration::from_secs(10);
const FALLBACK_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const FALLBACK_PROBE_RETRIES: u32 = 3;

/// Produce a complete descriptor from a user spec plus global defaults.
pub fn enrich_service(spec: &ServiceSpec, defaults: &Defaults) -> ServiceDescriptor {
    let mut svc = ServiceDescriptor {
        name: spec.name.clone(),
        image: spec.image.clone(),
        env: spec.env.clone(),
        links: spec.links.clone(),
        metadata: spec.metadata.clone(),
        anti_affinity_group: spec.anti_affinity_group.clone(),
        cross_node_links: spec.cross_node_links.clone(),
        node_host_ip_env: spec.node_host_ip_env.clone(),
        port_forwards: spec.port_forwards.clone(),
        ..Default::default()
    };

    svc.kernel = coalesce(&[&spec.kernel, &defaults.kernel, FALLBACK_KERNEL]);
    svc.vcpus = coalesce_u32(&[spec.vcpus, defaults.vcpus, FALLBACK_VCPUS]);
    svc.memory_mb = coalesce_u32(&[spec.memory_mb, defaults.memory_mb, FALLBACK_MEMORY_MB]);
    svc.kernel_args = coalesce(&[&spec.kernel_args, &defaults.kernel_args, FALLBACK_KERNEL_ARGS]);

    if spec.network {
        svc.network = Some(NetworkConfig {
            interface: firework_spec::tap_ifname(&spec.name),
            ..Default::default()
        });
    }

    if let Some(merged) = merge_health_check(spec.health_check.as_ref(), defaults.health_check.as_ref())
    {
        svc.health_check = build_health_check(&merged);
    }

    svc
}

/// Merge a spec-level probe with the defaults-level probe, field by field.
fn merge_health_check(
    spec: Option<&HealthCheckSpec>,
    defaults: Option<&HealthCheckSpec>,
) -> Option<HealthCheckSpec> {
    match (spec, defaults) {
        (None, None) => None,
        (None, Some(d)) => Some(d.clone()),
        (Some(s), None) => Some(s.clone()),
        (Some(s), Some(d)) => {
            let mut merged = s.clone();
            if merged.kind.is_empty() {
                merged.kind = d.kind.clone();
            }
            if merged.port == 0 {
                merged.port = d.port;
            }
            if merged.path.is_empty() {
                merged.path = d.path.clone();
            }
            if merged.interval.is_none() {
                merged.interval = d.interval;
            }
            if merged.timeout.is_none() {
                merged.timeout = d.timeout;
            }
            if merged.retries == 0 {
                merged.retries = d.retries;
            }
            Some(merged)
        }
    }
}

/// Convert a merged probe spec into the wire form, applying fallbacks.
/// The probe type was validated upstream; anything else drops the probe.
fn build_health_check(spec: &HealthCheckSpec) -> Option<HealthCheck> {
    let kind = match spec.kind.as_str() {
        "http" => ProbeKind::Http,
        "tcp" => ProbeKind::Tcp,
        _ => return None,
    };

    let retries = if spec.retries == 0 {
        FALLBACK_PROBE_RETRIES
    } else {
        spec.retries
    };

    Some(HealthCheck {
        kind,
        target: None,
        port: spec.port,
        path: spec.path.clone(),
        interval: spec.interval.unwrap_or(FALLBACK_PROBE_INTERVAL),
        timeout: spec.timeout.unwrap_or(FALLBACK_PROBE_TIMEOUT),
        retries,
    })
}

fn coalesce(values: &[&str]) -> String {
    values
        .iter()
        .find(|v| !v.is_empty())
        .map(|v| v.to_string())
        .unwrap_or_default()
}

fn coalesce_u32(values: &[u32]) -> u32 {
    values.iter().copied().find(|v| *v != 0).unwrap_or(0)
}
