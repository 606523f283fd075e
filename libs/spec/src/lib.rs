//! Shared data model for the firework orchestrator.
//!
//! This crate defines the wire types exchanged between the enricher, the
//! scheduler, and the node agents: per-node descriptors, fully resolved
//! service definitions, and the deterministic TAP-device naming rule.

mod types;

pub use types::{
    CrossNodeLink, HealthCheck, NetworkConfig, NodeDescriptor, PortForward, ProbeKind,
    ServiceDescriptor, ServiceLink,
};

use thiserror::Error;

/// Errors from parsing wire documents.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("parsing node descriptor: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Parse a node descriptor from its raw YAML document.
pub fn parse_node_descriptor(data: &[u8]) -> Result<NodeDescriptor, ParseError> {
    Ok(serde_yaml::from_slice(data)?)
}

/// Serialize a node descriptor to its YAML document form.
pub fn to_yaml(descriptor: &NodeDescriptor) -> Result<String, serde_yaml::Error> {
    serde_yaml::to_string(descriptor)
}

/// Return the TAP interface name for a service, guaranteed to fit within
/// the Linux IFNAMSIZ-1 (15 byte) limit.
///
/// Short names (≤ 11 bytes) become `tap-<name>`. Longer names become
/// `tap-` + the first 6 bytes + a 5-hex-digit FNV-1a mask of the full name,
/// so services sharing a long common prefix still get distinct devices
/// (e.g. `tenant-3-es-data-1` vs `tenant-3-es-data-2`).
pub fn tap_ifname(service_name: &str) -> String {
    const MAX_SUFFIX: usize = 11; // 15 - len("tap-")

    if service_name.len() <= MAX_SUFFIX {
        return format!("tap-{service_name}");
    }

    let hash = fnv1a32(service_name.as_bytes());
    format!("tap-{}{:05x}", &service_name[..6], hash & 0xfffff)
}

/// 32-bit FNV-1a over a byte slice.
fn fnv1a32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in data {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Remove a CIDR prefix length from an address string
/// (e.g. "172.16.0.2/24" → "172.16.0.2").
pub fn strip_cidr(addr: &str) -> &str {
    match addr.find('/') {
        Some(idx) => &addr[..idx],
        None => addr,
    }
}
