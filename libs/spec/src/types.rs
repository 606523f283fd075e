//! Wire types for node descriptors and service definitions.
//!
//! A `NodeDescriptor` is the unit published to the configuration store:
//! one YAML document per node, holding the ordered list of services the
//! node's agent should converge toward. Field names here are the wire
//! format; both the enricher (writer) and the agent (reader) go through
//! these types.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Desired state for a single node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Unique node identifier. In scheduler mode this is the cloud
    /// instance id; in static mode it is the node-class label.
    pub node: String,

    /// Private host address of the node, resolved by the enricher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,

    /// Services assigned to this node, in placement order.
    #[serde(default)]
    pub services: Vec<ServiceDescriptor>,
}

/// A fully resolved service: all defaults applied, ready for the agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Unique name within the node.
    pub name: String,

    /// Path to the root filesystem image.
    pub image: String,

    /// Path to the kernel binary.
    #[serde(default)]
    pub kernel: String,

    #[serde(default)]
    pub vcpus: u32,

    #[serde(default)]
    pub memory_mb: u32,

    /// Kernel boot arguments. Tokens after an optional ` -- ` separator are
    /// passed to the guest init as argv rather than consumed by the kernel.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kernel_args: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub port_forwards: Vec<PortForward>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,

    /// Environment injected into the guest via kernel boot arguments.
    /// The agent emits `firework.env.KEY=VALUE` tokens and the guest init
    /// exports them before launching the workload.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Same-node dependencies, resolved by the agent to guest addresses.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<ServiceLink>,

    /// Arbitrary key-value pairs. `host` is consumed by the reverse-proxy
    /// sync; `tenant` labels metrics.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,

    /// Services sharing a group are spread across nodes when possible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anti_affinity_group: Option<String>,

    /// Dependencies on services placed on peer nodes, resolved by the
    /// enricher to `<peer_host>:<host_port>` env vars.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cross_node_links: Vec<CrossNodeLink>,

    /// When set, the enricher injects this node's own host address into the
    /// named env var (e.g. an Elasticsearch transport publish host).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_host_ip_env: Option<String>,
}

/// Network identity for a microVM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// TAP device name on the host.
    pub interface: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_dev_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_mac: Option<String>,

    /// Guest address, may carry a `/<prefix>` suffix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_ip: Option<String>,
}

/// Host-to-guest port mapping, realized as an iptables DNAT rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForward {
    pub host_port: u16,
    pub vm_port: u16,
}

/// Liveness probe kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Http,
    Tcp,
}

/// Liveness probe definition.
///
/// The enricher emits port + path; the agent composes the full target from
/// the guest address it allocates at runtime. An explicit `target` wins
/// over composition when both are present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    #[serde(rename = "type")]
    pub kind: ProbeKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    #[serde(default)]
    pub port: u16,

    /// HTTP path, unused for TCP probes.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,

    #[serde(default = "default_probe_interval", with = "humantime_serde")]
    pub interval: Duration,

    #[serde(default = "default_probe_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    #[serde(default = "default_probe_retries")]
    pub retries: u32,
}

fn default_probe_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_probe_retries() -> u32 {
    3
}

/// A same-node dependency. The agent resolves the target's guest address
/// and injects `<env> = <protocol>://<guest_addr>:<port>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLink {
    /// Target service name (must live on the same node).
    pub service: String,

    /// Env var injected into the declaring service.
    pub env: String,

    /// Target service port.
    pub port: u16,

    /// URL scheme, `http` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// A dependency on a peer service placed on a different node. The enricher
/// resolves the peer node's host address and injects `<host>:<host_port>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossNodeLink {
    pub service: String,
    pub env: String,
    pub host_port: u16,
}
