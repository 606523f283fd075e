//! Host network wiring for microVMs.
//!
//! All VMs on a node attach to one shared L2 bridge that carries the
//! gateway address; guest traffic reaches the outside world through DNAT
//! port-forwards and an optional masquerade rule. Everything here shells
//! out to `ip`/`iptables`/`sysctl`; the agent's serial tick is the only
//! writer, and rule mutations are idempotent (check before add, tolerate
//! "rule missing" on delete).

use anyhow::{anyhow, bail, Context, Result};
use firework_spec::ServiceDescriptor;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Manages TAP devices, the shared bridge, and firewall rules.
pub struct NetworkManager {
    /// Shared bridge name, set by `init_bridge`.
    bridge: Option<String>,
}

impl NetworkManager {
    pub fn new() -> Self {
        Self { bridge: None }
    }

    /// Create the shared bridge, assign it the gateway address, bring it
    /// up, pin the VM subnet route to it, and enable IP forwarding.
    ///
    /// Older deployments used a differently named bridge; if it still
    /// exists the kernel can prefer its route for the VM subnet and break
    /// guest connectivity with "no route to host", so it is removed first.
    pub async fn init_bridge(&mut self, name: &str, gateway_ip: &str, subnet: &str) -> Result<()> {
        info!(bridge = %name, gateway = %gateway_ip, "initializing shared bridge");

        self.cleanup_legacy_bridge(name, "br-firework").await;

        if !device_exists(name).await {
            run("ip", &["link", "add", "name", name, "type", "bridge"])
                .await
                .with_context(|| format!("creating bridge {name}"))?;
        }

        let gateway_cidr = format!("{gateway_ip}/{}", subnet_prefix(subnet));
        if let Err(e) = run("ip", &["addr", "add", &gateway_cidr, "dev", name]).await {
            if !e.to_string().contains("RTNETLINK answers: File exists") {
                return Err(e).context("assigning gateway address");
            }
        }

        run("ip", &["link", "set", name, "up"])
            .await
            .context("bringing bridge up")?;

        if let Err(e) = self.pin_subnet_route(name, gateway_ip, subnet).await {
            warn!(bridge = %name, subnet = %subnet, error = %e,
                "failed to pin vm subnet route to bridge");
        }

        if let Err(e) = run("sysctl", &["-w", "net.ipv4.ip_forward=1"]).await {
            warn!(error = %e, "failed to enable ip_forward");
        }

        self.bridge = Some(name.to_string());
        Ok(())
    }

    async fn cleanup_legacy_bridge(&self, desired: &str, legacy: &str) {
        if legacy.is_empty() || legacy == desired || !device_exists(legacy).await {
            return;
        }

        warn!(legacy_bridge = %legacy, active_bridge = %desired,
            "removing legacy bridge to avoid route conflicts");

        let _ = run("ip", &["link", "set", legacy, "down"]).await;
        if let Err(e) = run("ip", &["link", "del", legacy]).await {
            warn!(bridge = %legacy, error = %e, "failed to delete legacy bridge");
        }
    }

    /// Route the VM subnet through the bridge so stale devices cannot
    /// steal traffic to guest addresses.
    async fn pin_subnet_route(&self, bridge: &str, gateway_ip: &str, subnet: &str) -> Result<()> {
        let src = firework_spec::strip_cidr(gateway_ip);

        let mut args = vec!["route", "replace", subnet, "dev", bridge];
        if !src.is_empty() {
            args.extend(["src", src]);
        }
        run("ip", &args).await
    }

    /// Create the TAP device for a service and attach it to the bridge.
    pub async fn setup(&self, svc: &ServiceDescriptor) -> Result<()> {
        let Some(network) = &svc.network else {
            return Ok(());
        };

        let tap = tap_name(&svc.name, network.interface.as_str());
        info!(service = %svc.name, tap = %tap, "setting up network");

        self.create_tap(&tap).await?;

        if let Some(bridge) = &self.bridge {
            if let Err(e) = run("ip", &["link", "set", &tap, "master", bridge]).await {
                let _ = self.delete_tap(&tap).await;
                return Err(e).context("attaching TAP to shared bridge");
            }
        }

        info!(service = %svc.name, tap = %tap, "network setup complete");
        Ok(())
    }

    /// Remove the TAP device created for a service.
    pub async fn teardown(&self, svc: &ServiceDescriptor) -> Result<()> {
        let Some(network) = &svc.network else {
            return Ok(());
        };

        let tap = tap_name(&svc.name, network.interface.as_str());
        info!(service = %svc.name, tap = %tap, "tearing down network");
        self.delete_tap(&tap).await
    }

    async fn create_tap(&self, name: &str) -> Result<()> {
        if device_exists(name).await {
            debug!(tap = %name, "TAP device already exists");
            return Ok(());
        }

        run("ip", &["tuntap", "add", "dev", name, "mode", "tap"])
            .await
            .with_context(|| format!("creating TAP {name}"))?;
        run("ip", &["link", "set", name, "up"])
            .await
            .context("bringing TAP up")
    }

    async fn delete_tap(&self, name: &str) -> Result<()> {
        if !device_exists(name).await {
            return Ok(());
        }
        run("ip", &["link", "del", name])
            .await
            .with_context(|| format!("deleting TAP {name}"))
    }

    /// Add a DNAT rule forwarding a host port to a guest port.
    ///
    /// The rule is scoped to traffic arriving on the default-route
    /// interface and addressed to the host, so it cannot hijack
    /// guest-to-peer traffic that targets the same port on another node.
    pub async fn setup_port_forward(
        &self,
        host_port: u16,
        guest_ip: &str,
        vm_port: u16,
    ) -> Result<()> {
        info!(host_port, guest_ip = %guest_ip, vm_port, "setting up port forward");

        let (out_iface, host_ip) = resolve_host_ingress_context()
            .await
            .context("resolving host ingress context")?;

        let spec = scoped_port_forward_spec(&out_iface, &host_ip, host_port, guest_ip, vm_port);
        ensure_iptables_rule("nat", "PREROUTING", &spec)
            .await
            .context("adding scoped port-forward rule")
    }

    /// Remove the DNAT rules for a port forward: the scoped rule plus the
    /// older unscoped form kept for backward compatibility.
    pub async fn teardown_port_forward(
        &self,
        host_port: u16,
        guest_ip: &str,
        vm_port: u16,
    ) -> Result<()> {
        info!(host_port, guest_ip = %guest_ip, vm_port, "tearing down port forward");

        let mut errs = Vec::new();

        match resolve_host_ingress_context().await {
            Ok((out_iface, host_ip)) => {
                let spec =
                    scoped_port_forward_spec(&out_iface, &host_ip, host_port, guest_ip, vm_port);
                if let Err(e) = remove_iptables_rule("nat", "PREROUTING", &spec).await {
                    errs.push(format!("removing scoped port-forward rule: {e}"));
                }
            }
            Err(e) => {
                warn!(host_port, error = %e,
                    "failed to resolve host ingress context for scoped cleanup, trying legacy rule only");
            }
        }

        let legacy = legacy_port_forward_spec(host_port, guest_ip, vm_port);
        if let Err(e) = remove_iptables_rule("nat", "PREROUTING", &legacy).await {
            errs.push(format!("removing legacy port-forward rule: {e}"));
        }

        if !errs.is_empty() {
            bail!("tearing down port-forward rules: {}", errs.join("; "));
        }
        Ok(())
    }

    /// Masquerade guest egress through the named interface and accept
    /// forwarded traffic for the subnet.
    pub async fn setup_masquerade(&self, subnet: &str, out_interface: &str) -> Result<()> {
        info!(subnet = %subnet, interface = %out_interface, "setting up masquerade");

        ensure_iptables_rule(
            "nat",
            "POSTROUTING",
            &to_args(&["-s", subnet, "-o", out_interface, "-j", "MASQUERADE"]),
        )
        .await
        .context("setting up masquerade")?;

        ensure_iptables_rule("filter", "FORWARD", &to_args(&["-s", subnet, "-j", "ACCEPT"]))
            .await
            .context("allowing forward from subnet")?;
        ensure_iptables_rule("filter", "FORWARD", &to_args(&["-d", subnet, "-j", "ACCEPT"]))
            .await
            .context("allowing forward to subnet")
    }
}

impl Default for NetworkManager {
    fn default() -> Self {
        Self::new()
    }
}

fn tap_name(service: &str, configured: &str) -> String {
    if configured.is_empty() {
        firework_spec::tap_ifname(service)
    } else {
        configured.to_string()
    }
}

fn scoped_port_forward_spec(
    out_iface: &str,
    host_ip: &str,
    host_port: u16,
    guest_ip: &str,
    vm_port: u16,
) -> Vec<String> {
    to_args(&[
        "-i",
        out_iface,
        "-d",
        &format!("{host_ip}/32"),
        "-p",
        "tcp",
        "-m",
        "tcp",
        "--dport",
        &host_port.to_string(),
        "-j",
        "DNAT",
        "--to-destination",
        &format!("{guest_ip}:{vm_port}"),
    ])
}

fn legacy_port_forward_spec(host_port: u16, guest_ip: &str, vm_port: u16) -> Vec<String> {
    to_args(&[
        "-p",
        "tcp",
        "-m",
        "tcp",
        "--dport",
        &host_port.to_string(),
        "-j",
        "DNAT",
        "--to-destination",
        &format!("{guest_ip}:{vm_port}"),
    ])
}

fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Discover the default-route interface and its global IPv4 address.
async fn resolve_host_ingress_context() -> Result<(String, String)> {
    let route_out = run_output("ip", &["route", "show", "default"])
        .await
        .context("detecting default route")?;
    let out_iface = parse_default_route_interface(&route_out)?;

    let addr_out = run_output(
        "ip",
        &["-4", "-o", "addr", "show", "dev", &out_iface, "scope", "global"],
    )
    .await
    .with_context(|| format!("detecting host IPv4 on {out_iface}"))?;
    let host_ip = parse_interface_ipv4(&addr_out)
        .with_context(|| format!("parsing host IPv4 on {out_iface}"))?;

    Ok((out_iface, host_ip))
}

fn parse_default_route_interface(output: &str) -> Result<String> {
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.first() != Some(&"default") {
            continue;
        }
        for pair in fields.windows(2) {
            if pair[0] == "dev" && !pair[1].is_empty() {
                return Ok(pair[1].to_string());
            }
        }
    }
    Err(anyhow!(
        "default route interface not found in output: {:?}",
        output.trim()
    ))
}

fn parse_interface_ipv4(output: &str) -> Result<String> {
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        for pair in fields.windows(2) {
            if pair[0] != "inet" {
                continue;
            }
            let ip = firework_spec::strip_cidr(pair[1]);
            if !ip.is_empty() {
                return Ok(ip.to_string());
            }
        }
    }
    Err(anyhow!(
        "IPv4 address not found in output: {:?}",
        output.trim()
    ))
}

/// Add a rule only when an identical one is not already present.
async fn ensure_iptables_rule(table: &str, chain: &str, spec: &[String]) -> Result<()> {
    let mut check = vec!["-t".to_string(), table.to_string(), "-C".to_string(), chain.to_string()];
    check.extend(spec.iter().cloned());
    match run_owned("iptables", &check).await {
        Ok(()) => return Ok(()),
        Err(e) if !is_rule_missing_error(&e) => {
            return Err(e).context("checking existing iptables rule");
        }
        Err(_) => {}
    }

    let mut add = vec!["-t".to_string(), table.to_string(), "-A".to_string(), chain.to_string()];
    add.extend(spec.iter().cloned());
    run_owned("iptables", &add).await
}

/// Delete a rule, treating "rule missing" as success.
async fn remove_iptables_rule(table: &str, chain: &str, spec: &[String]) -> Result<()> {
    let mut del = vec!["-t".to_string(), table.to_string(), "-D".to_string(), chain.to_string()];
    del.extend(spec.iter().cloned());
    match run_owned("iptables", &del).await {
        Ok(()) => Ok(()),
        Err(e) if is_rule_missing_error(&e) => Ok(()),
        Err(e) => Err(e),
    }
}

fn is_rule_missing_error(err: &anyhow::Error) -> bool {
    let msg = err.to_string();
    msg.contains("No chain/target/match by that name")
        || msg.contains("Bad rule (does a matching rule exist in that chain?)")
}

async fn device_exists(name: &str) -> bool {
    run("ip", &["link", "show", name]).await.is_ok()
}

async fn run(cmd: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(cmd)
        .args(args)
        .output()
        .await
        .with_context(|| format!("executing {cmd}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{cmd} {}: {}", args.join(" "), stderr.trim());
    }
    Ok(())
}

async fn run_owned(cmd: &str, args: &[String]) -> Result<()> {
    let refs: Vec<&str> = args.iter().map(String::as_str).collect();
    run(cmd, &refs).await
}

async fn run_output(cmd: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(cmd)
        .args(args)
        .output()
        .await
        .with_context(|| format!("executing {cmd}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{cmd} {}: {}", args.join(" "), stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Prefix length of a CIDR string ("172.16.0.0/24" → "24").
fn subnet_prefix(cidr: &str) -> &str {
    match cidr.rfind('/') {
        Some(idx) => &cidr[idx + 1..],
        None => "24",
    }
}

/// Dotted-decimal netmask for a CIDR prefix length
/// ("172.16.0.0/24" → "255.255.255.0").
pub fn subnet_mask_bits(cidr: &str) -> &'static str {
    match subnet_prefix(cidr) {
        "8" => "255.0.0.0",
        "16" => "255.255.0.0",
        "24" => "255.255.255.0",
        "28" => "255.255.255.240",
        _ => "255.255.255.0",
    }
}
