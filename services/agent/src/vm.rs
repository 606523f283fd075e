//! MicroVM lifecycle management.
//!
//! The manager owns a map of instances keyed by service name. Starting a
//! service materializes a per-service working directory, writes the
//! hypervisor JSON config, and launches the hypervisor binary in its own
//! process group so VMs survive an agent restart. A supervisor task per
//! VM observes process exit and distinguishes an operator stop (stays
//! Stopped) from a crash (becomes Failed, recreated next tick).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use firework_spec::ServiceDescriptor;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Grace period after SIGTERM before escalating to SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(5);
/// Additional wait after SIGKILL for the process to disappear.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle state of a microVM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Running,
    Stopped,
    Failed,
}

/// A tracked microVM instance.
#[derive(Debug, Clone)]
pub struct Instance {
    /// Service name from the descriptor.
    pub name: String,
    /// The descriptor that created this instance.
    pub descriptor: ServiceDescriptor,
    pub state: VmState,
    /// Hypervisor process id (0 when not running).
    pub pid: u32,
    /// Path to the hypervisor control socket.
    pub socket_path: PathBuf,
}

/// VM lifecycle operations as consumed by the reconciler and the health
/// monitor's restart callback.
#[async_trait]
pub trait VmRuntime: Send + Sync {
    fn list(&self) -> HashMap<String, Instance>;
    fn get(&self, name: &str) -> Option<Instance>;
    async fn start(&self, descriptor: &ServiceDescriptor) -> Result<()>;
    async fn stop(&self, name: &str) -> Result<()>;
    async fn remove(&self, name: &str) -> Result<()>;
}

/// Manages hypervisor processes on the local host.
pub struct VmManager {
    hypervisor_bin: PathBuf,
    state_dir: PathBuf,
    instances: Arc<Mutex<HashMap<String, Instance>>>,
}

impl VmManager {
    pub fn new(hypervisor_bin: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            hypervisor_bin: hypervisor_bin.into(),
            state_dir: state_dir.into(),
            instances: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn vm_dir(&self, name: &str) -> PathBuf {
        self.state_dir.join("vms").join(name)
    }

    /// Check whether the hypervisor process for a service is still alive,
    /// using a null signal probe.
    pub fn is_running(&self, name: &str) -> bool {
        let pid = {
            let instances = self.instances.lock().unwrap();
            match instances.get(name) {
                Some(inst) if inst.state == VmState::Running => inst.pid,
                _ => return false,
            }
        };
        pid_alive(pid)
    }
}

#[async_trait]
impl VmRuntime for VmManager {
    /// Snapshot of all known instances.
    fn list(&self) -> HashMap<String, Instance> {
        self.instances.lock().unwrap().clone()
    }

    fn get(&self, name: &str) -> Option<Instance> {
        self.instances.lock().unwrap().get(name).cloned()
    }

    /// Launch a new microVM for the given descriptor.
    async fn start(&self, descriptor: &ServiceDescriptor) -> Result<()> {
        let name = descriptor.name.clone();

        {
            let instances = self.instances.lock().unwrap();
            if let Some(inst) = instances.get(&name) {
                if inst.state == VmState::Running {
                    bail!("service {name} is already running (pid {})", inst.pid);
                }
            }
        }

        info!(
            service = %name,
            vcpus = descriptor.vcpus,
            memory_mb = descriptor.memory_mb,
            "starting microVM"
        );

        let vm_dir = self.vm_dir(&name);
        tokio::fs::create_dir_all(&vm_dir)
            .await
            .context("creating vm dir")?;

        let socket_path = vm_dir.join("firecracker.sock");
        // Remove a stale socket from a previous run.
        let _ = tokio::fs::remove_file(&socket_path).await;

        let config_path = write_vm_config(&vm_dir, descriptor)
            .await
            .context("writing vm config")?;

        let log_file = std::fs::File::create(vm_dir.join("firecracker.log"))
            .context("creating log file")?;
        let log_out = log_file.try_clone().context("cloning log handle")?;

        let mut cmd = Command::new(&self.hypervisor_bin);
        cmd.arg("--api-sock")
            .arg(&socket_path)
            .arg("--config-file")
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_out))
            .stderr(Stdio::from(log_file));
        // Own process group: agent restarts must not take VMs down with them.
        cmd.process_group(0);

        let mut child = cmd.spawn().context("starting hypervisor")?;
        let pid = child.id().unwrap_or_default();

        {
            let mut instances = self.instances.lock().unwrap();
            instances.insert(
                name.clone(),
                Instance {
                    name: name.clone(),
                    descriptor: descriptor.clone(),
                    state: VmState::Running,
                    pid,
                    socket_path,
                },
            );
        }

        // Supervisor: observe process exit and flip state.
        let instances = Arc::clone(&self.instances);
        let supervised = name.clone();
        tokio::spawn(async move {
            let status = child.wait().await;

            let mut instances = instances.lock().unwrap();
            let Some(inst) = instances.get_mut(&supervised) else {
                return;
            };

            // stop() marks the instance Stopped before signalling; an exit
            // observed in that state is expected and must not become Failed.
            if inst.state == VmState::Stopped {
                debug!(service = %supervised, "microVM exited after stop");
                return;
            }

            match status {
                Ok(status) if status.success() => {
                    info!(service = %supervised, "microVM exited cleanly");
                    inst.state = VmState::Stopped;
                }
                Ok(status) => {
                    error!(service = %supervised, %status, "microVM exited with error");
                    inst.state = VmState::Failed;
                }
                Err(e) => {
                    error!(service = %supervised, error = %e, "failed to observe microVM exit");
                    inst.state = VmState::Failed;
                }
            }
        });

        info!(service = %name, pid, "microVM started");
        Ok(())
    }

    /// Gracefully shut down a running microVM, escalating to SIGKILL, and
    /// wait for process exit so device handles (TAP, sockets) are freed
    /// before a subsequent start.
    async fn stop(&self, name: &str) -> Result<()> {
        let (pid, socket_path) = {
            let mut instances = self.instances.lock().unwrap();
            let Some(inst) = instances.get_mut(name) else {
                bail!("service {name} not found");
            };
            // Mark intent first so the supervisor treats the coming exit
            // as a stop rather than a crash.
            inst.state = VmState::Stopped;
            (inst.pid, inst.socket_path.clone())
        };

        info!(service = %name, pid, "stopping microVM");

        let target = Pid::from_raw(pid as i32);
        if let Err(e) = kill(target, Signal::SIGTERM) {
            warn!(service = %name, error = %e, "SIGTERM failed, sending SIGKILL");
            let _ = kill(target, Signal::SIGKILL);
        }

        if !wait_for_pid_exit(pid, STOP_GRACE).await {
            warn!(service = %name, pid, "microVM did not exit after SIGTERM, sending SIGKILL");
            let _ = kill(target, Signal::SIGKILL);
            let _ = wait_for_pid_exit(pid, KILL_GRACE).await;
        }

        let _ = tokio::fs::remove_file(&socket_path).await;

        info!(service = %name, "microVM stopped");
        Ok(())
    }

    /// Stop (if running) and delete all state for a service.
    async fn remove(&self, name: &str) -> Result<()> {
        let running = {
            let instances = self.instances.lock().unwrap();
            instances
                .get(name)
                .map(|i| i.state == VmState::Running)
                .unwrap_or(false)
        };

        if running {
            if let Err(e) = self.stop(name).await {
                warn!(service = %name, error = %e, "error stopping VM during remove");
            }
        }

        self.instances.lock().unwrap().remove(name);

        tokio::fs::remove_dir_all(self.vm_dir(name))
            .await
            .or_else(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Ok(())
                } else {
                    Err(e)
                }
            })
            .context("removing vm dir")?;

        Ok(())
    }
}

fn pid_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

async fn wait_for_pid_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if !pid_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    !pid_alive(pid)
}

// --- Hypervisor JSON config ---

#[derive(Debug, Serialize, Deserialize)]
struct HypervisorConfig {
    #[serde(rename = "boot-source")]
    boot_source: BootSource,
    drives: Vec<Drive>,
    #[serde(rename = "machine-config")]
    machine_config: MachineConfig,
    #[serde(rename = "network-interfaces", skip_serializing_if = "Option::is_none")]
    network_interfaces: Option<Vec<NetworkInterface>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BootSource {
    kernel_image_path: String,
    boot_args: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Drive {
    drive_id: String,
    path_on_host: String,
    is_root_device: bool,
    is_read_only: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct MachineConfig {
    vcpu_count: u32,
    mem_size_mib: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct NetworkInterface {
    iface_id: String,
    guest_mac: String,
    host_dev_name: String,
}

/// Write the hypervisor JSON config for a service into its working dir.
async fn write_vm_config(vm_dir: &Path, svc: &ServiceDescriptor) -> Result<PathBuf> {
    let kernel_args = if svc.kernel_args.is_empty() {
        "console=ttyS0 reboot=k panic=1 pci=off".to_string()
    } else {
        svc.kernel_args.clone()
    };

    let network_interfaces = svc.network.as_ref().map(|n| {
        vec![NetworkInterface {
            iface_id: "eth0".to_string(),
            guest_mac: n
                .guest_mac
                .clone()
                .unwrap_or_else(|| "AA:FC:00:00:00:01".to_string()),
            host_dev_name: n.interface.clone(),
        }]
    });

    let config = HypervisorConfig {
        boot_source: BootSource {
            kernel_image_path: svc.kernel.clone(),
            boot_args: kernel_args,
        },
        drives: vec![Drive {
            drive_id: "rootfs".to_string(),
            path_on_host: svc.image.clone(),
            is_root_device: true,
            is_read_only: false,
        }],
        machine_config: MachineConfig {
            vcpu_count: svc.vcpus,
            mem_size_mib: svc.memory_mb,
        },
        network_interfaces,
    };

    let config_path = vm_dir.join("vm-config.json");
    let data = serde_json::to_vec_pretty(&config)?;
    tokio::fs::write(&config_path, data).await?;
    Ok(config_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use firework_spec::NetworkConfig;

    fn descriptor(name: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            name: name.to_string(),
            image: format!("/img/{name}.ext4"),
            kernel: "/img/vmlinux-5.10".to_string(),
            vcpus: 2,
            memory_mb: 512,
            kernel_args: "console=ttyS0 ip=172.16.0.2::172.16.0.1:255.255.255.0::eth0:off"
                .to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn vm_config_carries_machine_and_boot_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_vm_config(dir.path(), &descriptor("web")).await.unwrap();

        let data = std::fs::read(&path).unwrap();
        let cfg: HypervisorConfig = serde_json::from_slice(&data).unwrap();
        assert_eq!(cfg.machine_config.vcpu_count, 2);
        assert_eq!(cfg.machine_config.mem_size_mib, 512);
        assert_eq!(cfg.boot_source.kernel_image_path, "/img/vmlinux-5.10");
        assert!(cfg.boot_source.boot_args.contains("ip=172.16.0.2"));
        assert_eq!(cfg.drives.len(), 1);
        assert!(cfg.drives[0].is_root_device);
        assert!(cfg.network_interfaces.is_none());
    }

    #[tokio::test]
    async fn vm_config_includes_network_interface_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let mut desc = descriptor("web");
        desc.network = Some(NetworkConfig {
            interface: "tap-web".to_string(),
            guest_mac: Some("AA:FC:00:00:00:02".to_string()),
            guest_ip: Some("172.16.0.3/24".to_string()),
            host_dev_name: None,
        });

        let path = write_vm_config(dir.path(), &desc).await.unwrap();
        let cfg: HypervisorConfig =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();

        let ifaces = cfg.network_interfaces.unwrap();
        assert_eq!(ifaces.len(), 1);
        assert_eq!(ifaces[0].iface_id, "eth0");
        assert_eq!(ifaces[0].guest_mac, "AA:FC:00:00:00:02");
        assert_eq!(ifaces[0].host_dev_name, "tap-web");
    }

    #[tokio::test]
    async fn vm_config_falls_back_to_default_boot_args() {
        let dir = tempfile::tempdir().unwrap();
        let mut desc = descriptor("web");
        desc.kernel_args = String::new();

        let path = write_vm_config(dir.path(), &desc).await.unwrap();
        let cfg: HypervisorConfig =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(cfg.boot_source.boot_args, "console=ttyS0 reboot=k panic=1 pci=off");
    }

    #[tokio::test]
    async fn stop_of_unknown_service_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = VmManager::new("/usr/bin/true", dir.path());
        assert!(manager.stop("ghost").await.is_err());
    }

    #[tokio::test]
    async fn remove_of_unknown_service_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let manager = VmManager::new("/usr/bin/true", dir.path());
        assert!(manager.remove("ghost").await.is_ok());
    }
}
