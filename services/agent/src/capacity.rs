//! Node resource capacity.
//!
//! The agent publishes its total vCPU and memory capacity every tick so
//! the scheduler can discover the node, and compares desired totals
//! against capacity before reconciling.

use anyhow::{Context, Result};

/// Resource capacity of the node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeCapacity {
    pub vcpus: u32,
    pub memory_mb: u32,
}

/// Reads node capacity.
pub trait CapacityReader: Send + Sync {
    fn read(&self) -> Result<NodeCapacity>;
}

/// Reads capacity from the OS (Linux only).
pub struct OsReader;

impl CapacityReader for OsReader {
    fn read(&self) -> Result<NodeCapacity> {
        if !cfg!(target_os = "linux") {
            anyhow::bail!("capacity reading not supported on this platform");
        }

        let meminfo =
            std::fs::read_to_string("/proc/meminfo").context("reading /proc/meminfo")?;
        let memory_mb = mem_total_mb(&meminfo)?;

        Ok(NodeCapacity {
            vcpus: cpu_count(),
            memory_mb,
        })
    }
}

fn cpu_count() -> u32 {
    let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if count > 0 {
        return count as u32;
    }
    std::thread::available_parallelism()
        .map(|p| p.get() as u32)
        .unwrap_or(1)
}

/// Parse the `MemTotal:` line of /proc/meminfo into MB.
fn mem_total_mb(meminfo: &str) -> Result<u32> {
    for line in meminfo.lines() {
        let Some(rest) = line.strip_prefix("MemTotal:") else {
            continue;
        };
        // Format: "MemTotal:       16384000 kB"
        let kb: u32 = rest
            .split_whitespace()
            .next()
            .context("unexpected MemTotal line")?
            .parse()
            .context("parsing MemTotal value")?;
        return Ok(kb / 1024);
    }
    anyhow::bail!("MemTotal not found in /proc/meminfo")
}
