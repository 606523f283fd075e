//! Node inventory contract.
//!
//! Agents publish `capacity_vcpus` / `capacity_memory_mb` gauges tagged
//! with their node id; an inventory implementation turns those readings
//! into [`Node`] entries for the placement call. Nodes that have not
//! published recently (a 5-minute freshness window is assumed) fall out
//! of the inventory. The metric-store-backed implementation lives with
//! the deployment; [`StaticInventory`] backs tests and file-driven fleets.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;

use crate::Node;

/// What the scheduler consumes about one node.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeInventoryEntry {
    pub instance_id: String,
    pub capacity_vcpus: u32,
    pub capacity_memory_mb: u32,
}

impl From<NodeInventoryEntry> for Node {
    fn from(e: NodeInventoryEntry) -> Self {
        Node {
            instance_id: e.instance_id,
            capacity_vcpus: e.capacity_vcpus,
            capacity_memory_mb: e.capacity_memory_mb,
        }
    }
}

/// Source of live node inventory.
#[async_trait]
pub trait NodeInventory: Send + Sync {
    async fn discover(&self) -> anyhow::Result<Vec<Node>>;
}

/// Fixed inventory loaded from a YAML file: a list of
/// `{instance_id, capacity_vcpus, capacity_memory_mb}` entries.
pub struct StaticInventory {
    nodes: Vec<Node>,
}

impl StaticInventory {
    pub fn new(entries: Vec<NodeInventoryEntry>) -> Self {
        Self {
            nodes: entries.into_iter().map(Node::from).collect(),
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let entries: Vec<NodeInventoryEntry> = serde_yaml::from_str(&data)?;
        // Entries that never reported capacity are stale; drop them the way
        // the metric-backed inventory does.
        let entries = entries
            .into_iter()
            .filter(|e| e.capacity_vcpus > 0)
            .collect();
        Ok(Self::new(entries))
    }
}

#[async_trait]
impl NodeInventory for StaticInventory {
    async fn discover(&self) -> anyhow::Result<Vec<Node>> {
        Ok(self.nodes.clone())
    }
}
