//! Directory-backed store transport.
//!
//! Layout: `<root>/nodes/<node>.yaml`, one descriptor document per node.
//! This is the transport used by tests, local development, and the
//! enricher's publisher; revision tokens are content hashes, so any
//! external process that replaces a file is picked up on the next poll.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use firework_spec::NodeDescriptor;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::{DescriptorLister, EnrichmentTimestamps, Store, StoreError};

/// Read side of the directory transport.
pub struct DirStore {
    root: PathBuf,
    state: Mutex<DirState>,
}

#[derive(Default)]
struct DirState {
    last_revision: String,
    enrichment_by_node: HashMap<String, DateTime<Utc>>,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: Mutex::new(DirState::default()),
        }
    }

    fn node_path(&self, node: &str) -> PathBuf {
        self.root.join("nodes").join(format!("{node}.yaml"))
    }

    async fn read_node(&self, node: &str) -> Result<Vec<u8>, StoreError> {
        match tokio::fs::read(self.node_path(node)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound {
                node: node.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Store for DirStore {
    async fn fetch(&self, node: &str) -> Result<Vec<u8>, StoreError> {
        let data = self.read_node(node).await?;
        let revision = content_revision(&data);

        let modified = tokio::fs::metadata(self.node_path(node))
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from);

        let mut state = self.state.lock().unwrap();
        state.last_revision = revision;
        if let Some(ts) = modified {
            state.enrichment_by_node.insert(node.to_string(), ts);
        }

        Ok(data)
    }

    /// Returns the revision cached by the most recent fetch. Empty before
    /// the first fetch, which forces the agent to fetch.
    async fn revision(&self) -> Result<String, StoreError> {
        Ok(self.state.lock().unwrap().last_revision.clone())
    }

    async fn check_revision(&self, node: &str) -> Result<String, StoreError> {
        let data = self.read_node(node).await?;
        let revision = content_revision(&data);
        self.state.lock().unwrap().last_revision = revision.clone();
        Ok(revision)
    }

    fn as_lister(&self) -> Option<&dyn DescriptorLister> {
        Some(self)
    }

    fn as_enrichment_timestamps(&self) -> Option<&dyn EnrichmentTimestamps> {
        Some(self)
    }
}

#[async_trait]
impl DescriptorLister for DirStore {
    /// Parse every `nodes/*.yaml` document. Malformed documents are skipped
    /// with a warning so a single bad peer cannot break remote routing.
    async fn list_all_node_descriptors(&self) -> Result<Vec<NodeDescriptor>, StoreError> {
        let nodes_dir = self.root.join("nodes");
        let mut entries = match tokio::fs::read_dir(&nodes_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut descriptors = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            let data = match tokio::fs::read(&path).await {
                Ok(data) => data,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read node descriptor");
                    continue;
                }
            };
            match firework_spec::parse_node_descriptor(&data) {
                Ok(nd) => descriptors.push(nd),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping malformed node descriptor");
                }
            }
        }

        descriptors.sort_by(|a, b| a.node.cmp(&b.node));
        Ok(descriptors)
    }
}

impl EnrichmentTimestamps for DirStore {
    fn last_enrichment_timestamp(&self, node: &str) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .unwrap()
            .enrichment_by_node
            .get(node)
            .copied()
    }
}

/// Write side of the directory transport, used by the enricher's publisher.
pub struct DirWriter {
    root: PathBuf,
}

impl DirWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn nodes_dir(&self) -> PathBuf {
        self.root.join("nodes")
    }

    /// Write every descriptor, then delete `nodes/*.yaml` keys that are no
    /// longer present.
    ///
    /// An empty descriptor list is a strict no-op: it is almost always an
    /// upstream failure rather than a genuine "zero services desired"
    /// signal, and must never be interpreted as "delete everything".
    pub async fn write_all(&self, descriptors: &[NodeDescriptor]) -> Result<(), StoreError> {
        if descriptors.is_empty() {
            return Ok(());
        }

        tokio::fs::create_dir_all(self.nodes_dir()).await?;

        let mut desired = Vec::with_capacity(descriptors.len());
        for nd in descriptors {
            desired.push(format!("{}.yaml", nd.node));
            self.write_node(nd).await?;
        }

        let mut entries = tokio::fs::read_dir(self.nodes_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.ends_with(".yaml") {
                continue;
            }
            if !desired.iter().any(|d| d == name) {
                tokio::fs::remove_file(entry.path()).await?;
            }
        }

        Ok(())
    }

    /// Serialize one descriptor and move it into place atomically.
    pub async fn write_node(&self, descriptor: &NodeDescriptor) -> Result<(), StoreError> {
        let data = firework_spec::to_yaml(descriptor).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("serializing descriptor for node {}: {e}", descriptor.node),
            )
        })?;

        let path = self.nodes_dir().join(format!("{}.yaml", descriptor.node));
        let tmp = path.with_extension("yaml.tmp");
        tokio::fs::create_dir_all(self.nodes_dir()).await?;
        tokio::fs::write(&tmp, data.as_bytes()).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

fn content_revision(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(16);
    for b in digest.iter().take(8) {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
