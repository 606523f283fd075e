//! Configuration store abstraction.
//!
//! Node agents pull their desired state through the [`Store`] trait; the
//! enricher publishes descriptors through a writer with matching layout.
//! Optional capabilities (peer-descriptor listing, enrichment timestamps)
//! are discovered through accessor methods rather than downcasts, so
//! concrete transports never leak into the agent.

mod dir;

pub use dir::{DirStore, DirWriter};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use firework_spec::NodeDescriptor;
use thiserror::Error;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("descriptor for node {node} not found")]
    NotFound { node: String },

    #[error("store I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// A central configuration store, as seen by one agent.
#[async_trait]
pub trait Store: Send + Sync {
    /// Retrieve the raw descriptor document for the given node.
    async fn fetch(&self, node: &str) -> Result<Vec<u8>, StoreError>;

    /// Opaque version of the most recently observed fetch. Returns an empty
    /// string when the store has no fresh revision, which forces a fetch.
    async fn revision(&self) -> Result<String, StoreError>;

    /// Cheap per-node version query, without downloading the document.
    async fn check_revision(&self, node: &str) -> Result<String, StoreError>;

    /// Release any resources held by the store.
    async fn close(&self) {}

    /// Peer-descriptor listing, when the transport supports it.
    fn as_lister(&self) -> Option<&dyn DescriptorLister> {
        None
    }

    /// Enrichment timestamps, when the transport supports them.
    fn as_enrichment_timestamps(&self) -> Option<&dyn EnrichmentTimestamps> {
        None
    }
}

/// Optional capability: enumerate every node descriptor in the store.
/// Agents use this to discover peer-node services for remote proxy routes.
#[async_trait]
pub trait DescriptorLister: Send + Sync {
    async fn list_all_node_descriptors(&self) -> Result<Vec<NodeDescriptor>, StoreError>;
}

/// Optional capability: when was a node's descriptor last produced.
pub trait EnrichmentTimestamps: Send + Sync {
    fn last_enrichment_timestamp(&self, node: &str) -> Option<DateTime<Utc>>;
}
