//! Firework enricher.
//!
//! Transforms user-authored service specs plus per-tenant overlays into
//! validated per-node descriptors, invokes placement, resolves peer host
//! addresses, and publishes the descriptors to the store.

pub mod enrich;
pub mod input;
pub mod pipeline;
pub mod resolver;
pub mod tenant;
pub mod validate;

pub use pipeline::{run, EnrichOutcome, RunOptions};
