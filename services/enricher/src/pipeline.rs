//! The enrichment pipeline.
//!
//! Deterministic and sequential: load → expand tenants → validate →
//! enrich → group (or schedule) → resolve peer addresses → resolve
//! cross-node links → publish. Validation, scheduling, and store-write
//! failures are fatal to the run; peer address resolution is best-effort.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use firework_scheduler::NodeInventory;
use firework_spec::{NodeDescriptor, ServiceDescriptor};
use firework_store::DirWriter;
use tracing::{info, warn};

use crate::enrich::enrich_service;
use crate::input::{load_input, ServiceSpec};
use crate::resolver::{resolve_cross_node_links, resolve_node_ips, PeerResolver};
use crate::tenant::{expand_tenants, load_tenants};
use crate::validate::{check_warnings, validate_input, validate_output, Warning};

/// Result of an enrichment run.
pub struct EnrichOutcome {
    pub node_descriptors: Vec<NodeDescriptor>,
    pub warnings: Vec<Warning>,
}

/// Options for a full pipeline run.
pub struct RunOptions {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    /// When present, placement replaces node-type grouping.
    pub inventory: Option<Arc<dyn NodeInventory>>,
    /// Peer host address resolution, only consulted in scheduler mode.
    pub resolver: Option<Arc<dyn PeerResolver>>,
    /// Skip the final publish step.
    pub dry_run: bool,
}

/// Execute the enrichment pipeline and publish the results.
pub async fn run(opts: &RunOptions) -> Result<EnrichOutcome> {
    let outcome = enrich(&opts.input_dir)?;

    for w in &outcome.warnings {
        warn!(message = %w.message, "enrichment warning");
    }

    let mut node_descriptors = outcome.node_descriptors;

    if let Some(inventory) = &opts.inventory {
        let nodes = inventory.discover().await.context("discovering nodes")?;
        let prior = read_prior_placement(&opts.output_dir);

        // Flatten the per-node-type grouping; placement regroups by instance.
        let services: Vec<ServiceDescriptor> = node_descriptors
            .into_iter()
            .flat_map(|nd| nd.services)
            .collect();

        let assignment = firework_scheduler::schedule(&services, &nodes, &prior)
            .context("scheduling services")?;
        node_descriptors = firework_scheduler::build_node_descriptors(assignment);
        info!(node_descriptors = node_descriptors.len(), "placement complete");

        if let Some(resolver) = &opts.resolver {
            match resolve_node_ips(resolver.as_ref(), node_descriptors.clone()).await {
                Ok(resolved) => node_descriptors = resolved,
                Err(e) => {
                    warn!(error = %e, "could not resolve node addresses, cross-node links skipped");
                }
            }
        }
        node_descriptors = resolve_cross_node_links(node_descriptors);
    }

    for nd in &node_descriptors {
        validate_output(nd).with_context(|| format!("output validation for node {}", nd.node))?;
    }

    if !opts.dry_run {
        let writer = DirWriter::new(&opts.output_dir);
        writer
            .write_all(&node_descriptors)
            .await
            .context("publishing node descriptors")?;
    }

    Ok(EnrichOutcome {
        node_descriptors,
        warnings: outcome.warnings,
    })
}

/// The pipeline up to (and excluding) placement and publishing. Useful for
/// dry runs and tests.
pub fn enrich(input_dir: &Path) -> Result<EnrichOutcome> {
    let mut input = load_input(input_dir).context("loading input")?;

    let tenants = load_tenants(input_dir).context("loading tenants")?;
    if !tenants.is_empty() {
        let expanded = expand_tenants(&input.services, &tenants);
        input.services.extend(expanded);
    }

    validate_input(&input).context("input validation")?;
    let warnings = check_warnings(&input);

    // One descriptor per node-type label, in sorted label order.
    let mut groups: std::collections::BTreeMap<String, Vec<&ServiceSpec>> = Default::default();
    for svc in &input.services {
        groups.entry(svc.node_type.clone()).or_default().push(svc);
    }

    let mut node_descriptors = Vec::with_capacity(groups.len());
    for (node_type, specs) in groups {
        let services: Vec<ServiceDescriptor> = specs
            .iter()
            .map(|spec| enrich_service(spec, &input.defaults))
            .collect();

        let nd = NodeDescriptor {
            node: node_type.clone(),
            services,
            ..Default::default()
        };
        validate_output(&nd)
            .with_context(|| format!("output validation for type {node_type}"))?;
        node_descriptors.push(nd);
    }

    Ok(EnrichOutcome {
        node_descriptors,
        warnings,
    })
}

/// Build service → instance-id from the previously published descriptors,
/// so placement stays stable across runs. Unreadable or malformed files
/// are skipped with a warning; a fresh output directory yields an empty
/// assignment and full re-placement.
fn read_prior_placement(output_dir: &Path) -> HashMap<String, String> {
    let nodes_dir = output_dir.join("nodes");
    let entries = match std::fs::read_dir(&nodes_dir) {
        Ok(entries) => entries,
        Err(_) => return HashMap::new(),
    };

    let mut assignment = HashMap::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
            continue;
        }
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read prior placement file");
                continue;
            }
        };
        let nd = match firework_spec::parse_node_descriptor(&data) {
            Ok(nd) => nd,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to decode prior placement");
                continue;
            }
        };
        for svc in nd.services {
            assignment.insert(svc.name, nd.node.clone());
        }
    }
    assignment
}
