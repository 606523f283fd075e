//! Bin-packing placement of services onto nodes.
//!
//! [`schedule`] is a pure function: given enriched services, the live node
//! inventory, and the previous assignment, it returns per-node service
//! lists. Two phases, both stable:
//!
//! 1. Honour the existing placement where the node is still alive, still
//!    has capacity, and no same-group service was already committed to it
//!    during this pass.
//! 2. Best-fit the rest onto the node with the most remaining vCPU
//!    capacity (largest request first), preferring nodes without the
//!    service's anti-affinity group.

mod inventory;

pub use inventory::{NodeInventory, NodeInventoryEntry, StaticInventory};

use std::collections::{BTreeMap, HashMap, HashSet};

use firework_spec::{NodeDescriptor, ServiceDescriptor};
use thiserror::Error;

/// An active node with its total capacity.
#[derive(Debug, Clone)]
pub struct Node {
    /// Instance id, also the descriptor key in the store.
    pub instance_id: String,
    pub capacity_vcpus: u32,
    pub capacity_memory_mb: u32,
}

/// Errors from a scheduling call.
///
/// A scheduling failure must propagate: the publisher treats an empty
/// success as intent to delete every descriptor, so "no nodes" and
/// "no capacity" are hard errors rather than empty assignments.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("no active nodes available to schedule {services} service(s)")]
    NoNodes { services: usize },

    #[error("no node has sufficient capacity for service {name} (needs {vcpus} vCPU, {memory_mb} MB)")]
    InsufficientCapacity {
        name: String,
        vcpus: u32,
        memory_mb: u32,
    },
}

/// Per-node placement result: instance id → services assigned to it.
pub type Assignment = BTreeMap<String, Vec<ServiceDescriptor>>;

/// Distribute services across nodes, preserving `prior` placements when
/// possible. `prior` maps service name → instance id from the previous run.
pub fn schedule(
    services: &[ServiceDescriptor],
    nodes: &[Node],
    prior: &HashMap<String, String>,
) -> Result<Assignment, ScheduleError> {
    if nodes.is_empty() {
        if !services.is_empty() {
            return Err(ScheduleError::NoNodes {
                services: services.len(),
            });
        }
        return Ok(Assignment::new());
    }

    let node_by_id: HashMap<&str, &Node> = nodes
        .iter()
        .map(|n| (n.instance_id.as_str(), n))
        .collect();

    let mut result = Assignment::new();
    let mut used_vcpus: HashMap<&str, u32> = HashMap::new();
    let mut used_mem: HashMap<&str, u32> = HashMap::new();
    // Anti-affinity groups already committed to each node during this call.
    let mut node_groups: HashMap<&str, HashSet<String>> = HashMap::new();
    for n in nodes {
        result.insert(n.instance_id.clone(), Vec::new());
        node_groups.insert(n.instance_id.as_str(), HashSet::new());
    }

    // Phase 1: keep services on their prior node where possible.
    let mut unplaced: Vec<&ServiceDescriptor> = Vec::new();
    for svc in services {
        let Some(prior_node) = prior.get(&svc.name) else {
            unplaced.push(svc);
            continue;
        };
        let Some(node) = node_by_id.get(prior_node.as_str()) else {
            unplaced.push(svc);
            continue;
        };

        let id = node.instance_id.as_str();
        if used_vcpus.get(id).copied().unwrap_or(0) + svc.vcpus > node.capacity_vcpus
            || used_mem.get(id).copied().unwrap_or(0) + svc.memory_mb > node.capacity_memory_mb
        {
            unplaced.push(svc);
            continue;
        }

        // Yield to phase 2 when another service in the same group already
        // committed to this node, so the conflict can spread to a node that
        // only just became available.
        if let Some(group) = svc.anti_affinity_group.as_deref() {
            if node_groups[id].contains(group) {
                unplaced.push(svc);
                continue;
            }
        }

        commit(
            svc,
            id,
            &mut result,
            &mut used_vcpus,
            &mut used_mem,
            &mut node_groups,
        );
    }

    // Phase 2: best-fit, largest request first.
    unplaced.sort_by(|a, b| b.vcpus.cmp(&a.vcpus));

    for svc in unplaced {
        let Some(target) = best_fit(nodes, svc, &used_vcpus, &used_mem, &node_groups) else {
            return Err(ScheduleError::InsufficientCapacity {
                name: svc.name.clone(),
                vcpus: svc.vcpus,
                memory_mb: svc.memory_mb,
            });
        };
        commit(
            svc,
            target,
            &mut result,
            &mut used_vcpus,
            &mut used_mem,
            &mut node_groups,
        );
    }

    Ok(result)
}

fn commit<'a>(
    svc: &ServiceDescriptor,
    node_id: &'a str,
    result: &mut Assignment,
    used_vcpus: &mut HashMap<&'a str, u32>,
    used_mem: &mut HashMap<&'a str, u32>,
    node_groups: &mut HashMap<&'a str, HashSet<String>>,
) {
    result.get_mut(node_id).unwrap().push(svc.clone());
    *used_vcpus.entry(node_id).or_default() += svc.vcpus;
    *used_mem.entry(node_id).or_default() += svc.memory_mb;
    if let Some(group) = svc.anti_affinity_group.as_deref() {
        node_groups.get_mut(node_id).unwrap().insert(group.to_string());
    }
}

/// Pick the node with the most free vCPUs that still fits the request,
/// preferring nodes that do not already host the service's anti-affinity
/// group. With a single node (or all nodes conflicted) the constraint
/// degrades to a preference and the service co-locates.
fn best_fit<'a>(
    nodes: &'a [Node],
    svc: &ServiceDescriptor,
    used_vcpus: &HashMap<&str, u32>,
    used_mem: &HashMap<&str, u32>,
    node_groups: &HashMap<&str, HashSet<String>>,
) -> Option<&'a str> {
    let mut best: Option<&str> = None;
    let mut best_free = 0u32;
    let mut best_has_conflict = true;

    for n in nodes {
        let id = n.instance_id.as_str();
        let free_vcpus = n
            .capacity_vcpus
            .saturating_sub(used_vcpus.get(id).copied().unwrap_or(0));
        let free_mem = n
            .capacity_memory_mb
            .saturating_sub(used_mem.get(id).copied().unwrap_or(0));

        if free_vcpus < svc.vcpus || free_mem < svc.memory_mb {
            continue;
        }

        let has_conflict = svc
            .anti_affinity_group
            .as_deref()
            .map(|g| node_groups[id].contains(g))
            .unwrap_or(false);

        let better = best.is_none()
            || (best_has_conflict && !has_conflict)
            || (best_has_conflict == has_conflict && free_vcpus > best_free);
        if better {
            best = Some(id);
            best_free = free_vcpus;
            best_has_conflict = has_conflict;
        }
    }

    best
}

/// Convert an assignment into descriptors ready for publishing. Nodes with
/// no services are dropped; output is ordered by node id.
pub fn build_node_descriptors(assignment: Assignment) -> Vec<NodeDescriptor> {
    assignment
        .into_iter()
        .filter(|(_, services)| !services.is_empty())
        .map(|(node, services)| NodeDescriptor {
            node,
            services,
            ..Default::default()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc(name: &str, vcpus: u32, memory_mb: u32) -> ServiceDescriptor {
        ServiceDescriptor {
            name: name.to_string(),
            image: format!("/var/lib/images/{name}-rootfs.ext4"),
            vcpus,
            memory_mb,
            ..Default::default()
        }
    }

    fn grouped(name: &str, vcpus: u32, memory_mb: u32, group: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            anti_affinity_group: Some(group.to_string()),
            ..svc(name, vcpus, memory_mb)
        }
    }

    fn node(id: &str, vcpus: u32, memory_mb: u32) -> Node {
        Node {
            instance_id: id.to_string(),
            capacity_vcpus: vcpus,
            capacity_memory_mb: memory_mb,
        }
    }

    fn placed_on(assignment: &Assignment, node: &str) -> Vec<String> {
        assignment[node].iter().map(|s| s.name.clone()).collect()
    }

    #[test]
    fn empty_services_with_nodes_is_an_empty_assignment() {
        let nodes = vec![node("i-1", 8, 4096)];
        let assignment = schedule(&[], &nodes, &HashMap::new()).unwrap();
        let total: usize = assignment.values().map(Vec::len).sum();
        assert_eq!(total, 0);
    }

    #[test]
    fn services_without_nodes_is_an_error() {
        let services = vec![svc("a", 1, 256)];
        let err = schedule(&services, &[], &HashMap::new()).unwrap_err();
        assert!(matches!(err, ScheduleError::NoNodes { services: 1 }));
    }

    #[test]
    fn prior_placement_is_preserved() {
        let services = vec![svc("a", 2, 512), svc("b", 2, 512)];
        let nodes = vec![node("i-1", 8, 4096), node("i-2", 8, 4096)];
        let prior = HashMap::from([
            ("a".to_string(), "i-2".to_string()),
            ("b".to_string(), "i-1".to_string()),
        ]);

        let assignment = schedule(&services, &nodes, &prior).unwrap();
        assert_eq!(placed_on(&assignment, "i-2"), vec!["a"]);
        assert_eq!(placed_on(&assignment, "i-1"), vec!["b"]);
    }

    #[test]
    fn service_fails_over_when_prior_node_is_gone() {
        let services = vec![svc("a", 1, 256)];
        let nodes = vec![node("i-new", 4, 2048)];
        let prior = HashMap::from([("a".to_string(), "i-old".to_string())]);

        let assignment = schedule(&services, &nodes, &prior).unwrap();
        assert_eq!(placed_on(&assignment, "i-new"), vec!["a"]);
    }

    #[test]
    fn anti_affinity_rebalances_when_a_node_appears() {
        let services = vec![
            grouped("es1", 4, 4096, "es"),
            grouped("es2", 4, 4096, "es"),
        ];
        let nodes = vec![node("i-1", 64, 65536), node("i-2", 64, 65536)];
        let prior = HashMap::from([
            ("es1".to_string(), "i-1".to_string()),
            ("es2".to_string(), "i-1".to_string()),
        ]);

        let assignment = schedule(&services, &nodes, &prior).unwrap();
        assert_eq!(assignment["i-1"].len(), 1);
        assert_eq!(assignment["i-2"].len(), 1);
    }

    #[test]
    fn anti_affinity_spreads_across_equal_nodes() {
        let services = vec![
            grouped("es1", 2, 1024, "es"),
            grouped("es2", 2, 1024, "es"),
        ];
        let nodes = vec![node("i-1", 8, 8192), node("i-2", 8, 8192)];

        let assignment = schedule(&services, &nodes, &HashMap::new()).unwrap();
        assert_eq!(assignment["i-1"].len(), 1);
        assert_eq!(assignment["i-2"].len(), 1);
    }

    #[test]
    fn anti_affinity_degrades_to_preference_on_a_single_node() {
        let services = vec![
            grouped("es1", 2, 1024, "es"),
            grouped("es2", 2, 1024, "es"),
        ];
        let nodes = vec![node("i-1", 8, 8192)];

        let assignment = schedule(&services, &nodes, &HashMap::new()).unwrap();
        assert_eq!(assignment["i-1"].len(), 2);
    }

    #[test]
    fn every_service_is_placed_exactly_once() {
        let services = vec![
            svc("a", 2, 512),
            svc("b", 4, 1024),
            svc("c", 1, 256),
            svc("d", 3, 768),
        ];
        let nodes = vec![node("i-1", 6, 4096), node("i-2", 6, 4096)];

        let assignment = schedule(&services, &nodes, &HashMap::new()).unwrap();
        let mut placed: Vec<String> = assignment
            .values()
            .flatten()
            .map(|s| s.name.clone())
            .collect();
        placed.sort();
        assert_eq!(placed, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn insufficient_capacity_fails_the_whole_call() {
        let services = vec![svc("big", 16, 1024)];
        let nodes = vec![node("i-1", 8, 4096)];

        let err = schedule(&services, &nodes, &HashMap::new()).unwrap_err();
        assert!(matches!(
            err,
            ScheduleError::InsufficientCapacity { ref name, .. } if name == "big"
        ));
    }

    #[test]
    fn prior_node_without_capacity_defers_to_best_fit() {
        let services = vec![svc("a", 6, 1024), svc("b", 4, 1024)];
        let nodes = vec![node("i-1", 8, 4096), node("i-2", 8, 4096)];
        // Both claim i-1; the second no longer fits there.
        let prior = HashMap::from([
            ("a".to_string(), "i-1".to_string()),
            ("b".to_string(), "i-1".to_string()),
        ]);

        let assignment = schedule(&services, &nodes, &prior).unwrap();
        assert_eq!(placed_on(&assignment, "i-1"), vec!["a"]);
        assert_eq!(placed_on(&assignment, "i-2"), vec!["b"]);
    }

    #[test]
    fn build_node_descriptors_drops_empty_nodes_and_sorts() {
        let services = vec![svc("a", 1, 256)];
        let nodes = vec![node("i-2", 8, 4096), node("i-1", 8, 4096)];
        let assignment = schedule(&services, &nodes, &HashMap::new()).unwrap();

        let descriptors = build_node_descriptors(assignment);
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].services[0].name, "a");
    }
}
