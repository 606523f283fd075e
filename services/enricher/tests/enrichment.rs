//! End-to-end enrichment: input tree in, published descriptors out.

use std::path::Path;
use std::sync::Arc;

use firework_enricher::resolver::StaticResolver;
use firework_enricher::{run, RunOptions};
use firework_scheduler::{NodeInventoryEntry, StaticInventory};

fn write(path: &Path, content: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn inventory(nodes: &[(&str, u32, u32)]) -> Arc<StaticInventory> {
    Arc::new(StaticInventory::new(
        nodes
            .iter()
            .map(|(id, vcpus, mem)| NodeInventoryEntry {
                instance_id: id.to_string(),
                capacity_vcpus: *vcpus,
                capacity_memory_mb: *mem,
            })
            .collect(),
    ))
}

#[tokio::test]
async fn tenant_fleet_is_enriched_placed_and_linked() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();

    write(
        &input.path().join("defaults.yaml"),
        "kernel: /var/lib/images/vmlinux-5.10\nvcpus: 1\nmemory_mb: 512\n",
    );
    write(
        &input.path().join("services/elasticsearch.yaml"),
        r#"
name: elasticsearch
image: /var/lib/images/elasticsearch-rootfs.ext4
node_type: data
network: true
vcpus: 2
anti_affinity_group: es
node_host_ip_env: ES_PUBLISH_HOST
port_forwards:
  - host_port: 19200
    vm_port: 9200
health_check:
  type: http
  port: 9200
  path: /_cluster/health
"#,
    );
    write(
        &input.path().join("services/kibana.yaml"),
        r#"
name: kibana
image: /var/lib/images/kibana-rootfs.ext4
node_type: web
network: true
links:
  - service: elasticsearch
    env: ES_HOSTS
    port: 9200
cross_node_links:
  - service: elasticsearch
    env: ES_REMOTE
    host_port: 19200
"#,
    );

    let opts = RunOptions {
        input_dir: input.path().to_path_buf(),
        output_dir: output.path().to_path_buf(),
        inventory: Some(inventory(&[("i-a", 8, 8192), ("i-b", 8, 8192)])),
        resolver: Some(Arc::new(StaticResolver::new(
            [
                ("i-a".to_string(), "10.0.1.10".to_string()),
                ("i-b".to_string(), "10.0.1.11".to_string()),
            ]
            .into(),
        ))),
        dry_run: false,
    };

    let outcome = run(&opts).await.unwrap();

    // Everything placed, each descriptor published under its instance id.
    let all: Vec<_> = outcome
        .node_descriptors
        .iter()
        .flat_map(|nd| nd.services.iter().map(|s| s.name.clone()))
        .collect();
    assert!(all.contains(&"elasticsearch".to_string()));
    assert!(all.contains(&"kibana".to_string()));

    for nd in &outcome.node_descriptors {
        assert!(output
            .path()
            .join(format!("nodes/{}.yaml", nd.node))
            .exists());
        assert!(nd.host_ip.is_some());

        for svc in &nd.services {
            // Enrichment filled the ambient fields.
            assert_eq!(svc.kernel, "/var/lib/images/vmlinux-5.10");
            assert!(svc.vcpus > 0);
            assert!(svc.memory_mb > 0);

            if svc.name == "elasticsearch" {
                // Own host address injected via node_host_ip_env.
                let host = nd.host_ip.clone().unwrap();
                assert_eq!(svc.env["ES_PUBLISH_HOST"], host);
                let hc = svc.health_check.as_ref().unwrap();
                assert_eq!(hc.port, 9200);
                assert!(hc.target.is_none());
            }

            if svc.name == "kibana" {
                // Cross-node link resolved to the peer's host + host port.
                let es_node = outcome
                    .node_descriptors
                    .iter()
                    .find(|nd| nd.services.iter().any(|s| s.name == "elasticsearch"))
                    .unwrap();
                let expected =
                    format!("{}:19200", es_node.host_ip.clone().unwrap());
                assert_eq!(svc.env["ES_REMOTE"], expected);
                // Same-node links stay symbolic for the agent to resolve.
                assert_eq!(svc.links[0].service, "elasticsearch");
                assert!(!svc.env.contains_key("ES_HOSTS"));
            }
        }
    }
}

#[tokio::test]
async fn anti_affinity_spreads_tenant_replicas() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();

    for name in ["es1", "es2"] {
        write(
            &input.path().join(format!("services/{name}.yaml")),
            &format!(
                "name: {name}\nimage: /img/{name}.ext4\nnode_type: data\nvcpus: 4\nmemory_mb: 4096\nanti_affinity_group: es\n"
            ),
        );
    }

    let opts = RunOptions {
        input_dir: input.path().to_path_buf(),
        output_dir: output.path().to_path_buf(),
        inventory: Some(inventory(&[("i-1", 64, 65536), ("i-2", 64, 65536)])),
        resolver: None,
        dry_run: true,
    };

    let outcome = run(&opts).await.unwrap();
    assert_eq!(outcome.node_descriptors.len(), 2);
    for nd in &outcome.node_descriptors {
        assert_eq!(nd.services.len(), 1);
    }
}

#[tokio::test]
async fn standalone_tenant_mode_needs_no_services_directory() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();

    write(
        &input.path().join("tenants/acme/worker.yaml"),
        "node_type: batch\nvcpus: 2\nmemory_mb: 1024\n",
    );

    let opts = RunOptions {
        input_dir: input.path().to_path_buf(),
        output_dir: output.path().to_path_buf(),
        inventory: None,
        resolver: None,
        dry_run: false,
    };

    let outcome = run(&opts).await.unwrap();
    assert_eq!(outcome.node_descriptors.len(), 1);
    let nd = &outcome.node_descriptors[0];
    assert_eq!(nd.node, "batch");
    assert_eq!(nd.services[0].name, "acme-worker");
    assert_eq!(
        nd.services[0].image,
        "/var/lib/images/acme-worker-rootfs.ext4"
    );
    assert!(output.path().join("nodes/batch.yaml").exists());
}
