//! Agent runtime metrics.
//!
//! A single prometheus registry backs both the `/metrics` endpoint and
//! the node-capacity gauges the scheduler's inventory discovery consumes
//! (`firework_node_capacity_vcpus` / `firework_node_capacity_memory_mb`,
//! tagged with the node id).

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use prometheus::{
    Counter, Encoder, Gauge, GaugeVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

use crate::capacity::NodeCapacity;
use crate::healthcheck::{tenant_for, HealthStatus, ProbeResult};
use crate::vm::Instance;

pub struct AgentMetrics {
    registry: Registry,

    reconcile_runs: IntCounter,
    reconcile_errors: IntCounter,
    reconcile_duration_sum: Counter,
    reconcile_duration_last: Gauge,

    imagesync_runs: IntCounter,
    imagesync_errors: IntCounter,
    imagesync_duration_sum: Counter,
    imagesync_duration_last: Gauge,

    service_restarts: IntCounterVec,
    service_health: IntGaugeVec,
    service_state: IntGaugeVec,

    config_fetch_success: GaugeVec,
    enrichment_timestamp: GaugeVec,
    last_applied_at: Gauge,
    applied_revision_info: GaugeVec,
    last_applied_revision: Mutex<String>,

    capacity_vcpus: IntGauge,
    capacity_memory_mb: IntGauge,
    used_vcpus: IntGauge,
    used_memory_mb: IntGauge,
}

impl AgentMetrics {
    pub fn new(node: &str) -> prometheus::Result<Self> {
        let registry = Registry::new();
        let label = |name: &str, help: &str| {
            Opts::new(name, help).const_label("node", node)
        };

        let reconcile_runs = IntCounter::with_opts(label(
            "firework_agent_reconcile_runs_total",
            "Total number of reconcile runs.",
        ))?;
        let reconcile_errors = IntCounter::with_opts(label(
            "firework_agent_reconcile_errors_total",
            "Total number of failed reconcile runs.",
        ))?;
        let reconcile_duration_sum = Counter::with_opts(label(
            "firework_agent_reconcile_duration_seconds_total",
            "Total cumulative reconcile duration in seconds.",
        ))?;
        let reconcile_duration_last = Gauge::with_opts(label(
            "firework_agent_reconcile_duration_seconds_last",
            "Duration of the latest reconcile run in seconds.",
        ))?;

        let imagesync_runs = IntCounter::with_opts(label(
            "firework_agent_imagesync_runs_total",
            "Total number of image sync runs.",
        ))?;
        let imagesync_errors = IntCounter::with_opts(label(
            "firework_agent_imagesync_errors_total",
            "Total number of failed image sync runs.",
        ))?;
        let imagesync_duration_sum = Counter::with_opts(label(
            "firework_agent_imagesync_duration_seconds_total",
            "Total cumulative image sync duration in seconds.",
        ))?;
        let imagesync_duration_last = Gauge::with_opts(label(
            "firework_agent_imagesync_duration_seconds_last",
            "Duration of the latest image sync run in seconds.",
        ))?;

        let service_restarts = IntCounterVec::new(
            label(
                "firework_agent_service_restarts_total",
                "Total service restarts triggered by health checks.",
            ),
            &["service", "tenant"],
        )?;
        let service_health = IntGaugeVec::new(
            label(
                "firework_agent_service_health",
                "Service health gauge (1=healthy, 0=unhealthy, -1=unknown).",
            ),
            &["service", "tenant"],
        )?;
        let service_state = IntGaugeVec::new(
            label(
                "firework_agent_service_state",
                "Service state gauge (1 for the current state label).",
            ),
            &["service", "tenant", "state"],
        )?;

        let config_fetch_success = GaugeVec::new(
            label(
                "firework_agent_config_last_fetch_success_timestamp_seconds",
                "Unix timestamp of last successful config fetch per node label.",
            ),
            &["label"],
        )?;
        let enrichment_timestamp = GaugeVec::new(
            label(
                "firework_agent_config_last_enrichment_timestamp_seconds",
                "Unix timestamp of the source descriptor's last production per node label.",
            ),
            &["label"],
        )?;
        let last_applied_at = Gauge::with_opts(label(
            "firework_agent_config_last_applied_timestamp_seconds",
            "Unix timestamp of the last successfully applied config.",
        ))?;
        let applied_revision_info = GaugeVec::new(
            label(
                "firework_agent_config_last_applied_revision_info",
                "Info metric for the last successfully applied revision.",
            ),
            &["revision"],
        )?;

        let capacity_vcpus = IntGauge::with_opts(label(
            "firework_node_capacity_vcpus",
            "Total vCPU capacity of the node.",
        ))?;
        let capacity_memory_mb = IntGauge::with_opts(label(
            "firework_node_capacity_memory_mb",
            "Total memory capacity of the node in MB.",
        ))?;
        let used_vcpus = IntGauge::with_opts(label(
            "firework_node_used_vcpus",
            "Total vCPUs requested by desired services.",
        ))?;
        let used_memory_mb = IntGauge::with_opts(label(
            "firework_node_used_memory_mb",
            "Total memory requested by desired services in MB.",
        ))?;

        for collector in [
            Box::new(reconcile_runs.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(reconcile_errors.clone()),
            Box::new(reconcile_duration_sum.clone()),
            Box::new(reconcile_duration_last.clone()),
            Box::new(imagesync_runs.clone()),
            Box::new(imagesync_errors.clone()),
            Box::new(imagesync_duration_sum.clone()),
            Box::new(imagesync_duration_last.clone()),
            Box::new(service_restarts.clone()),
            Box::new(service_health.clone()),
            Box::new(service_state.clone()),
            Box::new(config_fetch_success.clone()),
            Box::new(enrichment_timestamp.clone()),
            Box::new(last_applied_at.clone()),
            Box::new(applied_revision_info.clone()),
            Box::new(capacity_vcpus.clone()),
            Box::new(capacity_memory_mb.clone()),
            Box::new(used_vcpus.clone()),
            Box::new(used_memory_mb.clone()),
        ] {
            registry.register(collector)?;
        }

        Ok(Self {
            registry,
            reconcile_runs,
            reconcile_errors,
            reconcile_duration_sum,
            reconcile_duration_last,
            imagesync_runs,
            imagesync_errors,
            imagesync_duration_sum,
            imagesync_duration_last,
            service_restarts,
            service_health,
            service_state,
            config_fetch_success,
            enrichment_timestamp,
            last_applied_at,
            applied_revision_info,
            last_applied_revision: Mutex::new(String::new()),
            capacity_vcpus,
            capacity_memory_mb,
            used_vcpus,
            used_memory_mb,
        })
    }

    pub fn observe_reconcile(&self, duration: Duration, failed: bool) {
        self.reconcile_runs.inc();
        if failed {
            self.reconcile_errors.inc();
        }
        let secs = duration.as_secs_f64();
        self.reconcile_duration_sum.inc_by(secs);
        self.reconcile_duration_last.set(secs);
    }

    pub fn observe_image_sync(&self, duration: Duration, failed: bool) {
        self.imagesync_runs.inc();
        if failed {
            self.imagesync_errors.inc();
        }
        let secs = duration.as_secs_f64();
        self.imagesync_duration_sum.inc_by(secs);
        self.imagesync_duration_last.set(secs);
    }

    pub fn record_service_restart(&self, service: &str, tenant: &str) {
        self.service_restarts
            .with_label_values(&[service, tenant])
            .inc();
    }

    pub fn record_config_fetch_success(&self, label: &str, at: DateTime<Utc>) {
        if label.is_empty() {
            return;
        }
        self.config_fetch_success
            .with_label_values(&[label])
            .set(at.timestamp() as f64);
    }

    pub fn record_enrichment_timestamp(&self, label: &str, at: DateTime<Utc>) {
        if label.is_empty() {
            return;
        }
        self.enrichment_timestamp
            .with_label_values(&[label])
            .set(at.timestamp() as f64);
    }

    pub fn record_config_apply(&self, revision: &str, at: DateTime<Utc>) {
        self.last_applied_at.set(at.timestamp() as f64);
        if revision.is_empty() {
            return;
        }
        // One live series per revision value.
        self.applied_revision_info.reset();
        self.applied_revision_info
            .with_label_values(&[revision])
            .set(1.0);
        *self.last_applied_revision.lock().unwrap() = revision.to_string();
    }

    pub fn last_applied_revision(&self) -> String {
        self.last_applied_revision.lock().unwrap().clone()
    }

    /// Replace the per-service gauges in one shot so deleted services do
    /// not leave stale series behind.
    pub fn set_service_snapshot(
        &self,
        instances: &std::collections::HashMap<String, Instance>,
        health: &std::collections::HashMap<String, ProbeResult>,
    ) {
        self.service_health.reset();
        self.service_state.reset();

        for inst in instances.values() {
            let tenant = tenant_for(&inst.descriptor);
            let state = format!("{:?}", inst.state).to_lowercase();
            self.service_state
                .with_label_values(&[&inst.name, &tenant, &state])
                .set(1);

            let health_value = match health.get(&inst.name).map(|r| r.status) {
                Some(HealthStatus::Healthy) => 1,
                Some(HealthStatus::Unhealthy) => 0,
                _ => -1,
            };
            self.service_health
                .with_label_values(&[&inst.name, &tenant])
                .set(health_value);
        }
    }

    pub fn set_capacity(&self, capacity: NodeCapacity, used: NodeCapacity) {
        self.capacity_vcpus.set(capacity.vcpus as i64);
        self.capacity_memory_mb.set(capacity.memory_mb as i64);
        self.used_vcpus.set(used.vcpus as i64);
        self.used_memory_mb.set(used.memory_mb as i64);
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
