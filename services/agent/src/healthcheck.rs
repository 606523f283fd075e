//! Liveness monitoring with health-triggered restarts.
//!
//! One worker task per registered service. Each worker waits one interval
//! before the first probe (the VM has to boot), then probes on the
//! configured cadence until the service is deregistered. When consecutive
//! failures reach the retry threshold the injected restart callback fires
//! once, the failure count resets, and the status drops to Unknown until
//! the next probe.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use firework_spec::{HealthCheck, ProbeKind, ServiceDescriptor};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Outcome of the most recent probes for one service.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub service: String,
    pub status: HealthStatus,
    pub last_checked: Option<DateTime<Utc>>,
    /// Consecutive failures since the last success or restart.
    pub failures: u32,
    pub last_error: Option<String>,
}

pub type RestartFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Called when a service exceeds its failure threshold. Supplied by the
/// agent; performs stop + start on the VM manager.
pub type RestartFn = Arc<dyn Fn(String) -> RestartFuture + Send + Sync>;

/// Runs periodic liveness probes for registered services.
pub struct Monitor {
    restart: RestartFn,
    http: reqwest::Client,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    workers: HashMap<String, JoinHandle<()>>,
    results: HashMap<String, ProbeResult>,
}

impl Monitor {
    pub fn new(restart: RestartFn) -> Arc<Self> {
        Arc::new(Self {
            restart,
            http: reqwest::Client::new(),
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Start probing a service. An already registered service is replaced.
    pub fn register(self: &Arc<Self>, svc: &ServiceDescriptor) {
        let Some(hc) = svc.health_check.clone() else {
            return;
        };

        self.deregister(&svc.name);

        let name = svc.name.clone();
        let guest_ip = svc
            .network
            .as_ref()
            .and_then(|n| n.guest_ip.clone())
            .unwrap_or_default();
        let tenant = tenant_for(svc);

        {
            let mut inner = self.inner.lock().unwrap();
            inner.results.insert(
                name.clone(),
                ProbeResult {
                    service: name.clone(),
                    status: HealthStatus::Unknown,
                    last_checked: None,
                    failures: 0,
                    last_error: None,
                },
            );
        }

        info!(
            service = %name,
            kind = ?hc.kind,
            interval_secs = hc.interval.as_secs(),
            "registered health check"
        );

        let monitor = Arc::clone(self);
        let worker_name = name.clone();
        let handle = tokio::spawn(async move {
            monitor.run_worker(worker_name, hc, guest_ip, tenant).await;
        });

        self.inner.lock().unwrap().workers.insert(name, handle);
    }

    /// Stop probing a service and drop its state. Cancellation is prompt;
    /// no result entry survives deregistration.
    pub fn deregister(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(handle) = inner.workers.remove(name) {
            handle.abort();
        }
        inner.results.remove(name);
    }

    /// Cancel every worker.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        for (_, handle) in inner.workers.drain() {
            handle.abort();
        }
    }

    /// Snapshot of all current results.
    pub fn results(&self) -> HashMap<String, ProbeResult> {
        self.inner.lock().unwrap().results.clone()
    }

    pub fn get_result(&self, name: &str) -> Option<ProbeResult> {
        self.inner.lock().unwrap().results.get(name).cloned()
    }

    async fn run_worker(&self, name: String, hc: HealthCheck, guest_ip: String, tenant: String) {
        let interval = if hc.interval.is_zero() {
            Duration::from_secs(10)
        } else {
            hc.interval
        };

        // Give the VM time to boot before the first probe.
        tokio::time::sleep(interval).await;

        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let outcome = self.check(&hc, &guest_ip).await;
            self.record_result(&name, &hc, &tenant, outcome).await;
        }
    }

    /// Perform a single probe.
    async fn check(&self, hc: &HealthCheck, guest_ip: &str) -> Result<(), String> {
        let timeout = if hc.timeout.is_zero() {
            Duration::from_secs(5)
        } else {
            hc.timeout
        };

        let Some(target) = resolve_target(hc, guest_ip) else {
            return Err("health check has no target (no target, port, or guest address)".into());
        };

        match hc.kind {
            ProbeKind::Http => self.check_http(&target, timeout).await,
            ProbeKind::Tcp => check_tcp(&target, timeout).await,
        }
    }

    async fn check_http(&self, target: &str, timeout: Duration) -> Result<(), String> {
        let response = self
            .http
            .get(target)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| format!("HTTP check failed: {e}"))?;

        if !response.status().is_success() {
            return Err(format!("HTTP check returned status {}", response.status()));
        }
        Ok(())
    }

    /// Update the per-service record and fire the restart callback when
    /// the failure threshold is reached.
    async fn record_result(
        &self,
        name: &str,
        hc: &HealthCheck,
        tenant: &str,
        outcome: Result<(), String>,
    ) {
        let needs_restart = {
            let mut inner = self.inner.lock().unwrap();
            let Some(result) = inner.results.get_mut(name) else {
                return;
            };

            result.last_checked = Some(Utc::now());

            match &outcome {
                Err(message) => {
                    result.failures += 1;
                    result.last_error = Some(message.clone());
                    result.status = HealthStatus::Unhealthy;
                    warn!(
                        service = %name,
                        tenant = %tenant,
                        failures = result.failures,
                        error = %message,
                        "health check failed"
                    );
                }
                Ok(()) => {
                    if result.status == HealthStatus::Unhealthy {
                        info!(service = %name, tenant = %tenant, "service recovered");
                    }
                    result.failures = 0;
                    result.last_error = None;
                    result.status = HealthStatus::Healthy;
                }
            }

            let retries = if hc.retries == 0 { 3 } else { hc.retries };
            result.failures >= retries
        };

        if !needs_restart {
            return;
        }

        warn!(service = %name, tenant = %tenant, "service exceeded failure threshold, restarting");

        match (self.restart)(name.to_string()).await {
            Ok(()) => {
                let mut inner = self.inner.lock().unwrap();
                if let Some(result) = inner.results.get_mut(name) {
                    result.failures = 0;
                    result.status = HealthStatus::Unknown;
                }
            }
            Err(e) => {
                error!(service = %name, tenant = %tenant, error = %e, "failed to restart service");
            }
        }
    }
}

async fn check_tcp(target: &str, timeout: Duration) -> Result<(), String> {
    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(target)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(format!("TCP check failed: {e}")),
        Err(_) => Err("TCP check failed: connection timed out".into()),
    }
}

/// Resolve the probe target. An explicit target wins; otherwise the target
/// is composed from the port, path, and the guest address allocated at
/// runtime (CIDR suffix stripped).
pub fn resolve_target(hc: &HealthCheck, guest_ip: &str) -> Option<String> {
    if let Some(target) = &hc.target {
        if !target.is_empty() {
            return Some(target.clone());
        }
    }
    if hc.port == 0 || guest_ip.is_empty() {
        return None;
    }

    let host = firework_spec::strip_cidr(guest_ip);
    match hc.kind {
        ProbeKind::Http => Some(format!("http://{host}:{}{}", hc.port, hc.path)),
        ProbeKind::Tcp => Some(format!("{host}:{}", hc.port)),
    }
}

pub(crate) fn tenant_for(svc: &ServiceDescriptor) -> String {
    match svc.metadata.get("tenant").map(|t| t.trim()) {
        Some(t) if !t.is_empty() => t.to_string(),
        _ => "shared".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn http_check(port: u16, path: &str) -> HealthCheck {
        HealthCheck {
            kind: ProbeKind::Http,
            target: None,
            port,
            path: path.to_string(),
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
            retries: 3,
        }
    }

    #[test]
    fn target_composes_from_guest_address() {
        let hc = http_check(5601, "/api/status");
        assert_eq!(
            resolve_target(&hc, "172.16.0.2/24").unwrap(),
            "http://172.16.0.2:5601/api/status"
        );
    }

    #[test]
    fn tcp_target_has_no_scheme() {
        let hc = HealthCheck {
            kind: ProbeKind::Tcp,
            ..http_check(9200, "")
        };
        assert_eq!(resolve_target(&hc, "172.16.0.2").unwrap(), "172.16.0.2:9200");
    }

    #[test]
    fn explicit_target_wins_over_composition() {
        let mut hc = http_check(5601, "/api/status");
        hc.target = Some("http://127.0.0.1:9999/custom".to_string());
        assert_eq!(
            resolve_target(&hc, "172.16.0.2").unwrap(),
            "http://127.0.0.1:9999/custom"
        );
    }

    #[test]
    fn missing_port_and_target_yields_none() {
        let hc = http_check(0, "");
        assert!(resolve_target(&hc, "172.16.0.2").is_none());
        let hc = http_check(80, "");
        assert!(resolve_target(&hc, "").is_none());
    }

    #[test]
    fn tenant_label_defaults_to_shared() {
        let svc = ServiceDescriptor {
            name: "web".to_string(),
            ..Default::default()
        };
        assert_eq!(tenant_for(&svc), "shared");

        let svc = ServiceDescriptor {
            metadata: [("tenant".to_string(), "acme".to_string())].into(),
            ..svc
        };
        assert_eq!(tenant_for(&svc), "acme");
    }

    fn noop_restart(counter: Arc<AtomicUsize>) -> RestartFn {
        Arc::new(move |_name| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    fn probed_service(name: &str, retries: u32) -> ServiceDescriptor {
        ServiceDescriptor {
            name: name.to_string(),
            health_check: Some(HealthCheck {
                retries,
                ..http_check(8080, "/health")
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn register_creates_unknown_result() {
        let monitor = Monitor::new(noop_restart(Arc::new(AtomicUsize::new(0))));
        monitor.register(&probed_service("web", 3));

        let result = monitor.get_result("web").unwrap();
        assert_eq!(result.status, HealthStatus::Unknown);
        assert_eq!(result.failures, 0);
        monitor.stop();
    }

    #[tokio::test]
    async fn deregister_removes_all_state() {
        let monitor = Monitor::new(noop_restart(Arc::new(AtomicUsize::new(0))));
        monitor.register(&probed_service("web", 3));
        monitor.deregister("web");

        assert!(monitor.get_result("web").is_none());
        assert!(monitor.results().is_empty());
    }

    #[tokio::test]
    async fn service_without_probe_is_ignored() {
        let monitor = Monitor::new(noop_restart(Arc::new(AtomicUsize::new(0))));
        let svc = ServiceDescriptor {
            name: "web".to_string(),
            ..Default::default()
        };
        monitor.register(&svc);
        assert!(monitor.get_result("web").is_none());
    }

    #[tokio::test]
    async fn restart_fires_once_at_threshold_and_resets() {
        let counter = Arc::new(AtomicUsize::new(0));
        let monitor = Monitor::new(noop_restart(Arc::clone(&counter)));
        monitor.register(&probed_service("web", 2));

        let hc = HealthCheck {
            retries: 2,
            ..http_check(8080, "/health")
        };

        monitor
            .record_result("web", &hc, "shared", Err("boom".into()))
            .await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(monitor.get_result("web").unwrap().status, HealthStatus::Unhealthy);

        monitor
            .record_result("web", &hc, "shared", Err("boom".into()))
            .await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let result = monitor.get_result("web").unwrap();
        assert_eq!(result.failures, 0);
        assert_eq!(result.status, HealthStatus::Unknown);
        monitor.stop();
    }

    #[tokio::test]
    async fn recovery_resets_failures() {
        let monitor = Monitor::new(noop_restart(Arc::new(AtomicUsize::new(0))));
        monitor.register(&probed_service("web", 5));

        let hc = HealthCheck {
            retries: 5,
            ..http_check(8080, "/health")
        };

        monitor
            .record_result("web", &hc, "shared", Err("boom".into()))
            .await;
        monitor.record_result("web", &hc, "shared", Ok(())).await;

        let result = monitor.get_result("web").unwrap();
        assert_eq!(result.status, HealthStatus::Healthy);
        assert_eq!(result.failures, 0);
        assert!(result.last_error.is_none());
        monitor.stop();
    }
}
