//! Status and health HTTP API.
//!
//! Endpoints: `/healthz` (agent liveness), `/status` (service list with
//! state and probe results), `/health` (probe results only), and
//! `/metrics` (text exposition).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use crate::healthcheck::{Monitor, ProbeResult};
use crate::metrics::AgentMetrics;
use crate::vm::{VmRuntime, VmState};

/// Shared handles the API reads from.
#[derive(Clone)]
pub struct ApiState {
    pub node: String,
    pub vm: Arc<dyn VmRuntime>,
    pub health: Option<Arc<Monitor>>,
    pub metrics: Arc<AgentMetrics>,
    pub last_revision: Arc<Mutex<String>>,
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    time: String,
}

#[derive(Debug, Serialize)]
struct ServiceStatus {
    name: String,
    state: VmState,
    pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    health: Option<ProbeResult>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    node: String,
    last_revision: String,
    services: Vec<ServiceStatus>,
    health_checks: HashMap<String, ProbeResult>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    checks: HashMap<String, ProbeResult>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve the API until shutdown is signalled.
pub async fn serve(
    addr: SocketAddr,
    state: ApiState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding API listener on {addr}"))?;

    info!(addr = %addr, "starting API server");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .context("API server")
}

async fn healthz() -> impl IntoResponse {
    Json(HealthzResponse {
        status: "ok",
        time: Utc::now().to_rfc3339(),
    })
}

async fn status(State(state): State<ApiState>) -> impl IntoResponse {
    let health_checks = state
        .health
        .as_ref()
        .map(|m| m.results())
        .unwrap_or_default();

    let mut services: Vec<ServiceStatus> = state
        .vm
        .list()
        .into_values()
        .map(|inst| ServiceStatus {
            health: health_checks.get(&inst.name).cloned(),
            name: inst.name,
            state: inst.state,
            pid: inst.pid,
        })
        .collect();
    services.sort_by(|a, b| a.name.cmp(&b.name));

    Json(StatusResponse {
        node: state.node.clone(),
        last_revision: state.last_revision.lock().unwrap().clone(),
        services,
        health_checks,
    })
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let checks = state
        .health
        .as_ref()
        .map(|m| m.results())
        .unwrap_or_default();
    Json(HealthResponse { checks })
}

async fn metrics(State(state): State<ApiState>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Instance;
    use async_trait::async_trait;
    use firework_spec::ServiceDescriptor;

    struct FakeRuntime {
        instances: HashMap<String, Instance>,
    }

    #[async_trait]
    impl VmRuntime for FakeRuntime {
        fn list(&self) -> HashMap<String, Instance> {
            self.instances.clone()
        }

        fn get(&self, name: &str) -> Option<Instance> {
            self.instances.get(name).cloned()
        }

        async fn start(&self, _descriptor: &ServiceDescriptor) -> Result<()> {
            Ok(())
        }

        async fn stop(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        async fn remove(&self, _name: &str) -> Result<()> {
            Ok(())
        }
    }

    fn state_with(instances: HashMap<String, Instance>) -> ApiState {
        ApiState {
            node: "i-test".to_string(),
            vm: Arc::new(FakeRuntime { instances }),
            health: None,
            metrics: Arc::new(AgentMetrics::new("i-test").unwrap()),
            last_revision: Arc::new(Mutex::new("rev-1".to_string())),
        }
    }

    #[tokio::test]
    async fn status_lists_services_sorted() {
        let mk = |name: &str| Instance {
            name: name.to_string(),
            descriptor: ServiceDescriptor {
                name: name.to_string(),
                ..Default::default()
            },
            state: VmState::Running,
            pid: 42,
            socket_path: Default::default(),
        };
        let instances = HashMap::from([
            ("web".to_string(), mk("web")),
            ("api".to_string(), mk("api")),
        ]);

        let response = status(State(state_with(instances))).await.into_response();
        assert_eq!(response.status(), axum::http::StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["node"], "i-test");
        assert_eq!(parsed["last_revision"], "rev-1");
        assert_eq!(parsed["services"][0]["name"], "api");
        assert_eq!(parsed["services"][1]["name"], "web");
        assert_eq!(parsed["services"][0]["state"], "running");
    }

    #[tokio::test]
    async fn healthz_reports_ok_with_timestamp() {
        let response = healthz().await.into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert!(parsed["time"].as_str().unwrap().contains('T'));
    }
}
