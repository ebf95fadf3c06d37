//! Control plane and metrics export.
//!
//! Requests routed to a `control` backend land here: `GET` returns the
//! full state tree as JSON, `POST /enable` and `POST /disable` flip a
//! backend's administrative state. A `metrics` backend renders the
//! Prometheus exposition text. Both run on whatever listener the
//! operator attached them to, typically one bound to localhost.

use std::sync::Arc;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::balancer::{Backend, Service};
use crate::http::Method;
use crate::proxy::Proxy;

/// Install (once) and fetch the global Prometheus recorder handle
pub fn metrics_handle() -> &'static PrometheusHandle {
    static HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();
    HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("install prometheus recorder")
    })
}

/// Snapshot of a service's backends with their list membership.
/// Index order matches what the mutators accept: normal list first,
/// then the emergency list.
pub async fn backends_of(service: &Arc<Service>) -> Vec<(Arc<Backend>, bool)> {
    let state = service.state.lock().await;
    state
        .normal
        .backends()
        .iter()
        .map(|b| (b.clone(), false))
        .chain(state.emergency.backends().iter().map(|b| (b.clone(), true)))
        .collect()
}

/// Body of an enable/disable request
#[derive(Debug, Deserialize)]
struct BackendRef {
    listener: usize,
    service: usize,
    backend: usize,
}

/// Handle a request routed to the control backend.
/// Returns (status, content-type, body).
pub async fn handle(
    proxy: &Proxy,
    method: Method,
    path: &str,
    body: Option<&str>,
) -> (u16, &'static str, String) {
    match (method, path) {
        (Method::Get, _) => (200, "application/json", state_json(proxy).await),
        (Method::Post, "/enable") => mutate(proxy, body, true).await,
        (Method::Post, "/disable") => mutate(proxy, body, false).await,
        _ => (
            405,
            "application/json",
            json!({"error": "unsupported control operation"}).to_string(),
        ),
    }
}

/// Render the metrics exposition
pub fn metrics_reply() -> (u16, &'static str, String) {
    (200, "text/plain; version=0.0.4", metrics_handle().render())
}

async fn state_json(proxy: &Proxy) -> String {
    let mut listeners = Vec::new();
    for listener in &proxy.listeners {
        let mut services = Vec::new();
        for service in &listener.services {
            let state = service.state.lock().await;
            let mut backends = Vec::new();
            for (emergency, list) in [(false, &state.normal), (true, &state.emergency)] {
                for backend in list.backends() {
                    backends.push(json!({
                        "backend": backend.label(),
                        "priority": backend.priority,
                        "alive": backend.is_alive(),
                        "disabled": backend.is_disabled(),
                        "emergency": emergency,
                    }));
                }
            }
            services.push(json!({
                "name": service.name,
                "sessions": state.sessions.len(),
                "normal_weight": state.normal.tot_pri(),
                "emergency_weight": state.emergency.tot_pri(),
                "backends": backends,
            }));
        }
        listeners.push(json!({
            "name": listener.name,
            "address": listener.addr.to_string(),
            "services": services,
        }));
    }
    json!({ "listeners": listeners }).to_string()
}

async fn mutate(
    proxy: &Proxy,
    body: Option<&str>,
    enable: bool,
) -> (u16, &'static str, String) {
    let parsed: BackendRef = match body.and_then(|b| serde_json::from_str(b).ok()) {
        Some(r) => r,
        None => {
            return (
                400,
                "application/json",
                json!({"error": "body must be {listener, service, backend}"}).to_string(),
            )
        }
    };

    let service = match proxy.service_at(parsed.listener, parsed.service) {
        Some(s) => s,
        None => {
            return (
                404,
                "application/json",
                json!({"error": "no such service"}).to_string(),
            )
        }
    };

    let backends = backends_of(&service).await;
    let (backend, _) = match backends.get(parsed.backend) {
        Some(b) => b,
        None => {
            return (
                404,
                "application/json",
                json!({"error": "no such backend"}).to_string(),
            )
        }
    };

    service.set_backend_enabled(backend, enable).await;
    info!(
        service = %service.name,
        backend = %backend.label(),
        enable,
        "control plane changed backend state"
    );
    (
        200,
        "application/json",
        json!({
            "backend": backend.label(),
            "disabled": backend.is_disabled(),
        })
        .to_string(),
    )
}
