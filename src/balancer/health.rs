//! Background reprobe of dead backends.
//!
//! A connect failure marks a backend dead synchronously (`kill_backend`
//! in the connection driver). This task owns the other direction: it
//! periodically attempts a TCP connect to every dead backend and
//! revives the ones that answer. The same loop drives session-table
//! expiry, since both are low-frequency per-service housekeeping.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::Service;

/// Health prober configuration
#[derive(Debug, Clone)]
pub struct ProberConfig {
    pub interval: Duration,
}

impl Default for ProberConfig {
    fn default() -> Self {
        ProberConfig {
            interval: Duration::from_secs(10),
        }
    }
}

/// Run until the shutdown signal fires
pub async fn run_prober(
    services: Vec<Arc<Service>>,
    config: ProberConfig,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(config.interval);
    info!(
        interval = ?config.interval,
        services = services.len(),
        "health prober started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.recv() => {
                debug!("health prober stopping");
                return;
            }
        }

        for service in &services {
            probe_service(service).await;
            service.expire_sessions().await;
        }
    }
}

async fn probe_service(service: &Arc<Service>) {
    // snapshot the dead set without holding the lock across probes
    let dead: Vec<_> = {
        let state = service.state.lock().await;
        state
            .normal
            .backends()
            .iter()
            .chain(state.emergency.backends().iter())
            .filter(|b| !b.is_alive())
            .cloned()
            .collect()
    };

    for backend in dead {
        let regular = match backend.regular() {
            Some(r) => r,
            None => continue,
        };
        debug!(backend = %regular.label, "probing dead backend");
        let attempt =
            tokio::time::timeout(regular.conn_to, TcpStream::connect(regular.addr)).await;
        if matches!(attempt, Ok(Ok(_))) {
            service.revive_backend(&backend).await;
        }
    }
}
