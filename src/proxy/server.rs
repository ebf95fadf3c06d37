//! Listener sockets, accept loops and process lifecycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use super::worker::{WorkItem, WorkerPool};
use super::{Listener, Proxy};
use crate::balancer::health::{run_prober, ProberConfig};
use crate::config::{Config, ResolveMode};
use crate::error::{GantryError, GantryResult};
use crate::resolver::{resolve_startup, run_matrix_resolver, MatrixSpec, Resolver};

/// The assembled server, ready to bind and run
pub struct ProxyServer {
    proxy: Arc<Proxy>,
    matrix_specs: Vec<MatrixSpec>,
}

impl ProxyServer {
    pub fn new(config: &Config) -> GantryResult<Self> {
        let (proxy, matrix_specs) = Proxy::from_config(config)?;
        Ok(ProxyServer {
            proxy: Arc::new(proxy),
            matrix_specs,
        })
    }

    pub fn proxy(&self) -> Arc<Proxy> {
        self.proxy.clone()
    }

    /// Bind every listener socket. Split from `serve` so callers (and
    /// tests) can learn the actual addresses before traffic starts.
    pub async fn bind_all(&self) -> GantryResult<Vec<(Arc<Listener>, TcpListener)>> {
        let mut bound = Vec::new();
        for listener in &self.proxy.listeners {
            let socket = TcpListener::bind(listener.addr).await.map_err(|e| {
                GantryError::config(format!("cannot bind {}: {}", listener.addr, e))
            })?;
            info!(
                listener = %listener.name,
                addr = %socket.local_addr().map(|a| a.to_string()).unwrap_or_default(),
                tls = listener.tls.is_some(),
                "listening"
            );
            bound.push((listener.clone(), socket));
        }
        Ok(bound)
    }

    /// Run until the shutdown signal fires, then drain within the
    /// grace period.
    pub async fn serve(
        self,
        bound: Vec<(Arc<Listener>, TcpListener)>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> GantryResult<()> {
        // make the metrics recorder live from the first request on
        let _ = crate::control::metrics_handle();

        // matrix backends: resolve now, keep the dynamic modes fresh
        if !self.matrix_specs.is_empty() {
            let resolver = Arc::new(Resolver::system()?);
            for spec in self.matrix_specs {
                match resolve_startup(&resolver, &spec).await {
                    Ok(live) => {
                        if spec.mode != ResolveMode::Immediate {
                            tokio::spawn(run_matrix_resolver(
                                resolver.clone(),
                                spec,
                                live,
                                shutdown_tx.subscribe(),
                            ));
                        }
                    }
                    Err(e) if spec.mode == ResolveMode::Immediate => {
                        // a fixed set that cannot be resolved is a
                        // configuration problem, not a transient one
                        return Err(GantryError::config(format!(
                            "cannot resolve matrix backend {}: {}",
                            spec.host, e
                        )));
                    }
                    Err(e) => {
                        warn!(
                            host = %spec.host,
                            "startup resolution failed, starting empty: {}",
                            e
                        );
                        tokio::spawn(run_matrix_resolver(
                            resolver.clone(),
                            spec,
                            Default::default(),
                            shutdown_tx.subscribe(),
                        ));
                    }
                }
            }
        }

        tokio::spawn(run_prober(
            self.proxy.services(),
            ProberConfig {
                interval: Duration::from_secs(self.proxy.server.probe_interval),
            },
            shutdown_tx.subscribe(),
        ));

        let pool = WorkerPool::new(self.proxy.clone());
        let mut acceptors = Vec::new();
        for (listener, socket) in bound {
            acceptors.push(tokio::spawn(accept_loop(
                socket,
                listener,
                pool.clone(),
                shutdown_tx.subscribe(),
            )));
        }

        // park here until shutdown
        let mut shutdown_rx = shutdown_tx.subscribe();
        let _ = shutdown_rx.recv().await;
        info!("shutdown requested, draining");

        for acceptor in acceptors {
            if let Err(e) = acceptor.await {
                error!("acceptor task failed: {}", e);
            }
        }

        let grace = Duration::from_secs(self.proxy.server.grace_period);
        pool.drain(grace).await;
        info!("shutdown complete");
        Ok(())
    }

    /// Bind and serve in one step
    pub async fn run(self, shutdown_tx: broadcast::Sender<()>) -> GantryResult<()> {
        let bound = self.bind_all().await?;
        self.serve(bound, shutdown_tx).await
    }
}

async fn accept_loop(
    socket: TcpListener,
    listener: Arc<Listener>,
    pool: WorkerPool,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = socket.accept() => match accepted {
                Ok((stream, peer)) => {
                    pool.dispatch(WorkItem {
                        stream,
                        peer,
                        listener: listener.clone(),
                    })
                    .await;
                }
                Err(e) => {
                    // transient accept errors (EMFILE and friends)
                    warn!(listener = %listener.name, "accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = shutdown.recv() => {
                info!(listener = %listener.name, "acceptor stopping");
                return;
            }
        }
    }
}

/// Parse and build everything without binding; used by `--check-only`
pub fn check_config(config: &Config) -> GantryResult<()> {
    ProxyServer::new(config).map(|_| ())
}
