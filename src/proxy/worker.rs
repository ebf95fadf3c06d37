//! Bounded elastic worker pool.
//!
//! Accepted connections are queued as work items; worker tasks drain
//! the queue and run the full connection lifecycle. The pool keeps at
//! least `worker_min` workers; the acceptor grows it on demand up to
//! `worker_max`, and workers above the minimum exit after
//! `worker_idle_timeout` without work. Enqueue awaits when the queue is
//! full, so accepted connections are never dropped on the floor.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use super::connection;
use super::{Listener, Proxy};

/// One accepted connection waiting for a worker
pub struct WorkItem {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub listener: Arc<Listener>,
}

struct PoolShared {
    rx: Mutex<mpsc::Receiver<WorkItem>>,
    proxy: Arc<Proxy>,
    total: AtomicUsize,
    active: AtomicUsize,
    min: usize,
    max: usize,
    idle_timeout: Duration,
}

/// The worker pool handle held by acceptors
#[derive(Clone)]
pub struct WorkerPool {
    tx: mpsc::Sender<WorkItem>,
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    pub fn new(proxy: Arc<Proxy>) -> WorkerPool {
        let server = &proxy.server;
        let (tx, rx) = mpsc::channel(server.queue_depth);
        let shared = Arc::new(PoolShared {
            rx: Mutex::new(rx),
            proxy: proxy.clone(),
            total: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            min: server.worker_min,
            max: server.worker_max,
            idle_timeout: Duration::from_secs(server.worker_idle_timeout),
        });

        let pool = WorkerPool { tx, shared };
        for _ in 0..pool.shared.min {
            pool.spawn_worker();
        }
        info!(
            min = pool.shared.min,
            max = pool.shared.max,
            "worker pool started"
        );
        pool
    }

    /// Queue a connection, growing the pool first when every worker is
    /// busy and there is headroom.
    pub async fn dispatch(&self, item: WorkItem) {
        let total = self.shared.total.load(Ordering::Relaxed);
        let active = self.shared.active.load(Ordering::Relaxed);
        if active >= total && total < self.shared.max {
            self.spawn_worker();
        }
        // awaiting here is the backpressure: the acceptor stalls
        // instead of the queue overflowing
        if self.tx.send(item).await.is_err() {
            debug!("worker pool is shut down, dropping connection");
        }
    }

    fn spawn_worker(&self) {
        let shared = self.shared.clone();
        shared.total.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(worker_loop(shared));
    }

    pub fn worker_count(&self) -> usize {
        self.shared.total.load(Ordering::Relaxed)
    }

    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::Relaxed)
    }

    /// Wait for workers to finish, up to the grace period.
    /// Every clone of the pool must be gone by then, otherwise the
    /// queue stays open and workers keep waiting.
    pub async fn drain(self, grace: Duration) {
        drop(self.tx);
        let deadline = tokio::time::Instant::now() + grace;
        while self.shared.total.load(Ordering::Relaxed) > 0 {
            if tokio::time::Instant::now() >= deadline {
                info!(
                    remaining = self.shared.total.load(Ordering::Relaxed),
                    "grace period over, abandoning remaining workers"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

async fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let above_min = shared.total.load(Ordering::Relaxed) > shared.min;
        let item = {
            let mut rx = shared.rx.lock().await;
            if above_min {
                match tokio::time::timeout(shared.idle_timeout, rx.recv()).await {
                    Ok(item) => item,
                    Err(_) => {
                        // idle too long while above the minimum
                        drop(rx);
                        shared.total.fetch_sub(1, Ordering::Relaxed);
                        debug!("idle worker exiting");
                        return;
                    }
                }
            } else {
                rx.recv().await
            }
        };

        let item = match item {
            Some(item) => item,
            None => {
                // queue closed: shutdown
                shared.total.fetch_sub(1, Ordering::Relaxed);
                return;
            }
        };

        shared.active.fetch_add(1, Ordering::Relaxed);
        connection::handle_connection(
            shared.proxy.clone(),
            item.listener,
            item.stream,
            item.peer,
        )
        .await;
        shared.active.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn proxy() -> Arc<Proxy> {
        let config = Config::from_str(
            r#"
[server]
worker_min = 2
worker_max = 4
worker_idle_timeout = 1

[[listeners]]
bind = "127.0.0.1:0"

[[listeners.services]]

[[listeners.services.backends]]
type = "error"
status = 503
body = "x"
"#,
        )
        .unwrap();
        Arc::new(Proxy::from_config(&config).unwrap().0)
    }

    #[tokio::test]
    async fn test_pool_starts_minimum_workers() {
        let pool = WorkerPool::new(proxy());
        // workers are spawned synchronously
        assert_eq!(pool.worker_count(), 2);
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn test_drain_stops_workers() {
        let pool = WorkerPool::new(proxy());
        let shared = pool.shared.clone();
        pool.drain(Duration::from_secs(2)).await;
        assert_eq!(shared.total.load(Ordering::Relaxed), 0);
    }
}
