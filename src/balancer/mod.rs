//! Backend pools, weighted selection and per-service state.
//!
//! A service owns its backends. Each backend sits in exactly one of the
//! service's two balancer lists (normal or emergency); the lists cache
//! the aggregate priorities of their enabled, alive members and are
//! rebuilt whenever an alive/disabled bit flips.

pub mod health;
pub mod session;

pub use session::{SessionKind, SessionPolicy, SessionTable};

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::http::HttpRequest;
use crate::matcher::{Acl, Condition};
use crate::rewrite::{RewriteRule, Template};

/// Balancing algorithm of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerAlgorithm {
    #[default]
    Random,
    /// Interleaved weighted round-robin
    Iwrr,
}

/// A proxied upstream address with its connection parameters
#[derive(Debug, Clone)]
pub struct RegularBackend {
    pub addr: SocketAddr,
    /// `host:port` label used in logs and location rewriting
    pub label: String,
    pub conn_to: Duration,
    pub be_to: Duration,
    pub ws_to: Duration,
    pub tls: Option<Arc<rustls::ClientConfig>>,
    pub sni: Option<String>,
}

/// What a backend does with a request
pub enum BackendKind {
    /// Forward to an upstream server
    Regular(RegularBackend),
    /// Answer with a redirect built from a template
    Redirect {
        status: u16,
        target: Template,
        has_uri: bool,
    },
    /// Serve ACME http-01 challenge files from a directory
    Acme { root: PathBuf },
    /// Answer with a fixed status and body
    StaticError { status: u16, body: String },
    /// Control-plane endpoint
    Control,
    /// Prometheus metrics endpoint
    Metrics,
}

impl std::fmt::Debug for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Regular(r) => write!(f, "Regular({})", r.label),
            BackendKind::Redirect { status, .. } => write!(f, "Redirect({})", status),
            BackendKind::Acme { root } => write!(f, "Acme({})", root.display()),
            BackendKind::StaticError { status, .. } => write!(f, "StaticError({})", status),
            BackendKind::Control => write!(f, "Control"),
            BackendKind::Metrics => write!(f, "Metrics"),
        }
    }
}

/// A backend and its runtime health/admin state
#[derive(Debug)]
pub struct Backend {
    pub kind: BackendKind,
    /// Selection weight; 0 means never picked by weight
    pub priority: u32,
    /// Administratively disabled via the control plane
    pub disabled: AtomicBool,
    /// Cleared when a connect fails, restored by the prober
    pub alive: AtomicBool,
}

impl Backend {
    pub fn new(kind: BackendKind, priority: u32) -> Self {
        Backend {
            kind,
            priority,
            disabled: AtomicBool::new(false),
            alive: AtomicBool::new(true),
        }
    }

    /// Participates in selection right now
    pub fn is_usable(&self) -> bool {
        !self.disabled.load(Ordering::Relaxed) && self.alive.load(Ordering::Relaxed)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    /// Display label for logs and the control plane
    pub fn label(&self) -> String {
        match &self.kind {
            BackendKind::Regular(r) => r.label.clone(),
            BackendKind::Redirect { status, target, .. } => {
                format!("redirect({} {})", status, target.raw())
            }
            BackendKind::Acme { root } => format!("acme({})", root.display()),
            BackendKind::StaticError { status, .. } => format!("error({})", status),
            BackendKind::Control => "control".to_string(),
            BackendKind::Metrics => "metrics".to_string(),
        }
    }

    /// The upstream parameters, when this is a forwarding backend
    pub fn regular(&self) -> Option<&RegularBackend> {
        match &self.kind {
            BackendKind::Regular(r) => Some(r),
            _ => None,
        }
    }
}

/// An ordered list of backends with cached aggregate priorities
#[derive(Debug, Default)]
pub struct BalancerList {
    backends: Vec<Arc<Backend>>,
    tot_pri: u32,
    max_pri: u32,
    /// IWRR round counter
    cur_pri: u32,
    /// IWRR rotating index
    rr_index: usize,
}

impl BalancerList {
    pub fn new(backends: Vec<Arc<Backend>>) -> Self {
        let mut list = BalancerList {
            backends,
            ..Default::default()
        };
        list.rebuild();
        list
    }

    /// Recompute `tot_pri`/`max_pri` over enabled, alive members
    pub fn rebuild(&mut self) {
        self.tot_pri = self
            .backends
            .iter()
            .filter(|b| b.is_usable())
            .map(|b| b.priority)
            .sum();
        self.max_pri = self
            .backends
            .iter()
            .filter(|b| b.is_usable())
            .map(|b| b.priority)
            .max()
            .unwrap_or(0);
        if self.cur_pri == 0 || self.cur_pri > self.max_pri {
            self.cur_pri = self.max_pri;
        }
    }

    pub fn tot_pri(&self) -> u32 {
        self.tot_pri
    }

    pub fn max_pri(&self) -> u32 {
        self.max_pri
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn push(&mut self, backend: Arc<Backend>) {
        self.backends.push(backend);
        self.rebuild();
    }

    /// Remove backends selected by the predicate
    pub fn remove_where<F: FnMut(&Arc<Backend>) -> bool>(&mut self, mut f: F) {
        self.backends.retain(|b| !f(b));
        if self.rr_index >= self.backends.len() {
            self.rr_index = 0;
        }
        self.rebuild();
    }

    /// Weighted random pick: a uniform draw in `[0, tot_pri)`, walked
    /// through the list in order.
    pub fn select_random(&self) -> Option<Arc<Backend>> {
        if self.tot_pri == 0 {
            return None;
        }
        let mut pick = rand::thread_rng().gen_range(0..self.tot_pri);
        for backend in self.backends.iter().filter(|b| b.is_usable()) {
            if pick < backend.priority {
                return Some(backend.clone());
            }
            pick -= backend.priority;
        }
        None
    }

    /// Interleaved weighted round-robin.
    ///
    /// The scan walks the list with a rotating index; a backend is
    /// eligible in the current round iff its priority reaches
    /// `cur_pri`. Exhausting the list closes the round: `cur_pri`
    /// drops by one (wrapping back to `max_pri` after 1), so over a
    /// full cycle a backend of weight `w` is handed out `w` times,
    /// interleaved with the others rather than clustered.
    pub fn select_iwrr(&mut self) -> Option<Arc<Backend>> {
        if self.tot_pri == 0 || self.backends.is_empty() {
            return None;
        }
        loop {
            while self.rr_index < self.backends.len() {
                let i = self.rr_index;
                self.rr_index += 1;
                let backend = &self.backends[i];
                if backend.is_usable()
                    && backend.priority > 0
                    && backend.priority >= self.cur_pri
                {
                    return Some(backend.clone());
                }
            }
            self.rr_index = 0;
            self.cur_pri = if self.cur_pri <= 1 {
                self.max_pri
            } else {
                self.cur_pri - 1
            };
        }
    }
}

/// Mutable per-service state, guarded by the service mutex
#[derive(Debug)]
pub struct ServiceState {
    pub normal: BalancerList,
    pub emergency: BalancerList,
    pub sessions: SessionTable,
}

/// A matching scope with its backends, rewrites and session policy
pub struct Service {
    pub name: String,
    /// Condition list; the implicit root is AND
    pub conditions: Vec<Condition>,
    pub rewrite_request: Vec<RewriteRule>,
    pub rewrite_response: Vec<RewriteRule>,
    pub session: SessionPolicy,
    pub algorithm: BalancerAlgorithm,
    /// Header name used for the client address
    pub forwarded_for: String,
    /// Peers allowed to supply their own forwarded-for value
    pub trusted: Acl,
    /// Bit N suppresses access logging for status class N (1xx..5xx)
    pub log_suppress: u8,
    pub state: Mutex<ServiceState>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

impl Service {
    /// Whether this service wants the request
    pub fn matches(&self, req: &mut HttpRequest, peer: IpAddr) -> bool {
        self.conditions.iter().all(|c| c.matches(req, peer))
    }

    /// Pick a backend for the request.
    ///
    /// Session affinity wins when it points at a usable backend;
    /// otherwise the normal list is used while it has weight, falling
    /// back to the emergency list. A fresh pick refreshes or creates
    /// the session entry.
    pub async fn select_backend(
        &self,
        req: &HttpRequest,
        peer: IpAddr,
        form_body: Option<&str>,
    ) -> Option<Arc<Backend>> {
        let key = self.session.key(req, peer, form_body);
        let mut state = self.state.lock().await;

        if let Some(key) = &key {
            if let Some(backend) = state.sessions.lookup(key) {
                if backend.is_usable() {
                    debug!(service = %self.name, key = %key, "session hit");
                    return Some(backend);
                }
            }
        }

        let backend = if state.normal.tot_pri() > 0 {
            match self.algorithm {
                BalancerAlgorithm::Random => state.normal.select_random(),
                BalancerAlgorithm::Iwrr => state.normal.select_iwrr(),
            }
        } else {
            match self.algorithm {
                BalancerAlgorithm::Random => state.emergency.select_random(),
                BalancerAlgorithm::Iwrr => state.emergency.select_iwrr(),
            }
        }?;

        if let Some(key) = key {
            state.sessions.insert(key, &backend);
        }
        Some(backend)
    }

    /// Mark a backend dead after a connect failure and rebuild the
    /// aggregates so selection skips it immediately.
    pub async fn kill_backend(&self, backend: &Arc<Backend>) {
        backend.alive.store(false, Ordering::Relaxed);
        let mut state = self.state.lock().await;
        state.normal.rebuild();
        state.emergency.rebuild();
        warn!(service = %self.name, backend = %backend.label(), "backend marked dead");
    }

    /// Bring a backend back after a successful probe
    pub async fn revive_backend(&self, backend: &Arc<Backend>) {
        backend.alive.store(true, Ordering::Relaxed);
        let mut state = self.state.lock().await;
        state.normal.rebuild();
        state.emergency.rebuild();
        info!(service = %self.name, backend = %backend.label(), "backend revived");
    }

    /// Control-plane enable/disable
    pub async fn set_backend_enabled(&self, backend: &Arc<Backend>, enabled: bool) {
        backend.disabled.store(!enabled, Ordering::Relaxed);
        let mut state = self.state.lock().await;
        state.normal.rebuild();
        state.emergency.rebuild();
        info!(
            service = %self.name,
            backend = %backend.label(),
            enabled,
            "backend administrative state changed"
        );
    }

    /// Record a cookie session from a response's Set-Cookie headers
    pub async fn record_response_session(
        &self,
        response_headers: &crate::http::HeaderList,
        backend: &Arc<Backend>,
    ) {
        if self.session.kind != SessionKind::Cookie {
            return;
        }
        let wanted = &self.session.id;
        for hdr in response_headers.iter() {
            if !hdr.name().eq_ignore_ascii_case("set-cookie") {
                continue;
            }
            let first = hdr.value().split(';').next().unwrap_or("");
            if let Some((name, value)) = first.split_once('=') {
                if name.trim() == wanted {
                    let mut state = self.state.lock().await;
                    state.sessions.insert(value.trim().to_string(), backend);
                }
            }
        }
    }

    /// Drop expired session entries
    pub async fn expire_sessions(&self) {
        let mut state = self.state.lock().await;
        state.sessions.expire();
    }
}
