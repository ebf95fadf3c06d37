//! The proxy runtime: listeners, their services, and the machinery
//! that turns the validated configuration into live objects.

pub mod connection;
pub mod responses;
pub mod server;
pub mod tunnel;
pub mod worker;

pub use server::ProxyServer;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::sync::Mutex;

use crate::balancer::{
    Backend, BackendKind, BalancerList, RegularBackend, Service, ServiceState, SessionKind,
    SessionPolicy, SessionTable,
};
use crate::config::{
    BackendConfig, Config, ConditionConfig, ListenerConfig, RewriteOpConfig, RewriteRuleConfig,
    ServerConfig, ServiceConfig,
};
use crate::error::{GantryError, GantryResult};
use crate::logfmt::LogFormat;
use crate::matcher::{
    conditions_from_file, Acl, BoolOp, Condition, PasswdFile, Pattern, PatternKind,
};
use crate::resolver::MatrixSpec;
use crate::rewrite::{RewriteOp, RewriteRule, Template};
use crate::tls::TlsSettings;

/// A live listening endpoint
pub struct Listener {
    pub name: String,
    pub addr: SocketAddr,
    pub tls: Option<TlsSettings>,
    pub client_to: Duration,
    pub conn_to: Duration,
    pub be_to: Duration,
    pub ws_to: Duration,
    pub xhttp: u8,
    /// 0 means unlimited
    pub max_req: u64,
    pub allow_url: Option<Regex>,
    pub rewr_dest: bool,
    pub rewr_loc: bool,
    pub no_https_11: u8,
    pub add_headers: Vec<String>,
    pub error_pages: HashMap<u16, String>,
    pub log_format: LogFormat,
    pub rewrite_request: Vec<RewriteRule>,
    pub rewrite_response: Vec<RewriteRule>,
    pub services: Vec<Arc<Service>>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("name", &self.name)
            .field("addr", &self.addr)
            .field("services", &self.services.len())
            .finish()
    }
}

/// The whole runtime state handed to workers and the control plane
pub struct Proxy {
    pub server: ServerConfig,
    pub listeners: Vec<Arc<Listener>>,
}

impl Proxy {
    /// Build the runtime tree from a validated configuration. Matrix
    /// backends come back as pending specs; the server resolves them at
    /// startup and keeps them fresh afterwards.
    pub fn from_config(config: &Config) -> GantryResult<(Proxy, Vec<MatrixSpec>)> {
        let mut listeners = Vec::new();
        let mut matrix_specs = Vec::new();

        for listener_config in &config.listeners {
            let (listener, specs) = build_listener(config, listener_config)?;
            listeners.push(Arc::new(listener));
            matrix_specs.extend(specs);
        }

        Ok((
            Proxy {
                server: config.server.clone(),
                listeners,
            },
            matrix_specs,
        ))
    }

    /// All services across all listeners
    pub fn services(&self) -> Vec<Arc<Service>> {
        self.listeners
            .iter()
            .flat_map(|l| l.services.iter().cloned())
            .collect()
    }

    /// Iterate listeners with their index
    pub fn for_each_listener<F: FnMut(usize, &Arc<Listener>)>(&self, mut f: F) {
        for (i, listener) in self.listeners.iter().enumerate() {
            f(i, listener);
        }
    }

    /// Iterate services of a listener with their index
    pub fn for_each_service<F: FnMut(usize, &Arc<Service>)>(&self, listener: usize, mut f: F) {
        if let Some(l) = self.listeners.get(listener) {
            for (i, service) in l.services.iter().enumerate() {
                f(i, service);
            }
        }
    }

    /// Look up a service by listener/service index
    pub fn service_at(&self, listener: usize, service: usize) -> Option<Arc<Service>> {
        self.listeners.get(listener)?.services.get(service).cloned()
    }
}

fn build_listener(
    config: &Config,
    lc: &ListenerConfig,
) -> GantryResult<(Listener, Vec<MatrixSpec>)> {
    let tls = lc.tls.as_ref().map(crate::tls::build_listener_tls).transpose()?;

    let defaults = TimeoutDefaults {
        conn_to: Duration::from_secs(lc.backend_connect_timeout),
        be_to: Duration::from_secs(lc.backend_timeout),
        ws_to: Duration::from_secs(lc.websocket_timeout),
    };

    let mut services = Vec::new();
    let mut matrix_specs = Vec::new();
    for (index, sc) in lc.services.iter().enumerate() {
        let (service, pending) = build_service(config, lc, sc, index, &defaults)?;
        let service = Arc::new(service);
        for partial in pending {
            matrix_specs.push(partial.into_spec(service.clone()));
        }
        services.push(service);
    }

    let listener = Listener {
        name: lc.display_name(),
        addr: lc.bind,
        tls,
        client_to: Duration::from_secs(lc.client_timeout),
        conn_to: defaults.conn_to,
        be_to: defaults.be_to,
        ws_to: defaults.ws_to,
        xhttp: lc.xhttp,
        max_req: lc.max_request_size,
        allow_url: lc
            .url_allow
            .as_ref()
            .map(|p| Regex::new(p))
            .transpose()?,
        rewr_dest: lc.rewrite_destination,
        rewr_loc: lc.rewrite_location,
        no_https_11: lc.no_https_11,
        add_headers: lc.add_headers.clone(),
        error_pages: lc
            .error_pages
            .iter()
            .map(|p| (p.status, p.body.clone()))
            .collect(),
        log_format: LogFormat::named(&lc.log_format)?,
        rewrite_request: build_rules(&lc.rewrite_request)?,
        rewrite_response: build_rules(&lc.rewrite_response)?,
        services,
    };
    Ok((listener, matrix_specs))
}

struct TimeoutDefaults {
    conn_to: Duration,
    be_to: Duration,
    ws_to: Duration,
}

/// A matrix spec minus its service back-reference
struct MatrixPartial {
    host: String,
    port: u16,
    family: crate::config::AddrFamily,
    mode: crate::config::ResolveMode,
    retry: Duration,
    priority: u32,
    emergency: bool,
    conn_to: Duration,
    be_to: Duration,
    ws_to: Duration,
    tls: Option<Arc<rustls::ClientConfig>>,
    sni: Option<String>,
}

impl MatrixPartial {
    fn into_spec(self, service: Arc<Service>) -> MatrixSpec {
        MatrixSpec {
            service,
            host: self.host,
            port: self.port,
            family: self.family,
            mode: self.mode,
            retry: self.retry,
            priority: self.priority,
            emergency: self.emergency,
            conn_to: self.conn_to,
            be_to: self.be_to,
            ws_to: self.ws_to,
            tls: self.tls,
            sni: self.sni,
        }
    }
}

fn build_service(
    config: &Config,
    lc: &ListenerConfig,
    sc: &ServiceConfig,
    index: usize,
    defaults: &TimeoutDefaults,
) -> GantryResult<(Service, Vec<MatrixPartial>)> {
    let mut normal = Vec::new();
    let mut emergency = Vec::new();
    let mut matrix = Vec::new();

    for entry in &sc.backends {
        let resolved = config.resolve_backend(&entry.backend);
        match resolved {
            BackendConfig::Matrix {
                host,
                port,
                family,
                mode,
                retry_interval,
                connect_timeout,
                timeout,
                websocket_timeout,
                tls,
                sni,
            } => {
                matrix.push(MatrixPartial {
                    host: host.clone(),
                    port: *port,
                    family: *family,
                    mode: *mode,
                    retry: Duration::from_secs(*retry_interval),
                    priority: entry.priority,
                    emergency: entry.emergency,
                    conn_to: connect_timeout
                        .map(Duration::from_secs)
                        .unwrap_or(defaults.conn_to),
                    be_to: timeout.map(Duration::from_secs).unwrap_or(defaults.be_to),
                    ws_to: websocket_timeout
                        .map(Duration::from_secs)
                        .unwrap_or(defaults.ws_to),
                    tls: tls.then(crate::tls::build_backend_client_config),
                    sni: sni.clone(),
                });
            }
            other => {
                let backend = Arc::new(build_static_backend(other, entry.priority, defaults)?);
                if entry.disabled {
                    backend
                        .disabled
                        .store(true, std::sync::atomic::Ordering::Relaxed);
                }
                if entry.emergency {
                    emergency.push(backend);
                } else {
                    normal.push(backend);
                }
            }
        }
    }

    let session = match &sc.session {
        Some(s) => SessionPolicy {
            kind: s.kind,
            id: s.id.clone(),
            ttl: Duration::from_secs(s.ttl),
        },
        None => SessionPolicy {
            kind: SessionKind::None,
            id: String::new(),
            ttl: Duration::from_secs(300),
        },
    };
    let session_ttl = session.ttl;

    let service = Service {
        name: sc
            .name
            .clone()
            .unwrap_or_else(|| format!("{}#{}", lc.display_name(), index)),
        conditions: sc
            .conditions
            .iter()
            .map(build_condition)
            .collect::<GantryResult<Vec<_>>>()?,
        rewrite_request: build_rules(&sc.rewrite_request)?,
        rewrite_response: build_rules(&sc.rewrite_response)?,
        session,
        algorithm: sc.algorithm,
        forwarded_for: sc.forwarded_for_header.clone(),
        trusted: Acl::new(&sc.trusted_proxies)?,
        log_suppress: sc.log_suppress_mask(),
        state: Mutex::new(ServiceState {
            normal: BalancerList::new(normal),
            emergency: BalancerList::new(emergency),
            sessions: SessionTable::new(session_ttl),
        }),
    };
    Ok((service, matrix))
}

fn build_static_backend(
    config: &BackendConfig,
    priority: u32,
    defaults: &TimeoutDefaults,
) -> GantryResult<Backend> {
    let kind = match config {
        BackendConfig::Regular {
            address,
            connect_timeout,
            timeout,
            websocket_timeout,
            tls,
            sni,
        } => {
            let addr: SocketAddr = address
                .parse()
                .map_err(|_| GantryError::config(format!("bad backend address {:?}", address)))?;
            BackendKind::Regular(RegularBackend {
                addr,
                label: address.clone(),
                conn_to: connect_timeout
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.conn_to),
                be_to: timeout.map(Duration::from_secs).unwrap_or(defaults.be_to),
                ws_to: websocket_timeout
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.ws_to),
                tls: tls.then(crate::tls::build_backend_client_config),
                sni: sni.clone(),
            })
        }
        BackendConfig::Redirect { status, target } => {
            let template = Template::compile(target);
            let has_uri = template.uses_groups();
            BackendKind::Redirect {
                status: *status,
                target: template,
                has_uri,
            }
        }
        BackendConfig::Acme { directory } => BackendKind::Acme {
            root: directory.into(),
        },
        BackendConfig::Error { status, body } => BackendKind::StaticError {
            status: *status,
            body: body.clone(),
        },
        BackendConfig::Control {} => BackendKind::Control,
        BackendConfig::Metrics {} => BackendKind::Metrics,
        BackendConfig::Matrix { .. } | BackendConfig::Ref { .. } => {
            return Err(GantryError::internal(
                "matrix/ref backends are resolved before this point",
            ))
        }
    };
    Ok(Backend::new(kind, priority))
}

/// Build a runtime condition from its configuration
pub fn build_condition(config: &ConditionConfig) -> GantryResult<Condition> {
    match config {
        ConditionConfig::Bool { op, children } => {
            let op = match op.as_str() {
                "and" => BoolOp::And,
                "or" => BoolOp::Or,
                "not" => BoolOp::Not,
                other => {
                    return Err(GantryError::config(format!("bad bool op {:?}", other)))
                }
            };
            Ok(Condition::Bool {
                op,
                children: children
                    .iter()
                    .map(build_condition)
                    .collect::<GantryResult<Vec<_>>>()?,
            })
        }
        ConditionConfig::Acl { cidrs } => Ok(Condition::Acl(Acl::new(cidrs)?)),
        ConditionConfig::Url {
            pattern,
            kind,
            icase,
            file,
        } => pattern_or_file(pattern.as_deref(), file.as_deref(), |p| {
            Ok(Condition::Url(Pattern::compile(p, *kind, *icase)?))
        }),
        ConditionConfig::Path {
            pattern,
            kind,
            icase,
            file,
        } => pattern_or_file(pattern.as_deref(), file.as_deref(), |p| {
            Ok(Condition::Path(Pattern::compile(p, *kind, *icase)?))
        }),
        ConditionConfig::Query { pattern, kind, icase } => Ok(Condition::Query(
            Pattern::compile(pattern, *kind, *icase)?,
        )),
        ConditionConfig::QueryParam {
            name,
            pattern,
            kind,
            icase,
        } => Ok(Condition::QueryParam {
            name: name.clone(),
            pattern: Pattern::compile(pattern, *kind, *icase)?,
        }),
        ConditionConfig::Header {
            pattern,
            kind,
            icase,
            file,
        } => pattern_or_file(pattern.as_deref(), file.as_deref(), |p| {
            Ok(Condition::Header(Pattern::compile(p, *kind, *icase)?))
        }),
        ConditionConfig::Host {
            pattern,
            kind,
            icase,
            file,
        } => pattern_or_file(pattern.as_deref(), file.as_deref(), |p| {
            Ok(Condition::Host(Pattern::compile_host(p, *kind, *icase)?))
        }),
        ConditionConfig::BasicAuth { file } => {
            Ok(Condition::BasicAuth(PasswdFile::load(file)?))
        }
        ConditionConfig::StringMatch {
            template,
            pattern,
            kind,
            icase,
        } => Ok(Condition::StringMatch {
            template: Template::compile(template),
            pattern: Pattern::compile(pattern, *kind, *icase)?,
        }),
    }
}

/// Either compile the inline pattern or expand a pattern file into an
/// OR group, one leaf per line.
fn pattern_or_file<F>(
    pattern: Option<&str>,
    file: Option<&str>,
    mut make: F,
) -> GantryResult<Condition>
where
    F: FnMut(&str) -> GantryResult<Condition>,
{
    match (pattern, file) {
        (_, Some(path)) => {
            let content = std::fs::read_to_string(path).map_err(|e| {
                GantryError::config(format!("cannot read pattern file {}: {}", path, e))
            })?;
            conditions_from_file(&content, make)
        }
        (Some(p), None) => make(p),
        (None, None) => Err(GantryError::config("condition needs a pattern or a file")),
    }
}

fn build_rules(configs: &[RewriteRuleConfig]) -> GantryResult<Vec<RewriteRule>> {
    configs.iter().map(build_rule).collect()
}

fn build_rule(config: &RewriteRuleConfig) -> GantryResult<RewriteRule> {
    Ok(RewriteRule {
        cond: config.cond.as_ref().map(build_condition).transpose()?,
        ops: config
            .ops
            .iter()
            .map(build_op)
            .collect::<GantryResult<Vec<_>>>()?,
        else_ops: config
            .else_ops
            .iter()
            .map(build_op)
            .collect::<GantryResult<Vec<_>>>()?,
    })
}

fn build_op(config: &RewriteOpConfig) -> GantryResult<RewriteOp> {
    Ok(match config {
        RewriteOpConfig::SetHeader { value } => RewriteOp::SetHeader(Template::compile(value)),
        RewriteOpConfig::DeleteHeader {
            pattern,
            kind,
            icase,
        } => RewriteOp::DeleteHeader(Pattern::compile(pattern, *kind, *icase)?),
        RewriteOpConfig::SetUrl { value } => RewriteOp::SetUrl(Template::compile(value)),
        RewriteOpConfig::SetPath { value } => RewriteOp::SetPath(Template::compile(value)),
        RewriteOpConfig::SetQuery { value } => RewriteOp::SetQuery(Template::compile(value)),
        RewriteOpConfig::SetQueryParam { name, value } => RewriteOp::SetQueryParam {
            name: name.clone(),
            template: Template::compile(value),
        },
        RewriteOpConfig::SubRule { rule } => RewriteOp::SubRule(Box::new(build_rule(rule)?)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[[listeners]]
name = "web"
bind = "127.0.0.1:8080"
xhttp = 1

[[listeners.services]]
name = "api"
algorithm = "iwrr"

[[listeners.services.match]]
type = "host"
pattern = "api.example.org"
kind = "exact"

[[listeners.services.backends]]
type = "regular"
address = "10.0.0.1:8000"
priority = 2

[[listeners.services.backends]]
type = "regular"
address = "10.0.0.2:8000"
priority = 1
emergency = true

[[listeners.services]]
name = "fallback"

[[listeners.services.backends]]
type = "error"
status = 503
body = "everything is on fire"
"#;

    #[tokio::test]
    async fn test_build_from_config() {
        let config = Config::from_str(CONFIG).unwrap();
        let (proxy, specs) = Proxy::from_config(&config).unwrap();
        assert!(specs.is_empty());
        assert_eq!(proxy.listeners.len(), 1);

        let listener = &proxy.listeners[0];
        assert_eq!(listener.name, "web");
        assert_eq!(listener.xhttp, 1);
        assert_eq!(listener.services.len(), 2);

        let api = &listener.services[0];
        assert_eq!(api.name, "api");
        let state = api.state.lock().await;
        assert_eq!(state.normal.backends().len(), 1);
        assert_eq!(state.emergency.backends().len(), 1);
        assert_eq!(state.normal.tot_pri(), 2);
    }

    #[tokio::test]
    async fn test_matrix_produces_spec() {
        let config = Config::from_str(
            r#"
[[listeners]]
bind = "127.0.0.1:8080"

[[listeners.services]]

[[listeners.services.backends]]
type = "matrix"
host = "app.internal"
port = 9000
mode = "all"
"#,
        )
        .unwrap();
        let (proxy, specs) = Proxy::from_config(&config).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].host, "app.internal");
        // the service starts with an empty normal list
        let state = proxy.listeners[0].services[0].state.lock().await;
        assert_eq!(state.normal.backends().len(), 0);
    }

    #[tokio::test]
    async fn test_unnamed_service_gets_index_name() {
        let config = Config::from_str(
            r#"
[[listeners]]
bind = "127.0.0.1:8080"

[[listeners.services]]

[[listeners.services.backends]]
type = "regular"
address = "10.0.0.1:1"
"#,
        )
        .unwrap();
        let (proxy, _) = Proxy::from_config(&config).unwrap();
        assert_eq!(proxy.listeners[0].services[0].name, "127.0.0.1:8080#0");
    }

    #[test]
    fn test_service_lookup_by_index() {
        let config = Config::from_str(CONFIG).unwrap();
        let (proxy, _) = Proxy::from_config(&config).unwrap();
        assert!(proxy.service_at(0, 1).is_some());
        assert!(proxy.service_at(0, 2).is_none());
        assert!(proxy.service_at(1, 0).is_none());
    }

    #[test]
    fn test_iteration_helpers() {
        let config = Config::from_str(CONFIG).unwrap();
        let (proxy, _) = Proxy::from_config(&config).unwrap();

        let mut listeners = Vec::new();
        proxy.for_each_listener(|i, l| listeners.push((i, l.name.clone())));
        assert_eq!(listeners, vec![(0, "web".to_string())]);

        let mut services = Vec::new();
        proxy.for_each_service(0, |i, s| services.push((i, s.name.clone())));
        assert_eq!(services.len(), 2);
        assert_eq!(services[1].1, "fallback");
    }
}
