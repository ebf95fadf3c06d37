//! DNS resolution for matrix backends.
//!
//! A matrix backend is a template `host:port` that expands into regular
//! backends through DNS. `immediate` resolves once at startup; `first`
//! and `all` re-resolve on an interval and keep the live set in sync
//! with the answers; `srv` does the same through SRV records, taking
//! per-target weights from the records themselves.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use trust_dns_resolver::TokioAsyncResolver;

use crate::balancer::{Backend, BackendKind, RegularBackend, Service};
use crate::config::{AddrFamily, ResolveMode};
use crate::error::{GantryError, GantryResult};

/// Shared resolver handle
pub struct Resolver {
    inner: TokioAsyncResolver,
}

impl Resolver {
    /// Build from the system configuration, falling back to sensible
    /// defaults when /etc/resolv.conf is unusable.
    pub fn system() -> GantryResult<Resolver> {
        let inner = TokioAsyncResolver::tokio_from_system_conf().or_else(|e| {
            warn!("system resolver config unusable ({}), using defaults", e);
            Ok::<_, trust_dns_resolver::error::ResolveError>(TokioAsyncResolver::tokio(
                Default::default(),
                Default::default(),
            ))
        })?;
        Ok(Resolver { inner })
    }

    /// Resolve A/AAAA records, filtered by family
    pub async fn resolve(&self, host: &str, family: AddrFamily) -> GantryResult<Vec<IpAddr>> {
        let lookup = self.inner.lookup_ip(host).await?;
        let addrs: Vec<IpAddr> = lookup
            .iter()
            .filter(|ip| match family {
                AddrFamily::Any => true,
                AddrFamily::V4 => ip.is_ipv4(),
                AddrFamily::V6 => ip.is_ipv6(),
            })
            .collect();
        if addrs.is_empty() {
            return Err(GantryError::resolver(format!(
                "no usable addresses for {}",
                host
            )));
        }
        Ok(addrs)
    }

    /// Resolve SRV records into (address, port, weight) triples
    pub async fn resolve_srv(
        &self,
        name: &str,
        family: AddrFamily,
    ) -> GantryResult<Vec<(IpAddr, u16, u32)>> {
        let srv = self.inner.srv_lookup(name).await?;
        let mut out = Vec::new();
        for record in srv.iter() {
            let target = record.target().to_utf8();
            let port = record.port();
            let weight = record.weight() as u32;
            match self.resolve(target.trim_end_matches('.'), family).await {
                Ok(addrs) => {
                    for addr in addrs {
                        out.push((addr, port, weight));
                    }
                }
                Err(e) => debug!("SRV target {} unresolvable: {}", target, e),
            }
        }
        if out.is_empty() {
            return Err(GantryError::resolver(format!(
                "no usable SRV targets for {}",
                name
            )));
        }
        Ok(out)
    }
}

/// A matrix backend template bound to its service
pub struct MatrixSpec {
    pub service: Arc<Service>,
    pub host: String,
    pub port: u16,
    pub family: AddrFamily,
    pub mode: ResolveMode,
    pub retry: Duration,
    pub priority: u32,
    pub emergency: bool,
    pub conn_to: Duration,
    pub be_to: Duration,
    pub ws_to: Duration,
    pub tls: Option<Arc<rustls::ClientConfig>>,
    pub sni: Option<String>,
}

impl MatrixSpec {
    fn make_backend(&self, addr: SocketAddr, priority: u32) -> Arc<Backend> {
        Arc::new(Backend::new(
            BackendKind::Regular(RegularBackend {
                addr,
                label: addr.to_string(),
                conn_to: self.conn_to,
                be_to: self.be_to,
                ws_to: self.ws_to,
                tls: self.tls.clone(),
                sni: self.sni.clone().or_else(|| Some(self.host.clone())),
            }),
            priority,
        ))
    }

    /// The address set this spec currently wants, per its mode
    async fn desired(&self, resolver: &Resolver) -> GantryResult<Vec<(SocketAddr, u32)>> {
        match self.mode {
            ResolveMode::Srv => {
                let triples = resolver.resolve_srv(&self.host, self.family).await?;
                Ok(triples
                    .into_iter()
                    .map(|(ip, port, weight)| {
                        (SocketAddr::new(ip, port), weight.max(1))
                    })
                    .collect())
            }
            ResolveMode::First => {
                let addrs = resolver.resolve(&self.host, self.family).await?;
                Ok(vec![(SocketAddr::new(addrs[0], self.port), self.priority)])
            }
            ResolveMode::Immediate | ResolveMode::All => {
                let addrs = resolver.resolve(&self.host, self.family).await?;
                Ok(addrs
                    .into_iter()
                    .map(|ip| (SocketAddr::new(ip, self.port), self.priority))
                    .collect())
            }
        }
    }
}

/// Resolve a spec once and install the result. Used at startup for
/// every mode; `immediate` never revisits the answer.
pub async fn resolve_startup(
    resolver: &Resolver,
    spec: &MatrixSpec,
) -> GantryResult<HashMap<SocketAddr, Arc<Backend>>> {
    let desired = spec.desired(resolver).await?;
    let mut live = HashMap::new();
    let mut state = spec.service.state.lock().await;
    let list = if spec.emergency {
        &mut state.emergency
    } else {
        &mut state.normal
    };
    for (addr, priority) in desired {
        let backend = spec.make_backend(addr, priority);
        list.push(backend.clone());
        live.insert(addr, backend);
    }
    info!(
        host = %spec.host,
        mode = ?spec.mode,
        count = live.len(),
        "matrix backend resolved"
    );
    Ok(live)
}

/// Periodic re-resolution for `first`, `all` and `srv` specs.
///
/// Each cycle diffs the answer against the live set: new addresses
/// spawn dynamic backends, vanished ones are withdrawn. A resolution
/// failure keeps the previous set.
pub async fn run_matrix_resolver(
    resolver: Arc<Resolver>,
    spec: MatrixSpec,
    mut live: HashMap<SocketAddr, Arc<Backend>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(spec.retry);
    ticker.tick().await; // the startup resolution already happened

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.recv() => {
                debug!(host = %spec.host, "matrix resolver stopping");
                return;
            }
        }

        let desired = match spec.desired(&resolver).await {
            Ok(d) => d,
            Err(e) => {
                warn!(host = %spec.host, "re-resolution failed, keeping previous set: {}", e);
                continue;
            }
        };

        let desired_map: HashMap<SocketAddr, u32> = desired.into_iter().collect();
        let added: Vec<_> = desired_map
            .iter()
            .filter(|(addr, _)| !live.contains_key(addr))
            .map(|(&addr, &pri)| (addr, pri))
            .collect();
        let removed: Vec<SocketAddr> = live
            .keys()
            .filter(|addr| !desired_map.contains_key(addr))
            .copied()
            .collect();

        if added.is_empty() && removed.is_empty() {
            continue;
        }

        let mut state = spec.service.state.lock().await;
        let list = if spec.emergency {
            &mut state.emergency
        } else {
            &mut state.normal
        };
        for addr in &removed {
            if let Some(backend) = live.remove(addr) {
                list.remove_where(|b| Arc::ptr_eq(b, &backend));
            }
        }
        for (addr, priority) in added {
            let backend = spec.make_backend(addr, priority);
            list.push(backend.clone());
            live.insert(addr, backend);
        }
        info!(
            host = %spec.host,
            live = live.len(),
            "matrix backend set updated"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::{
        BalancerAlgorithm, BalancerList, ServiceState, SessionPolicy, SessionTable,
    };
    use crate::matcher::Acl;
    use tokio::sync::Mutex;

    fn empty_service() -> Arc<Service> {
        Arc::new(Service {
            name: "svc".to_string(),
            conditions: vec![],
            rewrite_request: vec![],
            rewrite_response: vec![],
            session: SessionPolicy::none(),
            algorithm: BalancerAlgorithm::Random,
            forwarded_for: "X-Forwarded-For".to_string(),
            trusted: Acl::default(),
            log_suppress: 0,
            state: Mutex::new(ServiceState {
                normal: BalancerList::new(vec![]),
                emergency: BalancerList::new(vec![]),
                sessions: SessionTable::new(Duration::from_secs(60)),
            }),
        })
    }

    fn spec(service: Arc<Service>) -> MatrixSpec {
        MatrixSpec {
            service,
            host: "app.internal".to_string(),
            port: 8000,
            family: AddrFamily::Any,
            mode: ResolveMode::All,
            retry: Duration::from_secs(30),
            priority: 2,
            emergency: false,
            conn_to: Duration::from_secs(3),
            be_to: Duration::from_secs(15),
            ws_to: Duration::from_secs(600),
            tls: None,
            sni: None,
        }
    }

    #[test]
    fn test_make_backend_inherits_spec() {
        let spec = spec(empty_service());
        let backend = spec.make_backend("10.0.0.9:8000".parse().unwrap(), 2);
        let regular = backend.regular().unwrap();
        assert_eq!(regular.label, "10.0.0.9:8000");
        assert_eq!(backend.priority, 2);
        // SNI defaults to the matrix hostname
        assert_eq!(regular.sni.as_deref(), Some("app.internal"));
    }

    #[tokio::test]
    async fn test_desired_diff_applies_to_service() {
        // simulate one resolver cycle by hand: install, then diff
        let service = empty_service();
        let spec = spec(service.clone());

        let first: Vec<(SocketAddr, u32)> = vec![
            ("10.0.0.1:8000".parse().unwrap(), 2),
            ("10.0.0.2:8000".parse().unwrap(), 2),
        ];
        let mut live = HashMap::new();
        {
            let mut state = service.state.lock().await;
            for (addr, pri) in &first {
                let be = spec.make_backend(*addr, *pri);
                state.normal.push(be.clone());
                live.insert(*addr, be);
            }
            assert_eq!(state.normal.tot_pri(), 4);
        }

        // second answer drops .2 and adds .3
        let second: HashMap<SocketAddr, u32> = [
            ("10.0.0.1:8000".parse().unwrap(), 2u32),
            ("10.0.0.3:8000".parse().unwrap(), 2u32),
        ]
        .into_iter()
        .collect();

        let removed: Vec<SocketAddr> = live
            .keys()
            .filter(|a| !second.contains_key(a))
            .copied()
            .collect();
        let added: Vec<(SocketAddr, u32)> = second
            .iter()
            .filter(|(a, _)| !live.contains_key(a))
            .map(|(&a, &p)| (a, p))
            .collect();

        let mut state = service.state.lock().await;
        for addr in &removed {
            let be = live.remove(addr).unwrap();
            state.normal.remove_where(|b| Arc::ptr_eq(b, &be));
        }
        for (addr, pri) in added {
            let be = spec.make_backend(addr, pri);
            state.normal.push(be.clone());
            live.insert(addr, be);
        }

        assert_eq!(state.normal.backends().len(), 2);
        assert_eq!(state.normal.tot_pri(), 4);
        let labels: Vec<String> =
            state.normal.backends().iter().map(|b| b.label()).collect();
        assert!(labels.contains(&"10.0.0.1:8000".to_string()));
        assert!(labels.contains(&"10.0.0.3:8000".to_string()));
    }
}
