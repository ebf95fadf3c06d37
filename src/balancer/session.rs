//! Session affinity table.
//!
//! Keys are derived from the request according to the service's session
//! policy; values point at the pinned backend. Entries expire `ttl`
//! after their last use and a periodic sweep removes the leftovers.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use serde::Deserialize;

use super::Backend;
use crate::http::url::{parse_query, query_param};
use crate::http::HttpRequest;

/// What part of the request identifies a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    #[default]
    None,
    /// Peer IP address
    Ip,
    /// Named cookie
    Cookie,
    /// Named query parameter
    Url,
    /// Named parameter of an urlencoded POST body
    Param,
    /// Basic-auth user
    Basic,
    /// Named request header
    Header,
}

/// Session policy of a service
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub kind: SessionKind,
    /// Cookie/parameter/header name, where the kind needs one
    pub id: String,
    pub ttl: Duration,
}

impl SessionPolicy {
    pub fn none() -> Self {
        SessionPolicy {
            kind: SessionKind::None,
            id: String::new(),
            ttl: Duration::from_secs(300),
        }
    }

    /// Derive the session key for a request, if the policy applies
    pub fn key(
        &self,
        req: &HttpRequest,
        peer: IpAddr,
        form_body: Option<&str>,
    ) -> Option<String> {
        match self.kind {
            SessionKind::None => None,
            SessionKind::Ip => Some(peer.to_string()),
            SessionKind::Cookie => req.cookie(&self.id),
            SessionKind::Url => {
                let pairs = parse_query(req.query());
                query_param(&pairs, &self.id).map(str::to_string)
            }
            SessionKind::Param => {
                let body = form_body?;
                let pairs = parse_query(body);
                query_param(&pairs, &self.id).map(str::to_string)
            }
            SessionKind::Basic => req.user.clone(),
            SessionKind::Header => req.headers.value_of_name(&self.id).map(str::to_string),
        }
    }
}

#[derive(Debug)]
struct SessionEntry {
    backend: Weak<Backend>,
    last_used: Instant,
}

/// The per-service session map
#[derive(Debug)]
pub struct SessionTable {
    entries: HashMap<String, SessionEntry>,
    ttl: Duration,
}

impl SessionTable {
    pub fn new(ttl: Duration) -> Self {
        SessionTable {
            entries: HashMap::new(),
            ttl,
        }
    }

    /// Look up a key. A live hit refreshes the timestamp; an expired
    /// or orphaned entry is removed on the spot.
    pub fn lookup(&mut self, key: &str) -> Option<Arc<Backend>> {
        let now = Instant::now();
        {
            let entry = self.entries.get_mut(key)?;
            if now.duration_since(entry.last_used) <= self.ttl {
                // an orphaned pointer means the backend was torn down
                // by a resolver cycle; fall through to removal
                if let Some(backend) = entry.backend.upgrade() {
                    entry.last_used = now;
                    return Some(backend);
                }
            }
        }
        self.entries.remove(key);
        None
    }

    /// Create or overwrite an entry
    pub fn insert(&mut self, key: String, backend: &Arc<Backend>) {
        self.entries.insert(
            key,
            SessionEntry {
                backend: Arc::downgrade(backend),
                last_used: Instant::now(),
            },
        );
    }

    /// Sweep expired and orphaned entries
    pub fn expire(&mut self) {
        let now = Instant::now();
        let ttl = self.ttl;
        self.entries.retain(|_, e| {
            now.duration_since(e.last_used) <= ttl && e.backend.strong_count() > 0
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
