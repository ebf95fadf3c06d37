//! Listener configuration.

use std::net::SocketAddr;

use serde::Deserialize;

use super::service::{RewriteRuleConfig, ServiceConfig};
use crate::error::{GantryError, GantryResult};

/// One listening endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// Optional name used in logs and the control plane
    pub name: Option<String>,
    pub bind: SocketAddr,
    /// Seconds to wait for client reads/writes
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    /// Seconds to wait for a backend connect
    #[serde(default = "default_connect_timeout")]
    pub backend_connect_timeout: u64,
    /// Seconds to wait for backend reads/writes
    #[serde(default = "default_backend_timeout")]
    pub backend_timeout: u64,
    /// Seconds of idle tolerated inside a WebSocket tunnel
    #[serde(default = "default_websocket_timeout")]
    pub websocket_timeout: u64,
    /// Method-group ceiling (0..=4)
    #[serde(default)]
    pub xhttp: u8,
    /// Reject request bodies larger than this; 0 means unlimited
    #[serde(default)]
    pub max_request_size: u64,
    /// Requests whose decoded URL does not match are answered 501
    #[serde(default)]
    pub url_allow: Option<String>,
    /// Rewrite WebDAV Destination headers to point at the backend
    #[serde(default)]
    pub rewrite_destination: bool,
    /// Rewrite Location/Content-Location headers to point back here
    #[serde(default = "default_true")]
    pub rewrite_location: bool,
    /// 0: ignore; 1: force HTTP/1.0 replies over TLS; 2: only for MSIE
    #[serde(default)]
    pub no_https_11: u8,
    /// Access-log format name (see the logfmt module)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Extra header lines appended to every forwarded request
    #[serde(default)]
    pub add_headers: Vec<String>,
    /// Response-body overrides for generated error replies
    #[serde(default)]
    pub error_pages: Vec<ErrorPageConfig>,
    /// TLS termination; absent means plain HTTP
    pub tls: Option<ListenerTlsConfig>,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub rewrite_request: Vec<RewriteRuleConfig>,
    #[serde(default)]
    pub rewrite_response: Vec<RewriteRuleConfig>,
}

fn default_client_timeout() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_backend_timeout() -> u64 {
    15
}

fn default_websocket_timeout() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

/// Shared `true` default for sibling config modules
pub(crate) fn default_true_pub() -> bool {
    true
}

fn default_log_format() -> String {
    "detailed".to_string()
}

/// Body override for one generated error status
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorPageConfig {
    pub status: u16,
    pub body: String,
}

/// TLS settings of a listener
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerTlsConfig {
    /// Certificates tried in order; SNI picks by CN/SAN glob, the first
    /// one is the default
    pub certificates: Vec<CertificateConfig>,
    /// 0: none, 1: optional verified, 2: required verified,
    /// 3: requested but not verified
    #[serde(default)]
    pub client_verify: u8,
    /// CA bundle for client-certificate verification
    #[serde(default)]
    pub ca_path: Option<String>,
}

/// One certificate/key pair
#[derive(Debug, Clone, Deserialize)]
pub struct CertificateConfig {
    pub cert_path: String,
    pub key_path: String,
}

impl ListenerConfig {
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.bind.to_string())
    }

    pub fn validate(&self) -> GantryResult<()> {
        let at = self.display_name();

        if self.xhttp > 4 {
            return Err(GantryError::config(format!(
                "listener {}: xhttp must be 0..=4",
                at
            )));
        }
        if self.no_https_11 > 2 {
            return Err(GantryError::config(format!(
                "listener {}: no_https_11 must be 0..=2",
                at
            )));
        }
        if self.client_timeout == 0 || self.backend_timeout == 0 {
            return Err(GantryError::config(format!(
                "listener {}: timeouts must be greater than 0",
                at
            )));
        }
        if let Some(pattern) = &self.url_allow {
            regex::Regex::new(pattern).map_err(|e| {
                GantryError::config(format!("listener {}: bad url_allow: {}", at, e))
            })?;
        }
        for line in &self.add_headers {
            if !line.contains(':') {
                return Err(GantryError::config(format!(
                    "listener {}: add_headers entry {:?} is not a header line",
                    at, line
                )));
            }
        }
        for page in &self.error_pages {
            if !(400..600).contains(&page.status) {
                return Err(GantryError::config(format!(
                    "listener {}: error page for non-error status {}",
                    at, page.status
                )));
            }
        }
        if let Some(tls) = &self.tls {
            tls.validate(&at)?;
        }
        if self.services.is_empty() {
            return Err(GantryError::config(format!(
                "listener {}: at least one service is required",
                at
            )));
        }
        for service in &self.services {
            service.validate(&at)?;
        }
        for rule in self.rewrite_request.iter().chain(&self.rewrite_response) {
            rule.validate(&at)?;
        }
        Ok(())
    }
}

impl ListenerTlsConfig {
    fn validate(&self, at: &str) -> GantryResult<()> {
        if self.certificates.is_empty() {
            return Err(GantryError::config(format!(
                "listener {}: tls requires at least one certificate",
                at
            )));
        }
        if self.client_verify > 3 {
            return Err(GantryError::config(format!(
                "listener {}: client_verify must be 0..=3",
                at
            )));
        }
        if matches!(self.client_verify, 1 | 2) && self.ca_path.is_none() {
            return Err(GantryError::config(format!(
                "listener {}: client_verify {} requires ca_path",
                at, self.client_verify
            )));
        }
        Ok(())
    }
}
