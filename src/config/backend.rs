//! Backend configuration: the tagged variants and their validation.

use serde::Deserialize;

use crate::error::{GantryError, GantryResult};

/// Address family restriction for matrix resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddrFamily {
    #[default]
    Any,
    V4,
    V6,
}

/// How a matrix backend turns its hostname into concrete backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveMode {
    /// Resolve once at startup; the set is fixed afterwards
    #[default]
    Immediate,
    /// Re-resolve periodically, keep only the first address
    First,
    /// Re-resolve periodically, one backend per address
    All,
    /// SRV lookup; targets and weights come from the records
    Srv,
}

/// A backend as written in the configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Forward to a fixed address
    Regular {
        /// `host:port` socket address
        address: String,
        /// Seconds; falls back to the listener's value when absent
        connect_timeout: Option<u64>,
        timeout: Option<u64>,
        websocket_timeout: Option<u64>,
        /// Speak TLS to the backend
        #[serde(default)]
        tls: bool,
        /// SNI name for the backend handshake
        #[serde(default)]
        sni: Option<String>,
    },
    /// Expand a hostname into backends through DNS
    Matrix {
        host: String,
        port: u16,
        #[serde(default)]
        family: AddrFamily,
        #[serde(default)]
        mode: ResolveMode,
        /// Seconds between re-resolutions
        #[serde(default = "default_retry_interval")]
        retry_interval: u64,
        connect_timeout: Option<u64>,
        timeout: Option<u64>,
        websocket_timeout: Option<u64>,
        #[serde(default)]
        tls: bool,
        #[serde(default)]
        sni: Option<String>,
    },
    /// Reference to a named backend template
    Ref { name: String },
    /// Answer with a redirect
    Redirect {
        #[serde(default = "default_redirect_status")]
        status: u16,
        /// Target template; `$N` substitutes URL-match captures
        target: String,
    },
    /// Serve ACME http-01 challenges from a directory
    Acme { directory: String },
    /// Answer with a fixed status and body
    Error { status: u16, body: String },
    /// Control-plane endpoint
    Control {},
    /// Prometheus metrics endpoint
    Metrics {},
}

fn default_retry_interval() -> u64 {
    30
}

fn default_redirect_status() -> u16 {
    302
}

/// A backend entry inside a service, with its balancing attributes
#[derive(Debug, Clone, Deserialize)]
pub struct BackendEntryConfig {
    #[serde(flatten)]
    pub backend: BackendConfig,
    /// Selection weight
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Member of the emergency list instead of the normal one
    #[serde(default)]
    pub emergency: bool,
    /// Start out administratively disabled
    #[serde(default)]
    pub disabled: bool,
}

fn default_priority() -> u32 {
    5
}

impl BackendConfig {
    pub fn validate(&self) -> GantryResult<()> {
        match self {
            BackendConfig::Regular { address, .. } => {
                address.parse::<std::net::SocketAddr>().map_err(|_| {
                    GantryError::config(format!(
                        "backend address {:?} is not host:port",
                        address
                    ))
                })?;
                Ok(())
            }
            BackendConfig::Matrix {
                host,
                port,
                retry_interval,
                ..
            } => {
                if host.is_empty() {
                    return Err(GantryError::config("matrix backend needs a host"));
                }
                if *port == 0 {
                    return Err(GantryError::config("matrix backend needs a port"));
                }
                if *retry_interval == 0 {
                    return Err(GantryError::config(
                        "matrix retry_interval must be greater than 0",
                    ));
                }
                Ok(())
            }
            BackendConfig::Ref { name } => {
                if name.is_empty() {
                    return Err(GantryError::config("backend reference needs a name"));
                }
                Ok(())
            }
            BackendConfig::Redirect { status, target } => {
                if !matches!(status, 301 | 302 | 303 | 307 | 308) {
                    return Err(GantryError::config(format!(
                        "redirect status {} not one of 301/302/303/307/308",
                        status
                    )));
                }
                if target.is_empty() {
                    return Err(GantryError::config("redirect needs a target"));
                }
                Ok(())
            }
            BackendConfig::Acme { directory } => {
                if directory.is_empty() {
                    return Err(GantryError::config("acme backend needs a directory"));
                }
                Ok(())
            }
            BackendConfig::Error { status, .. } => {
                if !(100..600).contains(status) {
                    return Err(GantryError::config(format!(
                        "error backend status {} out of range",
                        status
                    )));
                }
                Ok(())
            }
            BackendConfig::Control {} | BackendConfig::Metrics {} => Ok(()),
        }
    }
}

impl BackendEntryConfig {
    pub fn validate(&self) -> GantryResult<()> {
        self.backend.validate()
    }
}
