//! Configuration management.
//!
//! The configuration is a TOML file describing global worker settings,
//! listeners, their services and backends, plus a table of named
//! backend templates. Loading goes through environment-variable
//! expansion, per-section validation and a cross-section pass that
//! resolves backend references.

pub mod backend;
pub mod listener;
pub mod service;

use std::collections::HashMap;
use std::env;
use std::path::Path;

use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{GantryError, GantryResult};

pub use backend::{AddrFamily, BackendConfig, BackendEntryConfig, ResolveMode};
pub use listener::{CertificateConfig, ErrorPageConfig, ListenerConfig, ListenerTlsConfig};
pub use service::{
    ConditionConfig, RewriteOpConfig, RewriteRuleConfig, ServiceConfig, SessionConfig,
};

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Worker pool and global runtime settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Listening endpoints
    pub listeners: Vec<ListenerConfig>,
    /// Named backend templates, referenced by `type = "ref"` entries
    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,
}

/// Global server settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Minimum number of workers kept alive
    pub worker_min: usize,
    /// Hard ceiling on concurrent workers
    pub worker_max: usize,
    /// Seconds an excess worker waits for work before exiting
    pub worker_idle_timeout: u64,
    /// Accept-queue depth
    pub queue_depth: usize,
    /// Seconds to let in-flight connections finish on shutdown
    pub grace_period: u64,
    /// Zero the last octet / group of client addresses in access logs
    pub anonymize_ip: bool,
    /// Seconds between health probes of dead backends
    pub probe_interval: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            worker_min: 4,
            worker_max: 128,
            worker_idle_timeout: 30,
            queue_depth: 256,
            grace_period: 30,
            anonymize_ip: false,
            probe_interval: 10,
        }
    }
}

impl Config {
    /// Load configuration from file with environment variable expansion
    pub async fn from_file_with_env<P: AsRef<Path>>(path: P) -> GantryResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await.map_err(|e| {
            GantryError::config(format!(
                "cannot read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        let expanded = expand_env_vars(&content);
        let config: Config = toml::from_str(&expanded)?;
        config.validate()?;

        info!("configuration loaded from {:?}", path.as_ref());
        Ok(config)
    }

    /// Parse configuration from a string (used by tests and `--check-only`)
    pub fn from_str(content: &str) -> GantryResult<Self> {
        let config: Config = toml::from_str(&expand_env_vars(content))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> GantryResult<()> {
        self.server.validate()?;

        if self.listeners.is_empty() {
            return Err(GantryError::config("at least one listener is required"));
        }
        for listener in &self.listeners {
            listener.validate()?;
        }

        for (name, backend) in &self.backends {
            backend.validate().map_err(locus(&format!("backends.{}", name)))?;
            if matches!(backend, BackendConfig::Ref { .. }) {
                return Err(GantryError::config(format!(
                    "backends.{}: a named backend cannot itself be a reference",
                    name
                )));
            }
        }

        self.validate_cross_references()?;
        Ok(())
    }

    /// Check that every backend reference points at a defined template
    fn validate_cross_references(&self) -> GantryResult<()> {
        for listener in &self.listeners {
            for service in &listener.services {
                for entry in &service.backends {
                    if let BackendConfig::Ref { name } = &entry.backend {
                        if !self.backends.contains_key(name) {
                            return Err(GantryError::config(format!(
                                "listener {:?} service {:?}: unknown backend reference {:?}",
                                listener.display_name(),
                                service.display_name(),
                                name
                            )));
                        }
                    }
                }
            }
        }

        let mut control_count = 0usize;
        for listener in &self.listeners {
            for service in &listener.services {
                for entry in &service.backends {
                    if matches!(entry.backend, BackendConfig::Control {}) {
                        control_count += 1;
                    }
                }
            }
        }
        if control_count > 1 {
            warn!("multiple control backends configured; all expose the same state");
        }

        Ok(())
    }

    /// Resolve a backend entry, following one level of reference
    pub fn resolve_backend<'a>(&'a self, entry: &'a BackendConfig) -> &'a BackendConfig {
        match entry {
            BackendConfig::Ref { name } => self
                .backends
                .get(name)
                .expect("validated backend reference"),
            other => other,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> GantryResult<()> {
        if self.worker_min == 0 {
            return Err(GantryError::config("server.worker_min must be greater than 0"));
        }
        if self.worker_max < self.worker_min {
            return Err(GantryError::config(
                "server.worker_max must be at least worker_min",
            ));
        }
        if self.queue_depth == 0 {
            return Err(GantryError::config("server.queue_depth must be greater than 0"));
        }
        Ok(())
    }
}

/// Attach a config-tree locus to an error message
fn locus(at: &str) -> impl Fn(GantryError) -> GantryError + '_ {
    move |err| match err {
        GantryError::Config { message } => {
            GantryError::config(format!("{}: {}", at, message))
        }
        other => other,
    }
}

/// Expand environment variables in configuration content.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn expand_env_vars(content: &str) -> String {
    let mut result = content.to_string();

    while let Some(start) = result.find("${") {
        if let Some(end) = result[start..].find('}') {
            let var_expr = &result[start + 2..start + end];
            let replacement = if let Some(default_pos) = var_expr.find(":-") {
                let var_name = &var_expr[..default_pos];
                let default_value = &var_expr[default_pos + 2..];
                env::var(var_name).unwrap_or_else(|_| default_value.to_string())
            } else {
                env::var(var_expr).unwrap_or_else(|_| {
                    warn!(
                        "environment variable '{}' not found, using empty string",
                        var_expr
                    );
                    String::new()
                })
            };

            result.replace_range(start..start + end + 1, &replacement);
        } else {
            break; // malformed ${VAR expression
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[[listeners]]
bind = "127.0.0.1:8080"

[[listeners.services]]
name = "all"

[[listeners.services.backends]]
type = "regular"
address = "127.0.0.1:3000"
"#;

    #[test]
    fn test_minimal_config() {
        let config = Config::from_str(MINIMAL).unwrap();
        assert_eq!(config.listeners.len(), 1);
        assert_eq!(config.listeners[0].services.len(), 1);
        assert_eq!(config.server.worker_min, 4);
    }

    #[test]
    fn test_env_var_expansion() {
        env::set_var("GANTRY_TEST_PORT", "9999");
        let content = MINIMAL.replace("127.0.0.1:8080", "127.0.0.1:${GANTRY_TEST_PORT}");
        let config = Config::from_str(&content).unwrap();
        assert_eq!(config.listeners[0].bind.port(), 9999);
        env::remove_var("GANTRY_TEST_PORT");

        let content =
            MINIMAL.replace("127.0.0.1:8080", "127.0.0.1:${GANTRY_MISSING:-8081}");
        let config = Config::from_str(&content).unwrap();
        assert_eq!(config.listeners[0].bind.port(), 8081);
    }

    #[test]
    fn test_expand_env_vars_helper() {
        env::set_var("GANTRY_TEST_VAR", "value");
        assert_eq!(expand_env_vars("x = \"${GANTRY_TEST_VAR}\""), "x = \"value\"");
        assert_eq!(
            expand_env_vars("x = \"${GANTRY_NOPE:-fallback}\""),
            "x = \"fallback\""
        );
        env::remove_var("GANTRY_TEST_VAR");
    }

    #[test]
    fn test_no_listeners_rejected() {
        let err = Config::from_str("[server]\nworker_min = 1\n").unwrap_err();
        assert!(matches!(err, GantryError::Config { .. }));
    }

    #[test]
    fn test_worker_bounds_validated() {
        let content = format!("[server]\nworker_min = 8\nworker_max = 4\n{}", MINIMAL);
        assert!(Config::from_str(&content).is_err());

        let content = format!("[server]\nworker_min = 0\n{}", MINIMAL);
        assert!(Config::from_str(&content).is_err());
    }

    #[test]
    fn test_backend_reference_resolution() {
        let content = r#"
[backends.app]
type = "regular"
address = "10.0.0.1:8000"

[[listeners]]
bind = "127.0.0.1:8080"

[[listeners.services]]

[[listeners.services.backends]]
type = "ref"
name = "app"
"#;
        let config = Config::from_str(content).unwrap();
        let entry = &config.listeners[0].services[0].backends[0];
        let resolved = config.resolve_backend(&entry.backend);
        assert!(matches!(resolved, BackendConfig::Regular { .. }));
    }

    #[test]
    fn test_unknown_backend_reference_rejected() {
        let content = r#"
[[listeners]]
bind = "127.0.0.1:8080"

[[listeners.services]]

[[listeners.services.backends]]
type = "ref"
name = "missing"
"#;
        let err = Config::from_str(content).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_named_backend_cannot_be_ref() {
        let content = r#"
[backends.loop]
type = "ref"
name = "loop"

[[listeners]]
bind = "127.0.0.1:8080"

[[listeners.services]]

[[listeners.services.backends]]
type = "regular"
address = "127.0.0.1:3000"
"#;
        assert!(Config::from_str(content).is_err());
    }
}
