//! Service, condition and rewrite-rule configuration.

use serde::Deserialize;

use super::backend::BackendEntryConfig;
use crate::balancer::{BalancerAlgorithm, SessionKind};
use crate::error::{GantryError, GantryResult};
use crate::matcher::PatternKind;

/// One service of a listener
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: Option<String>,
    /// Condition list; the implicit root is AND
    #[serde(default, rename = "match")]
    pub conditions: Vec<ConditionConfig>,
    #[serde(default)]
    pub backends: Vec<BackendEntryConfig>,
    pub session: Option<SessionConfig>,
    #[serde(default)]
    pub algorithm: BalancerAlgorithm,
    /// Header carrying the client address to the backend
    #[serde(default = "default_forwarded_for")]
    pub forwarded_for_header: String,
    /// Peers whose incoming forwarded-for header is preserved
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
    /// Status classes whose access-log lines are suppressed
    /// (e.g. `["2xx", "3xx"]`)
    #[serde(default)]
    pub log_suppress: Vec<String>,
    #[serde(default)]
    pub rewrite_request: Vec<RewriteRuleConfig>,
    #[serde(default)]
    pub rewrite_response: Vec<RewriteRuleConfig>,
}

fn default_forwarded_for() -> String {
    "X-Forwarded-For".to_string()
}

/// Session affinity settings
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub kind: SessionKind,
    /// Cookie/parameter/header name for the kinds that need one
    #[serde(default)]
    pub id: String,
    /// Seconds an unused session entry survives
    #[serde(default = "default_session_ttl")]
    pub ttl: u64,
}

fn default_session_ttl() -> u64 {
    300
}

/// One node of a condition tree, as written in the configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionConfig {
    /// Boolean combinator
    Bool {
        op: String,
        children: Vec<ConditionConfig>,
    },
    /// Peer address in any of the CIDRs
    Acl { cidrs: Vec<String> },
    Url {
        #[serde(default)]
        pattern: Option<String>,
        #[serde(default)]
        kind: PatternKind,
        #[serde(default)]
        icase: bool,
        /// Load one pattern per line from this file instead
        #[serde(default)]
        file: Option<String>,
    },
    Path {
        #[serde(default)]
        pattern: Option<String>,
        #[serde(default)]
        kind: PatternKind,
        #[serde(default)]
        icase: bool,
        #[serde(default)]
        file: Option<String>,
    },
    Query {
        pattern: String,
        #[serde(default)]
        kind: PatternKind,
        #[serde(default)]
        icase: bool,
    },
    QueryParam {
        name: String,
        pattern: String,
        #[serde(default)]
        kind: PatternKind,
        #[serde(default)]
        icase: bool,
    },
    Header {
        #[serde(default)]
        pattern: Option<String>,
        #[serde(default)]
        kind: PatternKind,
        #[serde(default = "super::listener::default_true_pub")]
        icase: bool,
        #[serde(default)]
        file: Option<String>,
    },
    Host {
        #[serde(default)]
        pattern: Option<String>,
        #[serde(default)]
        kind: PatternKind,
        #[serde(default = "super::listener::default_true_pub")]
        icase: bool,
        #[serde(default)]
        file: Option<String>,
    },
    BasicAuth { file: String },
    StringMatch {
        template: String,
        pattern: String,
        #[serde(default)]
        kind: PatternKind,
        #[serde(default)]
        icase: bool,
    },
}

/// A rewrite rule as written in the configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RewriteRuleConfig {
    #[serde(default)]
    pub cond: Option<ConditionConfig>,
    #[serde(default)]
    pub ops: Vec<RewriteOpConfig>,
    #[serde(default, rename = "else")]
    pub else_ops: Vec<RewriteOpConfig>,
}

/// One rewrite operation
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RewriteOpConfig {
    SetHeader {
        value: String,
    },
    DeleteHeader {
        pattern: String,
        #[serde(default)]
        kind: PatternKind,
        #[serde(default = "super::listener::default_true_pub")]
        icase: bool,
    },
    SetUrl {
        value: String,
    },
    SetPath {
        value: String,
    },
    SetQuery {
        value: String,
    },
    SetQueryParam {
        name: String,
        value: String,
    },
    SubRule {
        rule: Box<RewriteRuleConfig>,
    },
}

impl ServiceConfig {
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| "<unnamed>".to_string())
    }

    pub fn validate(&self, listener: &str) -> GantryResult<()> {
        let at = format!("listener {} service {}", listener, self.display_name());

        if self.backends.is_empty() {
            return Err(GantryError::config(format!(
                "{}: at least one backend is required",
                at
            )));
        }
        for entry in &self.backends {
            entry.validate().map_err(|e| match e {
                GantryError::Config { message } => {
                    GantryError::config(format!("{}: {}", at, message))
                }
                other => other,
            })?;
        }

        if let Some(session) = &self.session {
            session.validate(&at)?;
        }

        for spec in &self.trusted_proxies {
            spec.parse::<crate::matcher::Cidr>().map_err(|_| {
                GantryError::config(format!("{}: bad trusted_proxies entry {:?}", at, spec))
            })?;
        }

        for class in &self.log_suppress {
            parse_status_class(class).ok_or_else(|| {
                GantryError::config(format!(
                    "{}: bad log_suppress class {:?} (want e.g. \"4xx\")",
                    at, class
                ))
            })?;
        }

        for cond in &self.conditions {
            cond.validate(&at)?;
        }
        for rule in self.rewrite_request.iter().chain(&self.rewrite_response) {
            rule.validate(&at)?;
        }
        Ok(())
    }

    /// Bitmask over status classes 1xx..5xx
    pub fn log_suppress_mask(&self) -> u8 {
        self.log_suppress
            .iter()
            .filter_map(|c| parse_status_class(c))
            .fold(0u8, |mask, class| mask | (1 << class))
    }
}

/// `"4xx"` → 4
fn parse_status_class(s: &str) -> Option<u8> {
    let s = s.trim().to_ascii_lowercase();
    let rest = s.strip_suffix("xx")?;
    let class: u8 = rest.parse().ok()?;
    (1..=5).contains(&class).then_some(class)
}

impl SessionConfig {
    fn validate(&self, at: &str) -> GantryResult<()> {
        let needs_id = matches!(
            self.kind,
            SessionKind::Cookie | SessionKind::Url | SessionKind::Param | SessionKind::Header
        );
        if needs_id && self.id.is_empty() {
            return Err(GantryError::config(format!(
                "{}: session kind {:?} requires an id",
                at, self.kind
            )));
        }
        if self.ttl == 0 {
            return Err(GantryError::config(format!(
                "{}: session ttl must be greater than 0",
                at
            )));
        }
        Ok(())
    }
}

impl ConditionConfig {
    pub fn validate(&self, at: &str) -> GantryResult<()> {
        match self {
            ConditionConfig::Bool { op, children } => {
                if !matches!(op.as_str(), "and" | "or" | "not") {
                    return Err(GantryError::config(format!(
                        "{}: bool op must be and/or/not, got {:?}",
                        at, op
                    )));
                }
                if children.is_empty() {
                    return Err(GantryError::config(format!(
                        "{}: bool condition needs children",
                        at
                    )));
                }
                for child in children {
                    child.validate(at)?;
                }
                Ok(())
            }
            ConditionConfig::Acl { cidrs } => {
                for spec in cidrs {
                    spec.parse::<crate::matcher::Cidr>().map_err(|_| {
                        GantryError::config(format!("{}: bad CIDR {:?}", at, spec))
                    })?;
                }
                Ok(())
            }
            ConditionConfig::Url { pattern, kind, file, .. }
            | ConditionConfig::Path { pattern, kind, file, .. }
            | ConditionConfig::Header { pattern, kind, file, .. }
            | ConditionConfig::Host { pattern, kind, file, .. } => {
                if pattern.is_none() && file.is_none() {
                    return Err(GantryError::config(format!(
                        "{}: condition needs a pattern or a file",
                        at
                    )));
                }
                if let (Some(p), PatternKind::Regex) = (pattern, kind) {
                    regex::Regex::new(p).map_err(|e| {
                        GantryError::config(format!("{}: bad pattern {:?}: {}", at, p, e))
                    })?;
                }
                Ok(())
            }
            ConditionConfig::Query { pattern, kind, .. }
            | ConditionConfig::QueryParam { pattern, kind, .. }
            | ConditionConfig::StringMatch { pattern, kind, .. } => {
                if *kind == PatternKind::Regex {
                    regex::Regex::new(pattern).map_err(|e| {
                        GantryError::config(format!("{}: bad pattern {:?}: {}", at, pattern, e))
                    })?;
                }
                Ok(())
            }
            ConditionConfig::BasicAuth { file } => {
                if file.is_empty() {
                    return Err(GantryError::config(format!(
                        "{}: basic_auth requires a file",
                        at
                    )));
                }
                Ok(())
            }
        }
    }
}

impl RewriteRuleConfig {
    pub fn validate(&self, at: &str) -> GantryResult<()> {
        if let Some(cond) = &self.cond {
            cond.validate(at)?;
        }
        if self.ops.is_empty() && self.else_ops.is_empty() {
            return Err(GantryError::config(format!(
                "{}: rewrite rule with no ops",
                at
            )));
        }
        for op in self.ops.iter().chain(&self.else_ops) {
            op.validate(at)?;
        }
        Ok(())
    }
}

impl RewriteOpConfig {
    fn validate(&self, at: &str) -> GantryResult<()> {
        match self {
            RewriteOpConfig::SetHeader { value } => {
                if !value.contains(':') {
                    return Err(GantryError::config(format!(
                        "{}: set_header value {:?} is not a header line",
                        at, value
                    )));
                }
                Ok(())
            }
            RewriteOpConfig::DeleteHeader { pattern, kind, .. } => {
                if *kind == PatternKind::Regex {
                    regex::Regex::new(pattern).map_err(|e| {
                        GantryError::config(format!("{}: bad pattern {:?}: {}", at, pattern, e))
                    })?;
                }
                Ok(())
            }
            RewriteOpConfig::SubRule { rule } => rule.validate(at),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::Config;
    use super::*;

    #[test]
    fn test_service_with_conditions() {
        let content = r#"
[[listeners]]
bind = "127.0.0.1:8080"

[[listeners.services]]
name = "api"
algorithm = "iwrr"
log_suppress = ["2xx", "3xx"]

[[listeners.services.match]]
type = "host"
pattern = "api.example.org"
kind = "exact"

[[listeners.services.match]]
type = "url"
pattern = "^/v[0-9]+/"

[[listeners.services.backends]]
type = "regular"
address = "10.0.0.1:8000"
priority = 2
"#;
        let config = Config::from_str(content).unwrap();
        let svc = &config.listeners[0].services[0];
        assert_eq!(svc.conditions.len(), 2);
        assert_eq!(svc.log_suppress_mask(), 0b0000_1100);
    }

    #[test]
    fn test_session_requires_id() {
        let content = r#"
[[listeners]]
bind = "127.0.0.1:8080"

[[listeners.services]]
session = { kind = "cookie", ttl = 60 }

[[listeners.services.backends]]
type = "regular"
address = "10.0.0.1:8000"
"#;
        assert!(Config::from_str(content).is_err());
        let fixed = content.replace(
            "session = { kind = \"cookie\", ttl = 60 }",
            "session = { kind = \"cookie\", id = \"JSESSIONID\", ttl = 60 }",
        );
        assert!(Config::from_str(&fixed).is_ok());
    }

    #[test]
    fn test_status_class_parsing() {
        assert_eq!(parse_status_class("4xx"), Some(4));
        assert_eq!(parse_status_class("1XX"), Some(1));
        assert_eq!(parse_status_class("6xx"), None);
        assert_eq!(parse_status_class("xx"), None);
    }

    #[test]
    fn test_bool_condition_validation() {
        let content = r#"
[[listeners]]
bind = "127.0.0.1:8080"

[[listeners.services]]

[[listeners.services.match]]
type = "bool"
op = "nand"
children = []

[[listeners.services.backends]]
type = "regular"
address = "10.0.0.1:8000"
"#;
        assert!(Config::from_str(content).is_err());
    }

    #[test]
    fn test_rewrite_rule_config() {
        let content = r#"
[[listeners]]
bind = "127.0.0.1:8080"

[[listeners.services]]

[[listeners.services.backends]]
type = "regular"
address = "10.0.0.1:8000"

[[listeners.rewrite_request]]
[listeners.rewrite_request.cond]
type = "url"
pattern = "^/old/(.*)"

[[listeners.rewrite_request.ops]]
op = "set_path"
value = "/new/$1"

[[listeners.rewrite_request.else]]
op = "set_header"
value = "X-Zone: other"
"#;
        let config = Config::from_str(content).unwrap();
        assert_eq!(config.listeners[0].rewrite_request.len(), 1);
    }

    #[test]
    fn test_empty_rewrite_rule_rejected() {
        let content = r#"
[[listeners]]
bind = "127.0.0.1:8080"

[[listeners.services]]

[[listeners.services.backends]]
type = "regular"
address = "10.0.0.1:8000"

[[listeners.rewrite_request]]
"#;
        assert!(Config::from_str(content).is_err());
    }
}
