pub mod balancer;
pub mod config;
pub mod control;
pub mod error;
pub mod http;
pub mod logfmt;
pub mod matcher;
pub mod proxy;
pub mod resolver;
pub mod rewrite;
pub mod tls;

// Re-export commonly used types
pub use balancer::{Backend, BackendKind, BalancerAlgorithm, Service, SessionKind};
pub use config::Config;
pub use error::{ErrorSeverity, GantryError, GantryResult};
pub use logfmt::LogFormat;
pub use matcher::{Acl, Condition, Pattern, PatternKind};
pub use proxy::{Proxy, ProxyServer};
pub use rewrite::{RewriteOp, RewriteRule, Template};
