use std::fmt;
use thiserror::Error;
use tokio::time::Duration;

/// Main error type for the gantry proxy
#[derive(Error, Debug)]
pub enum GantryError {
    /// Configuration related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Socket / network related errors
    #[error("Network error: {message}")]
    Network { message: String },

    /// Client sent something we refuse to parse
    #[error("Client protocol error: {message}")]
    ClientProtocol { message: String },

    /// Backend sent something we refuse to parse
    #[error("Backend protocol error: {message}")]
    BackendProtocol { message: String },

    /// Backend selection found nothing usable
    #[error("No backend available for service {service}")]
    NoBackend { service: String },

    /// DNS resolution errors
    #[error("Resolver error: {message}")]
    Resolver { message: String },

    /// TLS setup or handshake errors
    #[error("TLS error: {message}")]
    Tls { message: String },

    /// Operation exceeded its deadline
    #[error("Operation timed out after {duration:?}: {operation}")]
    Timeout {
        duration: Duration,
        operation: String,
    },

    /// IO related errors
    #[error("IO error: {message}")]
    Io { message: String },

    /// Internal invariant violations
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl GantryError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a client protocol error
    pub fn client<S: Into<String>>(message: S) -> Self {
        Self::ClientProtocol {
            message: message.into(),
        }
    }

    /// Create a backend protocol error
    pub fn backend<S: Into<String>>(message: S) -> Self {
        Self::BackendProtocol {
            message: message.into(),
        }
    }

    /// Create a no-backend error
    pub fn no_backend<S: Into<String>>(service: S) -> Self {
        Self::NoBackend {
            service: service.into(),
        }
    }

    /// Create a resolver error
    pub fn resolver<S: Into<String>>(message: S) -> Self {
        Self::Resolver {
            message: message.into(),
        }
    }

    /// Create a TLS error
    pub fn tls<S: Into<String>>(message: S) -> Self {
        Self::Tls {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(duration: Duration, operation: S) -> Self {
        Self::Timeout {
            duration,
            operation: operation.into(),
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the connection driver may retry a sibling backend after this
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GantryError::Network { .. } | GantryError::Timeout { .. }
        )
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            GantryError::Config { .. } => ErrorSeverity::Critical,
            GantryError::Tls { .. } => ErrorSeverity::High,
            GantryError::Internal { .. } => ErrorSeverity::High,
            GantryError::NoBackend { .. } => ErrorSeverity::High,
            GantryError::Resolver { .. } => ErrorSeverity::Medium,
            GantryError::Network { .. } => ErrorSeverity::Medium,
            GantryError::Timeout { .. } => ErrorSeverity::Medium,
            GantryError::BackendProtocol { .. } => ErrorSeverity::Medium,
            GantryError::Io { .. } => ErrorSeverity::Medium,
            GantryError::ClientProtocol { .. } => ErrorSeverity::Low,
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Low => write!(f, "LOW"),
            ErrorSeverity::Medium => write!(f, "MEDIUM"),
            ErrorSeverity::High => write!(f, "HIGH"),
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Result type alias for gantry operations
pub type GantryResult<T> = Result<T, GantryError>;

impl From<std::io::Error> for GantryError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => {
                GantryError::timeout(Duration::from_secs(0), err.to_string())
            }
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected => GantryError::network(err.to_string()),
            _ => GantryError::io(err.to_string()),
        }
    }
}

impl From<toml::de::Error> for GantryError {
    fn from(err: toml::de::Error) -> Self {
        GantryError::config(format!("TOML parsing error: {}", err))
    }
}

impl From<serde_json::Error> for GantryError {
    fn from(err: serde_json::Error) -> Self {
        GantryError::internal(format!("JSON serialization error: {}", err))
    }
}

impl From<regex::Error> for GantryError {
    fn from(err: regex::Error) -> Self {
        GantryError::config(format!("Invalid pattern: {}", err))
    }
}

impl From<rustls::Error> for GantryError {
    fn from(err: rustls::Error) -> Self {
        GantryError::tls(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for GantryError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        GantryError::timeout(Duration::from_secs(0), "operation")
    }
}

impl From<trust_dns_resolver::error::ResolveError> for GantryError {
    fn from(err: trust_dns_resolver::error::ResolveError) -> Self {
        GantryError::resolver(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let config_err = GantryError::config("invalid bind address");
        assert!(matches!(config_err, GantryError::Config { .. }));
        assert_eq!(
            config_err.to_string(),
            "Configuration error: invalid bind address"
        );

        let net_err = GantryError::network("connection refused");
        assert!(matches!(net_err, GantryError::Network { .. }));
        assert_eq!(net_err.to_string(), "Network error: connection refused");

        let timeout_err = GantryError::timeout(Duration::from_secs(30), "backend read");
        assert_eq!(
            timeout_err.to_string(),
            "Operation timed out after 30s: backend read"
        );
    }

    #[test]
    fn test_error_properties() {
        let net_err = GantryError::network("connect error");
        assert!(net_err.is_retryable());
        assert_eq!(net_err.severity(), ErrorSeverity::Medium);

        let config_err = GantryError::config("bad config");
        assert!(!config_err.is_retryable());
        assert_eq!(config_err.severity(), ErrorSeverity::Critical);

        let framing_err = GantryError::client("conflicting framing");
        assert!(!framing_err.is_retryable());
        assert_eq!(framing_err.severity(), ErrorSeverity::Low);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(ErrorSeverity::Critical > ErrorSeverity::High);
        assert!(ErrorSeverity::High > ErrorSeverity::Medium);
        assert!(ErrorSeverity::Medium > ErrorSeverity::Low);
    }

    #[test]
    fn test_io_conversion() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: GantryError = refused.into();
        assert!(matches!(err, GantryError::Network { .. }));
        assert!(err.is_retryable());

        let other = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: GantryError = other.into();
        assert!(matches!(err, GantryError::Io { .. }));
    }
}
