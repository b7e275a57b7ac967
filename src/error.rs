/// Unified error handling for the cluster connection pool
///
/// Only malformed reconciliation input is ever returned to a caller of the
/// pool. Connection-level failures stay local to the node that raised them
/// and are surfaced through `nodeError` notifications instead.

use std::fmt;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Main error type for pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    /// A node descriptor that cannot be normalized into a node key
    #[error("Invalid node {value}: {reason}")]
    InvalidNode { value: String, reason: String },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Errors raised by a single node connection.
///
/// Cloneable so one failure can be handed to every error observer.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("Network error: {0}")]
    Io(Arc<io::Error>),

    #[error("Connection to {addr} timed out")]
    Timeout { addr: String },

    #[error("RESP protocol error: {message}")]
    Protocol { message: String },

    #[error("Server replied with error: {message}")]
    Server { message: String },

    #[error("Connection is closed")]
    Closed,

    #[error("Connection is not ready and the offline queue is disabled")]
    NotReady,
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        ConnectionError::Io(Arc::new(err))
    }
}

/// Result type alias for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

impl PoolError {
    /// Create an invalid node error
    pub fn invalid_node<V: fmt::Display, S: Into<String>>(value: V, reason: S) -> Self {
        PoolError::InvalidNode {
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        PoolError::Internal {
            message: message.into(),
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            PoolError::Config(_) => ErrorSeverity::Critical,
            PoolError::Internal { .. } => ErrorSeverity::Critical,
            PoolError::InvalidNode { .. } => ErrorSeverity::Error,
        }
    }
}

impl ConnectionError {
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        ConnectionError::Protocol {
            message: message.into(),
        }
    }

    pub fn server<S: Into<String>>(message: S) -> Self {
        ConnectionError::Server {
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(addr: S) -> Self {
        ConnectionError::Timeout { addr: addr.into() }
    }

    /// Network failures and timeouts clear up once the topology layer
    /// reconciles again; protocol and server errors do not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ConnectionError::Io(_)
                | ConnectionError::Timeout { .. }
                | ConnectionError::Closed
                | ConnectionError::NotReady
        )
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_node_message() {
        let error = PoolError::invalid_node("true", "unsupported node type");
        assert!(matches!(error, PoolError::InvalidNode { .. }));
        assert_eq!(error.to_string(), "Invalid node true: unsupported node type");
    }

    #[test]
    fn test_error_severity() {
        let config_error = PoolError::Config(ConfigError::ValidationError("test".to_string()));
        assert_eq!(config_error.severity(), ErrorSeverity::Critical);

        assert_eq!(config_error.severity().to_string(), "CRITICAL");

        let node_error = PoolError::invalid_node("0", "port out of range");
        assert_eq!(node_error.severity(), ErrorSeverity::Error);
        assert_eq!(PoolError::internal("no runtime").severity(), ErrorSeverity::Critical);
    }

    #[test]
    fn test_connection_error_recoverability() {
        let io_error: ConnectionError =
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused").into();
        assert!(io_error.is_recoverable());
        assert!(ConnectionError::timeout("127.0.0.1:7000").is_recoverable());

        assert!(!ConnectionError::server("ERR wrong").is_recoverable());
        assert!(!ConnectionError::protocol("bad frame").is_recoverable());
    }

    #[test]
    fn test_connection_error_is_cloneable() {
        let original: ConnectionError = io::Error::new(io::ErrorKind::BrokenPipe, "pipe").into();
        let copy = original.clone();
        assert_eq!(original.to_string(), copy.to_string());
    }
}
