//! Error types for adbcj operations.

use std::fmt;
use std::sync::Arc;

/// The primary error type for all adbcj operations.
///
/// Every variant is cheap to clone: a settled future hands the same error
/// to every `get()` caller and every listener.
#[derive(Debug, Clone)]
pub enum DbError {
    /// The underlying socket failed or closed unexpectedly
    Transport(TransportError),
    /// Malformed frame, unknown message type, or a decoder invariant violation
    Protocol(ProtocolError),
    /// Wire-level authentication failure
    Auth(AuthError),
    /// Error reported by the database server
    Server(ServerError),
    /// Bad connection URL or configuration
    Config(String),
    /// Operation attempted on a closed session
    SessionClosed(String),
    /// A future was settled twice (programmer misuse)
    AlreadySettled(String),
    /// New operation on a transaction that has already failed
    TransactionFailed(String),
    /// The future was cancelled before it settled
    Cancelled,
    /// `get` with a deadline timed out
    Timeout,
}

#[derive(Debug, Clone)]
pub struct TransportError {
    pub message: String,
    /// Original I/O error, if any
    pub source: Option<Arc<std::io::Error>>,
}

#[derive(Debug, Clone)]
pub struct ProtocolError {
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct AuthError {
    pub message: String,
}

/// Backend-reported error.
///
/// MySQL reports a numeric vendor code plus a five-character SQLSTATE;
/// PostgreSQL reports a SQLSTATE and a set of human-readable fields.
#[derive(Debug, Clone)]
pub struct ServerError {
    /// Vendor-specific error number (MySQL error code; absent for PostgreSQL)
    pub vendor_code: Option<u32>,
    /// Five-character SQLSTATE, when the server supplied one
    pub sql_state: Option<String>,
    pub message: String,
}

impl DbError {
    /// Build a transport error from an I/O error.
    pub fn transport(message: impl Into<String>, source: std::io::Error) -> Self {
        DbError::Transport(TransportError {
            message: message.into(),
            source: Some(Arc::new(source)),
        })
    }

    /// Build a transport error with no underlying I/O error.
    pub fn transport_msg(message: impl Into<String>) -> Self {
        DbError::Transport(TransportError {
            message: message.into(),
            source: None,
        })
    }

    /// Build a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        DbError::Protocol(ProtocolError {
            message: message.into(),
        })
    }

    /// Build an authentication error.
    pub fn auth(message: impl Into<String>) -> Self {
        DbError::Auth(AuthError {
            message: message.into(),
        })
    }

    /// True for errors that indicate the session itself is unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DbError::Transport(_) | DbError::Protocol(_))
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbError::Transport(e) => write!(f, "transport error: {}", e.message),
            DbError::Protocol(e) => write!(f, "protocol error: {}", e.message),
            DbError::Auth(e) => write!(f, "authentication failed: {}", e.message),
            DbError::Server(e) => {
                write!(f, "server error")?;
                if let Some(code) = e.vendor_code {
                    write!(f, " {}", code)?;
                }
                if let Some(state) = &e.sql_state {
                    write!(f, " ({})", state)?;
                }
                write!(f, ": {}", e.message)
            }
            DbError::Config(msg) => write!(f, "configuration error: {}", msg),
            DbError::SessionClosed(msg) => write!(f, "session closed: {}", msg),
            DbError::AlreadySettled(msg) => write!(f, "future already settled: {}", msg),
            DbError::TransactionFailed(msg) => write!(f, "transaction failed: {}", msg),
            DbError::Cancelled => write!(f, "operation cancelled"),
            DbError::Timeout => write!(f, "operation timed out"),
        }
    }
}

impl std::error::Error for DbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DbError::Transport(e) => e
                .source
                .as_ref()
                .map(|s| s.as_ref() as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_display() {
        let err = DbError::Server(ServerError {
            vendor_code: Some(1045),
            sql_state: Some("28000".to_string()),
            message: "Access denied".to_string(),
        });
        assert_eq!(err.to_string(), "server error 1045 (28000): Access denied");

        let err = DbError::Server(ServerError {
            vendor_code: None,
            sql_state: Some("42601".to_string()),
            message: "syntax error".to_string(),
        });
        assert_eq!(err.to_string(), "server error (42601): syntax error");
    }

    #[test]
    fn test_transport_error_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = DbError::transport("read failed", io);
        let cloned = err.clone();
        assert!(std::error::Error::source(&cloned).is_some());
        assert!(err.is_fatal());
    }

    #[test]
    fn test_non_fatal_kinds() {
        assert!(!DbError::Cancelled.is_fatal());
        assert!(!DbError::Timeout.is_fatal());
        assert!(!DbError::TransactionFailed("x".into()).is_fatal());
    }
}
