//! Error types for the tenant connection pool.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Each connection-level variant carries an actionable suggestion so operators can
//! tell a bad credential from an unreachable server.

use thiserror::Error;

/// Errors raised by the pool, the driver binding and the admin surface.
///
/// `Clone` so that one failed open can be handed to every caller that was
/// coalesced onto it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
    },

    #[error(
        "Connection pool exhausted: all {max_connections} slots are in use or being opened"
    )]
    CapacityExhausted { max_connections: usize },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Connection pool is shutting down")]
    ShuttingDown,

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl PoolError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    pub fn capacity_exhausted(max_connections: usize) -> Self {
        Self::CapacityExhausted { max_connections }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Timeout { .. } => Some("Check that the database server is reachable"),
            Self::CapacityExhausted { .. } => {
                Some("Raise max_connections or release leases sooner")
            }
            _ => None,
        }
    }

    /// A physical open failed or timed out; the open may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }
}

/// Convert sqlx errors to PoolError.
impl From<sqlx::Error> for PoolError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => PoolError::connection(
                msg.to_string(),
                "Check the base URL format and credentials",
            ),
            sqlx::Error::Database(db_err) => PoolError::connection(
                db_err.message().to_string(),
                "Check that the tenant database exists and the user may access it",
            ),
            // The configured wait is unknown here; the driver maps this with it
            sqlx::Error::PoolTimedOut => PoolError::connection(
                "Timed out waiting for a pooled connection",
                "Raise acquire_timeout on the base URL or reduce load",
            ),
            sqlx::Error::PoolClosed => {
                PoolError::connection("Connection pool is closed", "Acquire the tenant again")
            }
            sqlx::Error::Io(io_err) => PoolError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => PoolError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => PoolError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::WorkerCrashed => PoolError::internal("Database worker crashed"),
            _ => PoolError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;
