//! Physical-connection factory contract.
//!
//! The pool never talks to a driver directly. It asks a [`ConnectionFactory`]
//! to open a [`DatabaseTarget`] and keeps the returned [`PhysicalConnection`]
//! until it is evicted or closed.

use crate::error::{PoolError, PoolResult};
use std::future::Future;

/// Target for an open request.
///
/// Distinguishes the shared server-level database (the base URL as given)
/// from a named per-tenant database.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DatabaseTarget {
    /// The base URL unchanged; used for the main connection.
    Server,
    /// A specific database, derived from a tenant id.
    Database(String),
}

impl std::fmt::Display for DatabaseTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseTarget::Server => write!(f, "server"),
            DatabaseTarget::Database(name) => write!(f, "{}", name),
        }
    }
}

impl DatabaseTarget {
    /// Create a database target from an optional string.
    /// Returns error for empty string (use Server variant instead).
    pub fn from_option(database: Option<&str>) -> PoolResult<Self> {
        match database {
            None => Ok(DatabaseTarget::Server),
            Some("") => Err(PoolError::invalid_input(
                "Database name cannot be empty. Omit it to use the base URL database.",
            )),
            Some(db) => Ok(DatabaseTarget::Database(db.to_string())),
        }
    }
}

/// An open handle to one logical database.
pub trait PhysicalConnection: Send + Sync + 'static {
    /// False once the driver considers the handle closed.
    fn is_open(&self) -> bool;

    /// Close the handle and release its sockets.
    fn close(&self) -> impl Future<Output = PoolResult<()>> + Send;
}

/// Opens physical connections for the pool.
///
/// Implementations apply their own sub-pool settings; the caller bounds the
/// whole open with its connect timeout and retry policy.
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: PhysicalConnection;

    /// Open `target`, resolving once the connection is usable.
    fn open(
        &self,
        target: &DatabaseTarget,
    ) -> impl Future<Output = PoolResult<Self::Connection>> + Send;
}
