//! Transport layer for the admin surface.
//!
//! - HTTP: JSON stats, history and health endpoints

pub mod http;

pub use http::{AdminTransport, HealthResponse, wait_for_signal};

use crate::error::PoolResult;
use std::future::Future;

/// Trait for server transports.
pub trait Transport: Send + Sync {
    /// Start the transport and begin handling requests.
    ///
    /// This method should block until the transport is shut down.
    fn run(&self) -> impl Future<Output = PoolResult<()>> + Send;

    /// Get the name of this transport for logging.
    fn name(&self) -> &'static str;
}
