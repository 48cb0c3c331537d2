//! Data models for the tenant pool.
//!
//! This module re-exports all model types used throughout the application.

pub mod stats;
pub mod tenant;

// Re-export commonly used types
pub use stats::{ConnectionStats, MetricsSnapshot, PoolStats, TenantStateSummary};
pub use tenant::{DatabaseType, MAX_TENANT_ID_LEN, ReadyState, TenantId};
