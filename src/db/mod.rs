//! Database layer.
//!
//! This module provides tenant connection management:
//! - Connection factory contract (what the pool asks a driver for)
//! - sqlx-backed driver for PostgreSQL, MySQL and SQLite
//! - Tenant connection handles and leases
//! - The per-tenant pool with coalesced opens, capacity policy and idle reaper

pub mod connection;
pub mod driver;
pub mod factory;
pub mod tenant_pool;

pub use connection::{TenantConnection, TenantLease};
pub use driver::{DbPool, SqlxConnectionFactory};
pub use factory::{ConnectionFactory, DatabaseTarget, PhysicalConnection};
pub use tenant_pool::{TenantPool, TenantPoolConfig};
