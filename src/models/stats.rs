//! Pool statistics and monitor snapshots.
//!
//! These are plain data carriers read by the admin surface; producing them never
//! mutates pool state.

use crate::models::{ReadyState, TenantId};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Per-connection view returned by `TenantPool::stats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStats {
    pub tenant_id: TenantId,
    pub ready_state: ReadyState,
    /// Physical database name.
    pub name: String,
    pub last_used_at: DateTime<Utc>,
    pub use_count: u64,
    pub idle_seconds: u64,
    /// Leases currently handed out for this connection.
    pub active_leases: usize,
}

/// Pool-wide statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub active_connections: usize,
    pub registered_models: usize,
    pub max_connections: usize,
    /// Opens currently in flight (they hold a capacity slot).
    pub pending_opens: usize,
    /// Cumulative connections evicted for idleness.
    pub idle_evictions: u64,
    /// Cumulative connections evicted to make room at capacity.
    pub capacity_evictions: u64,
    /// Cumulative opens that ended in an error.
    pub failed_opens: u64,
    pub connections: Vec<ConnectionStats>,
}

impl PoolStats {
    /// Look up one tenant's entry.
    pub fn connection(&self, tenant_id: &str) -> Option<&ConnectionStats> {
        self.connections
            .iter()
            .find(|c| c.tenant_id.as_str() == tenant_id)
    }
}

/// Condensed per-tenant state kept in snapshot history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantStateSummary {
    pub tenant_id: TenantId,
    pub ready_state: ReadyState,
    pub name: String,
}

/// One monitor tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub total_connections: usize,
    /// `None` when no main connection is tracked.
    pub main_connection_state: Option<ReadyState>,
    /// Connections evicted by the reaper since the previous snapshot.
    pub idle_evictions: u64,
    pub tenants: Vec<TenantStateSummary>,
}

impl MetricsSnapshot {
    pub fn from_stats(
        stats: &PoolStats,
        main_connection_state: Option<ReadyState>,
        idle_evictions: u64,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            total_connections: stats.active_connections,
            main_connection_state,
            idle_evictions,
            tenants: stats
                .connections
                .iter()
                .map(|c| TenantStateSummary {
                    tenant_id: c.tenant_id.clone(),
                    ready_state: c.ready_state,
                    name: c.name.clone(),
                })
                .collect(),
        }
    }
}
