//! Tenant connection handle and the lease that marks it in use.

use crate::db::factory::PhysicalConnection;
use crate::error::PoolResult;
use crate::models::{ReadyState, TenantId};
use crate::schema::{EntityKind, Model, ModelSet};
use chrono::{DateTime, Utc};
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use tracing::warn;
use uuid::Uuid;

/// One open tenant database plus the models bound onto it.
///
/// Identity is the `id`: closing and reopening a tenant yields a new
/// `TenantConnection` with a fresh id.
pub struct TenantConnection<C> {
    id: Uuid,
    tenant_id: TenantId,
    database: String,
    physical: C,
    models: ModelSet,
    state: AtomicU8,
    /// Outstanding leases. The reaper and capacity eviction skip non-zero counts.
    leases: AtomicUsize,
    created_at: DateTime<Utc>,
}

impl<C: PhysicalConnection> TenantConnection<C> {
    pub(crate) fn new(tenant_id: TenantId, database: String, physical: C) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            database,
            physical,
            models: ModelSet::new(),
            state: AtomicU8::new(ReadyState::Connecting as u8),
            leases: AtomicUsize::new(0),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    /// Physical database name (`prefix + tenant id`).
    pub fn database_name(&self) -> &str {
        &self.database
    }

    pub fn physical(&self) -> &C {
        &self.physical
    }

    pub fn models(&self) -> &ModelSet {
        &self.models
    }

    /// Bound model for `kind`, if its schema was registered.
    pub fn model(&self, kind: EntityKind) -> Option<Arc<Model>> {
        self.models.get(kind)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Current lifecycle state.
    ///
    /// A connection marked connected whose driver handle has dropped reports
    /// `Disconnected`, so callers never receive a dead handle as usable.
    pub fn ready_state(&self) -> ReadyState {
        let state = ReadyState::from_u8(self.state.load(Ordering::Acquire));
        if state == ReadyState::Connected && !self.physical.is_open() {
            return ReadyState::Disconnected;
        }
        state
    }

    pub fn active_leases(&self) -> usize {
        self.leases.load(Ordering::Acquire)
    }

    pub(crate) fn set_state(&self, state: ReadyState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Close the physical handle, walking through `Disconnecting`.
    pub(crate) async fn shutdown(&self) -> PoolResult<()> {
        self.set_state(ReadyState::Disconnecting);
        let result = self.physical.close().await;
        self.set_state(ReadyState::Disconnected);
        result
    }

    fn acquire_lease(&self) {
        self.leases.fetch_add(1, Ordering::AcqRel);
    }

    /// Saturates at 0.
    fn release_lease(&self) {
        let result = self
            .leases
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_sub(1))
            });

        if let Ok(0) = result {
            warn!(tenant_id = %self.tenant_id, "Lease count underflow detected");
        }
    }
}

impl<C: std::fmt::Debug> std::fmt::Debug for TenantConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantConnection")
            .field("id", &self.id)
            .field("tenant_id", &self.tenant_id)
            .field("database", &self.database)
            .field("physical", &self.physical)
            .field("state", &ReadyState::from_u8(self.state.load(Ordering::Relaxed)))
            .field("leases", &self.leases.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// A connection handed out by `TenantPool::acquire`.
///
/// While any lease is alive the connection is never reaped or evicted for
/// capacity. Dropping the lease releases it; `close` still closes leased
/// connections.
pub struct TenantLease<C: PhysicalConnection> {
    connection: Arc<TenantConnection<C>>,
}

impl<C: PhysicalConnection> TenantLease<C> {
    pub(crate) fn new(connection: Arc<TenantConnection<C>>) -> Self {
        connection.acquire_lease();
        Self { connection }
    }

    /// Shared handle to the leased connection.
    ///
    /// Holding the `Arc` alone does not keep the lease.
    pub fn connection(&self) -> &Arc<TenantConnection<C>> {
        &self.connection
    }
}

impl<C: PhysicalConnection> Clone for TenantLease<C> {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.connection))
    }
}

impl<C: PhysicalConnection> Deref for TenantLease<C> {
    type Target = TenantConnection<C>;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl<C: PhysicalConnection> Drop for TenantLease<C> {
    fn drop(&mut self) {
        self.connection.release_lease();
    }
}

impl<C: PhysicalConnection + std::fmt::Debug> std::fmt::Debug for TenantLease<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantLease")
            .field("connection", &self.connection)
            .finish()
    }
}
