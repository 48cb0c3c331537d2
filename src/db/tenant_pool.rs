//! Per-tenant connection pool.
//!
//! Keeps at most one open connection per tenant, bounded by `max_connections`,
//! and hands callers a [`TenantLease`] on each acquire.
//!
//! # Design Decisions
//!
//! - **Single `std::sync::Mutex` over pool state**: every record mutation (touch,
//!   insert, eviction) happens under it and it is never held across an await.
//! - **`watch` channel per in-flight open**: concurrent first acquires for one
//!   tenant share a single physical open; late callers wait on the receiver.
//! - **Spawned open task**: a caller that gives up mid-open does not cancel
//!   the open the other waiters depend on.
//! - **Leases**: the reaper and capacity eviction never close a connection
//!   with a live [`TenantLease`].
//!
//! # Capacity
//!
//! In-flight opens count against `max_connections`. When the pool is full an
//! acquire first evicts idle connections, then the least-recently-used
//! connection without leases, and fails with `CapacityExhausted` when every
//! slot is leased or opening.

use crate::config::{
    DEFAULT_CONNECT_RETRIES, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_DATABASE_PREFIX,
    DEFAULT_MAX_TENANT_CONNECTIONS, DEFAULT_RETRY_BACKOFF_MS, DEFAULT_TENANT_IDLE_TIMEOUT_SECS,
    Environment,
};
use crate::db::connection::{TenantConnection, TenantLease};
use crate::db::factory::{ConnectionFactory, DatabaseTarget};
use crate::error::{PoolError, PoolResult};
use crate::models::{ConnectionStats, PoolStats, ReadyState, TenantId};
use crate::schema::{ModelBinder, SchemaRegistry};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tracing::{debug, info, warn};

type SharedConnection<F> = Arc<TenantConnection<<F as ConnectionFactory>::Connection>>;
/// Published by the open task. The lease pins the new record until every
/// waiter holding a receiver has leased it or gone away.
type OpenOutcome<F> = Option<PoolResult<TenantLease<<F as ConnectionFactory>::Connection>>>;

/// Configuration for [`TenantPool`].
#[derive(Debug, Clone)]
pub struct TenantPoolConfig {
    /// Upper bound on open plus opening tenant connections.
    pub max_connections: usize,
    /// Connections idle strictly longer than this are reaped.
    pub idle_timeout: Duration,
    /// Reaper cadence; `None` disables the background reaper.
    pub reap_interval: Option<Duration>,
    /// Bound on each open attempt.
    pub connect_timeout: Duration,
    /// Extra attempts after a retryable open failure.
    pub connect_retries: u32,
    pub retry_backoff: Duration,
    /// Tenant database name = prefix + tenant id.
    pub database_prefix: String,
}

impl Default for TenantPoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_TENANT_CONNECTIONS,
            idle_timeout: Duration::from_secs(DEFAULT_TENANT_IDLE_TIMEOUT_SECS),
            reap_interval: Some(Environment::Production.default_reap_interval()),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            connect_retries: DEFAULT_CONNECT_RETRIES,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            database_prefix: DEFAULT_DATABASE_PREFIX.to_string(),
        }
    }
}

/// Bookkeeping for one open tenant. Only touched under the pool mutex.
struct TenantRecord<C> {
    connection: Arc<TenantConnection<C>>,
    last_used: Instant,
    last_used_at: DateTime<Utc>,
    use_count: u64,
}

impl<C> TenantRecord<C> {
    fn new(connection: Arc<TenantConnection<C>>) -> Self {
        Self {
            connection,
            last_used: Instant::now(),
            last_used_at: Utc::now(),
            use_count: 0,
        }
    }

    fn touch(&mut self) {
        self.last_used = Instant::now();
        self.last_used_at = Utc::now();
        self.use_count += 1;
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used)
    }
}

struct PoolState<F: ConnectionFactory> {
    records: HashMap<TenantId, TenantRecord<F::Connection>>,
    opening: HashMap<TenantId, watch::Receiver<OpenOutcome<F>>>,
    closed: bool,
}

impl<F: ConnectionFactory> PoolState<F> {
    fn occupied(&self) -> usize {
        self.records.len() + self.opening.len()
    }
}

/// What an acquire does after inspecting the pool under the lock.
enum Step<F: ConnectionFactory> {
    Ready(TenantLease<F::Connection>),
    Wait(watch::Receiver<OpenOutcome<F>>),
    Open {
        sender: watch::Sender<OpenOutcome<F>>,
        receiver: watch::Receiver<OpenOutcome<F>>,
    },
    Exhausted,
}

/// Pool of per-tenant database connections.
pub struct TenantPool<F: ConnectionFactory> {
    factory: F,
    config: TenantPoolConfig,
    binder: ModelBinder,
    state: Mutex<PoolState<F>>,
    idle_evictions: AtomicU64,
    capacity_evictions: AtomicU64,
    failed_opens: AtomicU64,
    /// Reaper task handle. Uses std::sync::Mutex for synchronous storage.
    reaper_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<F: ConnectionFactory> TenantPool<F> {
    /// Create a pool and, when `reap_interval` is set, spawn its reaper.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(factory: F, config: TenantPoolConfig, registry: Arc<SchemaRegistry>) -> Arc<Self> {
        let pool = Arc::new(Self {
            factory,
            binder: ModelBinder::new(registry),
            state: Mutex::new(PoolState {
                records: HashMap::new(),
                opening: HashMap::new(),
                closed: false,
            }),
            idle_evictions: AtomicU64::new(0),
            capacity_evictions: AtomicU64::new(0),
            failed_opens: AtomicU64::new(0),
            reaper_handle: Mutex::new(None),
            config,
        });

        if let Some(reap_interval) = pool.config.reap_interval {
            // Weak reference so the reaper never keeps the pool alive
            let weak_pool = Arc::downgrade(&pool);
            let ticker = tokio::time::interval_at(Instant::now() + reap_interval, reap_interval);
            let handle = tokio::spawn(Self::reaper_task(weak_pool, ticker));
            *pool
                .reaper_handle
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        }

        info!(
            max_connections = pool.config.max_connections,
            idle_timeout_secs = pool.config.idle_timeout.as_secs(),
            reap_interval = ?pool.config.reap_interval,
            "Tenant pool created"
        );
        pool
    }

    pub fn config(&self) -> &TenantPoolConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        self.binder.registry()
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Acquire the connection for `tenant_id`, opening it on first use.
    ///
    /// A connected record is returned without I/O. Concurrent first acquires
    /// for the same tenant share one open and all receive its result.
    pub async fn acquire(self: &Arc<Self>, tenant_id: &str) -> PoolResult<TenantLease<F::Connection>> {
        let tenant = TenantId::parse(tenant_id)?;

        loop {
            let (step, discarded) = self.plan_acquire(&tenant)?;
            self.close_discarded(discarded).await;

            let mut receiver = match step {
                Step::Ready(lease) => return Ok(lease),
                Step::Exhausted => {
                    warn!(
                        tenant_id = %tenant,
                        max_connections = self.config.max_connections,
                        "Tenant pool exhausted"
                    );
                    return Err(PoolError::capacity_exhausted(self.config.max_connections));
                }
                Step::Wait(receiver) => {
                    debug!(tenant_id = %tenant, "Waiting on in-flight open");
                    receiver
                }
                Step::Open { sender, receiver } => {
                    let pool = Arc::clone(self);
                    let opening = tenant.clone();
                    tokio::spawn(async move { pool.run_open(opening, sender).await });
                    receiver
                }
            };

            let outcome = match receiver.wait_for(Option::is_some).await {
                Ok(outcome) => outcome.clone(),
                Err(_) => None,
            };

            match outcome {
                Some(Ok(published)) => {
                    if let Some(lease) = self.lease_opened(&tenant, &published)? {
                        return Ok(lease);
                    }
                    debug!(tenant_id = %tenant, "Opened connection gone before lease, retrying");
                }
                Some(Err(e)) => return Err(e),
                None => {
                    // Open task ended without reporting
                    self.forget_opening(&tenant, &receiver);
                }
            }
        }
    }

    /// Close and forget `tenant_id`'s connection.
    ///
    /// Idempotent; returns whether a connection was present. Leased
    /// connections are closed too.
    pub async fn close(&self, tenant_id: &str) -> bool {
        let Ok(tenant) = TenantId::parse(tenant_id) else {
            return false;
        };

        let removed = {
            let mut state = self.lock_state();
            state.records.remove(&tenant)
        };

        match removed {
            Some(record) => {
                Self::close_connection(&record.connection, "closed").await;
                true
            }
            None => false,
        }
    }

    /// Close every connection and refuse further acquires.
    ///
    /// Stops the reaper first. Individual close failures are logged and do
    /// not stop the rest. Returns how many connections were closed.
    pub async fn close_all(&self) -> usize {
        self.stop_reaper();

        let drained: Vec<_> = {
            let mut state = self.lock_state();
            state.closed = true;
            state
                .records
                .drain()
                .map(|(_, record)| record.connection)
                .collect()
        };

        let count = drained.len();
        join_all(
            drained
                .iter()
                .map(|connection| Self::close_connection(connection, "shutdown")),
        )
        .await;

        info!(closed = count, "Closed all tenant connections");
        count
    }

    /// Evict every unleased connection idle longer than `idle_timeout`.
    ///
    /// The idle check and removal happen under the same lock acquire uses to
    /// touch a record, so a racing acquire that got there first wins.
    pub async fn reap_idle(&self) -> usize {
        let evicted = {
            let mut state = self.lock_state();
            Self::take_idle(&mut state, Instant::now(), self.config.idle_timeout)
        };

        if evicted.is_empty() {
            return 0;
        }

        let count = evicted.len();
        self.idle_evictions.fetch_add(count as u64, Ordering::Relaxed);
        join_all(
            evicted
                .iter()
                .map(|connection| Self::close_connection(connection, "idle")),
        )
        .await;

        info!(evicted = count, remaining = self.len(), "Reaped idle tenant connections");
        count
    }

    /// Side-effect-free snapshot of the pool, sorted by tenant id.
    pub fn stats(&self) -> PoolStats {
        let now = Instant::now();
        let state = self.lock_state();

        let mut connections: Vec<ConnectionStats> = state
            .records
            .iter()
            .map(|(tenant, record)| ConnectionStats {
                tenant_id: tenant.clone(),
                ready_state: record.connection.ready_state(),
                name: record.connection.database_name().to_string(),
                last_used_at: record.last_used_at,
                use_count: record.use_count,
                idle_seconds: record.idle_for(now).as_secs(),
                active_leases: record.connection.active_leases(),
            })
            .collect();
        connections.sort_by(|a, b| a.tenant_id.as_str().cmp(b.tenant_id.as_str()));

        PoolStats {
            active_connections: state.records.len(),
            registered_models: self.binder.registry().len(),
            max_connections: self.config.max_connections,
            pending_opens: state.opening.len(),
            idle_evictions: self.idle_evictions.load(Ordering::Relaxed),
            capacity_evictions: self.capacity_evictions.load(Ordering::Relaxed),
            failed_opens: self.failed_opens.load(Ordering::Relaxed),
            connections,
        }
    }

    /// Number of open tenant connections.
    pub fn len(&self) -> usize {
        self.lock_state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, tenant_id: &str) -> bool {
        TenantId::parse(tenant_id)
            .map(|tenant| self.lock_state().records.contains_key(&tenant))
            .unwrap_or(false)
    }

    /// Cumulative idle evictions.
    pub fn idle_evictions(&self) -> u64 {
        self.idle_evictions.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    /// Cancel the background reaper. Safe to call more than once.
    pub fn stop_reaper(&self) {
        let mut handle_guard = self
            .reaper_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = handle_guard.take() {
            handle.abort();
            debug!("Tenant reaper stopped");
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState<F>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide under the lock; returns connections to close outside it.
    fn plan_acquire(&self, tenant: &TenantId) -> PoolResult<(Step<F>, Vec<SharedConnection<F>>)> {
        let mut state = self.lock_state();
        if state.closed {
            return Err(PoolError::ShuttingDown);
        }

        let mut discarded = Vec::new();

        if let Some(record) = state.records.get_mut(tenant) {
            if record.connection.ready_state() == ReadyState::Connected {
                record.touch();
                debug!(tenant_id = %tenant, use_count = record.use_count, "Reusing tenant connection");
                let lease = TenantLease::new(Arc::clone(&record.connection));
                return Ok((Step::Ready(lease), discarded));
            }
        }

        // Stale record: replace silently
        if let Some(stale) = state.records.remove(tenant) {
            debug!(
                tenant_id = %tenant,
                ready_state = %stale.connection.ready_state(),
                "Discarding stale tenant connection"
            );
            discarded.push(stale.connection);
        }

        if let Some(receiver) = state.opening.get(tenant) {
            return Ok((Step::Wait(receiver.clone()), discarded));
        }

        if state.occupied() >= self.config.max_connections {
            let idle = Self::take_idle(&mut state, Instant::now(), self.config.idle_timeout);
            if !idle.is_empty() {
                self.idle_evictions
                    .fetch_add(idle.len() as u64, Ordering::Relaxed);
                info!(evicted = idle.len(), "Evicted idle connections to make room");
            }
            discarded.extend(idle);
        }

        if state.occupied() >= self.config.max_connections {
            match Self::take_least_recently_used(&mut state) {
                Some(victim) => {
                    self.capacity_evictions.fetch_add(1, Ordering::Relaxed);
                    info!(
                        tenant_id = %victim.tenant_id(),
                        requested_by = %tenant,
                        "Evicted least recently used connection at capacity"
                    );
                    discarded.push(victim);
                }
                None => return Ok((Step::Exhausted, discarded)),
            }
        }

        let (sender, receiver) = watch::channel(None);
        state.opening.insert(tenant.clone(), receiver.clone());
        Ok((Step::Open { sender, receiver }, discarded))
    }

    /// Remove unleased records idle strictly longer than `idle_timeout`.
    fn take_idle(
        state: &mut PoolState<F>,
        now: Instant,
        idle_timeout: Duration,
    ) -> Vec<SharedConnection<F>> {
        let expired: Vec<TenantId> = state
            .records
            .iter()
            .filter(|(_, record)| {
                record.connection.active_leases() == 0 && record.idle_for(now) > idle_timeout
            })
            .map(|(tenant, _)| tenant.clone())
            .collect();

        expired
            .iter()
            .filter_map(|tenant| state.records.remove(tenant))
            .map(|record| record.connection)
            .collect()
    }

    fn take_least_recently_used(state: &mut PoolState<F>) -> Option<SharedConnection<F>> {
        let tenant = state
            .records
            .iter()
            .filter(|(_, record)| record.connection.active_leases() == 0)
            .min_by_key(|(_, record)| record.last_used)
            .map(|(tenant, _)| tenant.clone())?;

        state.records.remove(&tenant).map(|record| record.connection)
    }

    /// Lease the connection an open just produced, if its record is still there.
    fn lease_opened(
        &self,
        tenant: &TenantId,
        published: &TenantLease<F::Connection>,
    ) -> PoolResult<Option<TenantLease<F::Connection>>> {
        let mut state = self.lock_state();
        if state.closed {
            return Err(PoolError::ShuttingDown);
        }

        Ok(state
            .records
            .get_mut(tenant)
            .filter(|record| record.connection.id() == published.id())
            .map(|record| {
                record.touch();
                published.clone()
            }))
    }

    fn forget_opening(&self, tenant: &TenantId, receiver: &watch::Receiver<OpenOutcome<F>>) {
        let mut state = self.lock_state();
        let is_same = state
            .opening
            .get(tenant)
            .is_some_and(|current| current.same_channel(receiver));
        if is_same {
            state.opening.remove(tenant);
        }
    }

    /// Open task: dial, bind models, publish the record, notify waiters.
    async fn run_open(self: Arc<Self>, tenant: TenantId, sender: watch::Sender<OpenOutcome<F>>) {
        let database = tenant.database_name(&self.config.database_prefix);

        let outcome = match self.open_physical(&tenant, &database).await {
            Ok(physical) => self.install(&tenant, database, physical).await,
            Err(e) => {
                self.lock_state().opening.remove(&tenant);
                self.failed_opens.fetch_add(1, Ordering::Relaxed);
                warn!(
                    tenant_id = %tenant,
                    database = %database,
                    error = %e,
                    suggestion = ?e.suggestion(),
                    "Failed to open tenant connection"
                );
                Err(e)
            }
        };

        sender.send_replace(Some(outcome));
    }

    /// Dial with a per-attempt timeout, retrying retryable failures.
    async fn open_physical(&self, tenant: &TenantId, database: &str) -> PoolResult<F::Connection> {
        let target = DatabaseTarget::Database(database.to_string());
        let max_attempts = self.config.connect_retries.saturating_add(1);
        let mut attempt = 1;

        loop {
            let result =
                match tokio::time::timeout(self.config.connect_timeout, self.factory.open(&target))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(PoolError::timeout(
                        format!("connect to {}", database),
                        self.config.connect_timeout.as_secs(),
                    )),
                };

            match result {
                Ok(physical) => return Ok(physical),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(
                        tenant_id = %tenant,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Tenant open failed, retrying"
                    );
                    tokio::time::sleep(self.config.retry_backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Insert the record and take the published lease under one lock, so
    /// eviction cannot pick the record before its waiters lease it.
    async fn install(
        &self,
        tenant: &TenantId,
        database: String,
        physical: F::Connection,
    ) -> PoolResult<TenantLease<F::Connection>> {
        let connection = Arc::new(TenantConnection::new(tenant.clone(), database, physical));
        self.binder.bind(connection.database_name(), connection.models());
        connection.set_state(ReadyState::Connected);

        let published = {
            let mut state = self.lock_state();
            state.opening.remove(tenant);
            if state.closed {
                None
            } else {
                state
                    .records
                    .insert(tenant.clone(), TenantRecord::new(Arc::clone(&connection)));
                Some(TenantLease::new(Arc::clone(&connection)))
            }
        };

        let Some(published) = published else {
            Self::close_connection(&connection, "opened during shutdown").await;
            return Err(PoolError::ShuttingDown);
        };

        info!(
            tenant_id = %tenant,
            database = %connection.database_name(),
            models = connection.models().len(),
            "Tenant connection opened"
        );
        Ok(published)
    }

    async fn close_discarded(&self, discarded: Vec<SharedConnection<F>>) {
        for connection in discarded {
            Self::close_connection(&connection, "evicted").await;
        }
    }

    async fn close_connection(connection: &TenantConnection<F::Connection>, reason: &'static str) {
        match connection.shutdown().await {
            Ok(()) => info!(
                tenant_id = %connection.tenant_id(),
                database = %connection.database_name(),
                reason,
                "Closed tenant connection"
            ),
            Err(e) => warn!(
                tenant_id = %connection.tenant_id(),
                database = %connection.database_name(),
                reason,
                error = %e,
                "Failed to close tenant connection"
            ),
        }
    }

    /// Background reaper.
    ///
    /// Holds only a Weak reference and exits once the pool is dropped. A
    /// failed close is logged by `reap_idle` and never stops the next tick.
    async fn reaper_task(weak_pool: Weak<Self>, mut ticker: Interval) {
        loop {
            ticker.tick().await;

            let Some(pool) = weak_pool.upgrade() else {
                info!("Tenant pool dropped, reaper exiting");
                return;
            };

            let evicted = pool.reap_idle().await;
            if evicted == 0 {
                debug!(open = pool.len(), "Reaper tick: nothing idle");
            }

            // Drop strong reference before sleeping to allow pool deallocation
            drop(pool);
        }
    }
}

impl<F: ConnectionFactory> Drop for TenantPool<F> {
    fn drop(&mut self) {
        self.stop_reaper();
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for TenantPool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantPool")
            .field("max_connections", &self.config.max_connections)
            .field("idle_timeout", &self.config.idle_timeout)
            .field("open", &self.len())
            .finish_non_exhaustive()
    }
}
