//! Connection monitor.
//!
//! Samples the tenant pool on a fixed interval, keeps a bounded history of
//! snapshots and warns when the number of open tenant connections crosses a
//! threshold. Also owns the main (shared) connection so that shutdown can
//! close it after every tenant connection.

use crate::config::{DEFAULT_HISTORY_SIZE, DEFAULT_WARN_THRESHOLD, Environment};
use crate::db::{ConnectionFactory, PhysicalConnection, TenantPool};
use crate::models::{MetricsSnapshot, PoolStats, ReadyState};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tracing::{debug, info, warn};

/// Configuration for [`ConnectionMonitor`].
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Sampling cadence; `None` disables the background sampler.
    pub interval: Option<Duration>,
    /// Warn when more than this many tenant connections are open.
    pub warn_threshold: usize,
    /// Snapshots kept; the oldest is dropped first.
    pub history_size: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Some(Environment::Production.default_monitor_interval()),
            warn_threshold: DEFAULT_WARN_THRESHOLD,
            history_size: DEFAULT_HISTORY_SIZE,
        }
    }
}

/// Periodic observer of a [`TenantPool`].
pub struct ConnectionMonitor<F: ConnectionFactory> {
    pool: Arc<TenantPool<F>>,
    main: Option<F::Connection>,
    main_closed: AtomicBool,
    config: MonitorConfig,
    history: Mutex<VecDeque<MetricsSnapshot>>,
    /// Pool idle-eviction counter at the previous snapshot.
    last_idle_evictions: AtomicU64,
    /// Sampler task handle. Uses std::sync::Mutex for synchronous storage.
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<F: ConnectionFactory> ConnectionMonitor<F> {
    /// Create a monitor and, when `interval` is set, spawn its sampler.
    ///
    /// `main` is the shared non-tenant connection, if the caller has one.
    pub fn new(
        pool: Arc<TenantPool<F>>,
        main: Option<F::Connection>,
        config: MonitorConfig,
    ) -> Arc<Self> {
        let history_size = config.history_size.max(1);
        let monitor = Arc::new(Self {
            last_idle_evictions: AtomicU64::new(pool.idle_evictions()),
            pool,
            main,
            main_closed: AtomicBool::new(false),
            history: Mutex::new(VecDeque::with_capacity(history_size)),
            handle: Mutex::new(None),
            config: MonitorConfig {
                history_size,
                ..config
            },
        });

        if let Some(interval) = monitor.config.interval {
            let weak_monitor = Arc::downgrade(&monitor);
            let ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            let handle = tokio::spawn(Self::sample_task(weak_monitor, ticker));
            *monitor
                .handle
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        }

        monitor
    }

    pub fn pool(&self) -> &Arc<TenantPool<F>> {
        &self.pool
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Current pool statistics.
    pub fn current_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Snapshots, oldest first.
    pub fn metrics_history(&self) -> Vec<MetricsSnapshot> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// State of the main connection, `None` when there is none.
    pub fn main_connection_state(&self) -> Option<ReadyState> {
        self.main.as_ref().map(|main| {
            if !self.main_closed.load(Ordering::Acquire) && main.is_open() {
                ReadyState::Connected
            } else {
                ReadyState::Disconnected
            }
        })
    }

    /// Take one snapshot, append it to the history and return it.
    pub fn capture(&self) -> MetricsSnapshot {
        let stats = self.pool.stats();
        let previous = self
            .last_idle_evictions
            .swap(stats.idle_evictions, Ordering::AcqRel);
        let snapshot = MetricsSnapshot::from_stats(
            &stats,
            self.main_connection_state(),
            stats.idle_evictions.saturating_sub(previous),
        );

        {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            history.push_back(snapshot.clone());
            while history.len() > self.config.history_size {
                history.pop_front();
            }
        }

        if snapshot.total_connections > self.config.warn_threshold {
            let breakdown = serde_json::to_string(&snapshot.tenants).unwrap_or_default();
            warn!(
                total_connections = snapshot.total_connections,
                warn_threshold = self.config.warn_threshold,
                max_connections = stats.max_connections,
                tenants = %breakdown,
                "Tenant connection count above threshold"
            );
        } else {
            debug!(
                total_connections = snapshot.total_connections,
                idle_evictions = snapshot.idle_evictions,
                "Captured pool snapshot"
            );
        }

        snapshot
    }

    /// Cancel the sampler. Safe to call more than once.
    pub fn stop(&self) {
        let mut handle_guard = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = handle_guard.take() {
            handle.abort();
            debug!("Connection monitor stopped");
        }
    }

    /// Stop sampling and reaping, close every tenant connection, then the
    /// main connection.
    ///
    /// Failures are logged and never abort the shutdown. Returns how many
    /// tenant connections were closed.
    pub async fn force_close_all(&self) -> usize {
        self.stop();
        self.pool.stop_reaper();

        let closed = self.pool.close_all().await;

        if let Some(main) = &self.main {
            if !self.main_closed.swap(true, Ordering::AcqRel) {
                match main.close().await {
                    Ok(()) => info!("Main connection closed"),
                    Err(e) => warn!(error = %e, "Failed to close main connection"),
                }
            }
        }

        info!(tenant_connections = closed, "All connections closed");
        closed
    }

    async fn sample_task(weak_monitor: Weak<Self>, mut ticker: Interval) {
        loop {
            ticker.tick().await;

            let Some(monitor) = weak_monitor.upgrade() else {
                info!("Connection monitor dropped, sampler exiting");
                return;
            };
            monitor.capture();
        }
    }
}

impl<F: ConnectionFactory> Drop for ConnectionMonitor<F> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for ConnectionMonitor<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionMonitor")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}
