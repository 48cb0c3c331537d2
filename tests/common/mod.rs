//! Scripted in-memory connection factory shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tenant_db_pool::db::{ConnectionFactory, DatabaseTarget, PhysicalConnection, TenantPool, TenantPoolConfig};
use tenant_db_pool::error::{PoolError, PoolResult};
use tenant_db_pool::schema::SchemaRegistry;

#[derive(Debug)]
pub struct MockConnection {
    pub database: String,
    closed: AtomicBool,
    fail_close: bool,
    closes: Arc<AtomicUsize>,
}

impl PhysicalConnection for MockConnection {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) -> PoolResult<()> {
        self.closed.store(true, Ordering::Release);
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(PoolError::internal("socket already gone"));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MockState {
    opens: AtomicUsize,
    closes: Arc<AtomicUsize>,
    failures_remaining: AtomicUsize,
    fail_close: AtomicBool,
    delay: Mutex<Duration>,
    targets: Mutex<Vec<String>>,
}

/// Counts opens and closes; can delay opens and fail the next N of them.
#[derive(Debug, Clone, Default)]
pub struct MockFactory {
    state: Arc<MockState>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        let factory = Self::new();
        *factory.state.delay.lock().unwrap() = delay;
        factory
    }

    /// Make the next `n` opens fail with a retryable connection error.
    pub fn fail_next(&self, n: usize) {
        self.state.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Make every close report an error (the handle still ends up closed).
    pub fn fail_closes(&self) {
        self.state.fail_close.store(true, Ordering::SeqCst);
    }

    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Database names passed to `open`, in call order.
    pub fn targets(&self) -> Vec<String> {
        self.state.targets.lock().unwrap().clone()
    }
}

impl ConnectionFactory for MockFactory {
    type Connection = MockConnection;

    async fn open(&self, target: &DatabaseTarget) -> PoolResult<MockConnection> {
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        self.state.targets.lock().unwrap().push(target.to_string());

        let delay = *self.state.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failed = self
            .state
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(PoolError::connection(
                format!("Failed to connect to {}: connection refused", target),
                "Check that the database server is running and accessible",
            ));
        }

        Ok(MockConnection {
            database: target.to_string(),
            closed: AtomicBool::new(false),
            fail_close: self.state.fail_close.load(Ordering::SeqCst),
            closes: Arc::clone(&self.state.closes),
        })
    }
}

/// Pool config without a background reaper, no retries.
pub fn config(max_connections: usize, idle_timeout: Duration) -> TenantPoolConfig {
    TenantPoolConfig {
        max_connections,
        idle_timeout,
        reap_interval: None,
        connect_timeout: Duration::from_secs(10),
        connect_retries: 0,
        retry_backoff: Duration::from_millis(500),
        database_prefix: "org_".to_string(),
    }
}

pub fn pool(factory: &MockFactory, config: TenantPoolConfig) -> Arc<TenantPool<MockFactory>> {
    TenantPool::new(
        factory.clone(),
        config,
        Arc::new(SchemaRegistry::with_builtins()),
    )
}
