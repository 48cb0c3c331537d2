mod common;

use common::{MockFactory, config, pool};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tenant_db_pool::db::PhysicalConnection;
use tenant_db_pool::error::PoolError;
use tenant_db_pool::models::ReadyState;
use tenant_db_pool::schema::EntityKind;

const IDLE: Duration = Duration::from_secs(300);

#[tokio::test]
async fn test_consecutive_acquires_return_same_connection() {
    let factory = MockFactory::new();
    let pool = pool(&factory, config(10, IDLE));

    let first_id = pool.acquire("acme").await.unwrap().id();
    let mut last_use_count = pool.stats().connection("acme").unwrap().use_count;
    assert_eq!(last_use_count, 1);

    for _ in 0..5 {
        let lease = pool.acquire("acme").await.unwrap();
        assert_eq!(lease.id(), first_id);

        let use_count = pool.stats().connection("acme").unwrap().use_count;
        assert!(use_count > last_use_count, "use count must strictly increase");
        last_use_count = use_count;
    }

    assert_eq!(factory.opens(), 1);
}

#[tokio::test]
async fn test_close_then_acquire_yields_new_identity() {
    let factory = MockFactory::new();
    let pool = pool(&factory, config(10, IDLE));

    let old_id = pool.acquire("acme").await.unwrap().id();
    pool.acquire("acme").await.unwrap();

    assert!(pool.close("acme").await);
    assert!(!pool.close("acme").await, "close must be idempotent");
    assert_eq!(factory.closes(), 1);
    assert!(pool.stats().connection("acme").is_none());

    let lease = pool.acquire("acme").await.unwrap();
    assert_ne!(lease.id(), old_id);
    assert_eq!(pool.stats().connection("acme").unwrap().use_count, 1);
    assert_eq!(factory.opens(), 2);
}

#[tokio::test]
async fn test_acquire_binds_models_and_derives_database_name() {
    let factory = MockFactory::new();
    let mut pool_config = config(10, IDLE);
    pool_config.database_prefix = "tenant_".to_string();
    let pool = pool(&factory, pool_config);

    let lease = pool.acquire("acme").await.unwrap();

    assert_eq!(factory.targets(), vec!["tenant_acme".to_string()]);
    assert_eq!(lease.database_name(), "tenant_acme");
    assert_eq!(lease.ready_state(), ReadyState::Connected);
    assert_eq!(lease.models().len(), EntityKind::ALL.len());
    assert_eq!(
        lease.model(EntityKind::Category).unwrap().namespace(),
        "tenant_acme.product_categories"
    );

    let stats = pool.stats();
    assert_eq!(stats.registered_models, EntityKind::ALL.len());
    assert_eq!(stats.connection("acme").unwrap().name, "tenant_acme");
}

#[tokio::test]
async fn test_invalid_tenant_id_never_dials() {
    let factory = MockFactory::new();
    let pool = pool(&factory, config(10, IDLE));

    let too_long = "x".repeat(49);
    for bad in ["", "acme corp", "../etc", too_long.as_str()] {
        let err = pool.acquire(bad).await.unwrap_err();
        assert!(matches!(err, PoolError::InvalidInput { .. }), "{bad:?}: {err}");
    }
    assert_eq!(factory.opens(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_first_acquires_share_one_open() {
    let factory = MockFactory::with_delay(Duration::from_millis(50));
    let pool = pool(&factory, config(10, IDLE));

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire("acme").await })
        })
        .collect();

    let mut leases = Vec::new();
    for handle in handles {
        leases.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(factory.opens(), 1);
    assert!(leases.iter().all(|lease| lease.id() == leases[0].id()));

    let stats = pool.stats();
    assert_eq!(stats.active_connections, 1);
    assert_eq!(stats.pending_opens, 0);
    let acme = stats.connection("acme").unwrap();
    assert_eq!(acme.use_count, 10);
    assert_eq!(acme.active_leases, 10);
}

#[tokio::test(start_paused = true)]
async fn test_coalesced_failure_reaches_every_waiter() {
    let factory = MockFactory::with_delay(Duration::from_millis(50));
    factory.fail_next(1);
    let pool = pool(&factory, config(10, IDLE));

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire("org-1").await })
        })
        .collect();

    for handle in handles {
        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {err}");
    }
    assert_eq!(factory.opens(), 1);
    assert_eq!(pool.stats().failed_opens, 1);
}

#[tokio::test]
async fn test_failed_open_leaves_no_record() {
    let factory = MockFactory::new();
    factory.fail_next(1);
    let pool = pool(&factory, config(10, IDLE));

    let err = pool.acquire("org-1").await.unwrap_err();
    assert!(matches!(err, PoolError::Connection { .. }));
    assert!(err.suggestion().is_some());

    let stats = pool.stats();
    assert!(stats.connections.is_empty());
    assert_eq!(stats.pending_opens, 0);
    assert_eq!(stats.failed_opens, 1);

    // Next acquire dials afresh
    let lease = pool.acquire("org-1").await.unwrap();
    assert_eq!(lease.ready_state(), ReadyState::Connected);
    assert_eq!(factory.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_retryable_failures_are_retried_within_one_open() {
    let factory = MockFactory::new();
    factory.fail_next(2);
    let mut pool_config = config(10, IDLE);
    pool_config.connect_retries = 2;
    let pool = pool(&factory, pool_config);

    pool.acquire("acme").await.unwrap();

    assert_eq!(factory.opens(), 3);
    assert_eq!(pool.stats().failed_opens, 0);
}

#[tokio::test(start_paused = true)]
async fn test_retries_are_bounded() {
    let factory = MockFactory::new();
    factory.fail_next(5);
    let mut pool_config = config(10, IDLE);
    pool_config.connect_retries = 1;
    let pool = pool(&factory, pool_config);

    assert!(pool.acquire("acme").await.is_err());
    assert_eq!(factory.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_slow_open_times_out() {
    let factory = MockFactory::with_delay(Duration::from_secs(30));
    let mut pool_config = config(10, IDLE);
    pool_config.connect_timeout = Duration::from_secs(2);
    let pool = pool(&factory, pool_config);

    let err = pool.acquire("acme").await.unwrap_err();
    assert!(matches!(err, PoolError::Timeout { elapsed_secs: 2, .. }), "{err}");
    assert!(pool.is_empty());
}

#[tokio::test]
async fn test_stale_connection_is_replaced_silently() {
    let factory = MockFactory::new();
    let pool = pool(&factory, config(10, IDLE));

    let lease = pool.acquire("acme").await.unwrap();
    let old_id = lease.id();
    lease.physical().close().await.unwrap();
    assert_eq!(
        pool.stats().connection("acme").unwrap().ready_state,
        ReadyState::Disconnected
    );
    drop(lease);

    let lease = pool.acquire("acme").await.unwrap();
    assert_ne!(lease.id(), old_id);
    assert_eq!(lease.ready_state(), ReadyState::Connected);
    assert_eq!(pool.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_full_pool_evicts_idle_connection_first() {
    let factory = MockFactory::new();
    let pool = pool(&factory, config(2, Duration::from_secs(5)));

    pool.acquire("A").await.unwrap();
    tokio::time::advance(Duration::from_secs(5)).await;
    pool.acquire("B").await.unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;

    // A idle 6s, B idle 1s
    pool.acquire("C").await.unwrap();

    assert!(!pool.contains("A"));
    assert!(pool.contains("B"));
    assert!(pool.contains("C"));
    let stats = pool.stats();
    assert_eq!(stats.active_connections, 2);
    assert_eq!(stats.idle_evictions, 1);
    assert_eq!(stats.capacity_evictions, 0);
}

#[tokio::test(start_paused = true)]
async fn test_full_pool_evicts_least_recently_used_when_none_idle() {
    let factory = MockFactory::new();
    let pool = pool(&factory, config(2, Duration::from_secs(300)));

    pool.acquire("A").await.unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    pool.acquire("B").await.unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    pool.acquire("A").await.unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;

    pool.acquire("C").await.unwrap();

    assert!(pool.contains("A"));
    assert!(!pool.contains("B"));
    assert!(pool.contains("C"));
    assert_eq!(pool.stats().capacity_evictions, 1);
    assert_eq!(factory.closes(), 1);
}

#[tokio::test]
async fn test_leased_connections_are_never_evicted() {
    let factory = MockFactory::new();
    let pool = pool(&factory, config(2, Duration::from_secs(300)));

    let a = pool.acquire("A").await.unwrap();
    let _b = pool.acquire("B").await.unwrap();

    let err = pool.acquire("C").await.unwrap_err();
    assert_eq!(err, PoolError::CapacityExhausted { max_connections: 2 });
    assert_eq!(pool.len(), 2);
    assert_eq!(factory.closes(), 0);

    drop(a);
    pool.acquire("C").await.unwrap();
    assert!(!pool.contains("A"));
    assert!(pool.contains("B"));
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_open_counts_against_capacity() {
    let factory = MockFactory::with_delay(Duration::from_secs(1));
    let pool = pool(&factory, config(1, IDLE));

    let opening = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire("A").await })
    };
    while pool.stats().pending_opens == 0 {
        tokio::task::yield_now().await;
    }

    let err = pool.acquire("B").await.unwrap_err();
    assert!(matches!(err, PoolError::CapacityExhausted { .. }));

    opening.await.unwrap().unwrap();
    assert!(pool.contains("A"));
}

#[tokio::test]
async fn test_random_sequence_never_exceeds_capacity() {
    let factory = MockFactory::new();
    let max_connections = 4;
    let pool = pool(&factory, config(max_connections, IDLE));
    let tenants: Vec<String> = (0..12).map(|i| format!("tenant-{i}")).collect();
    let mut rng = StdRng::seed_from_u64(0x7e4a_47);
    let mut held = Vec::new();

    for _ in 0..500 {
        let tenant = &tenants[rng.gen_range(0..tenants.len())];
        match rng.gen_range(0..10) {
            0..=1 => {
                pool.close(tenant).await;
            }
            2 if held.len() < 2 => {
                held.push(pool.acquire(tenant).await.unwrap());
            }
            3 if !held.is_empty() => {
                held.remove(rng.gen_range(0..held.len()));
            }
            _ => {
                pool.acquire(tenant).await.unwrap();
            }
        }

        let stats = pool.stats();
        assert!(stats.active_connections <= max_connections);
        assert_eq!(stats.connections.len(), stats.active_connections);
    }
}

#[tokio::test(start_paused = true)]
async fn test_reaper_evicts_idle_connections() {
    let factory = MockFactory::new();
    let mut pool_config = config(10, Duration::from_secs(5));
    pool_config.reap_interval = Some(Duration::from_secs(1));
    let pool = pool(&factory, pool_config);

    pool.acquire("acme").await.unwrap();
    pool.acquire("globex").await.unwrap();
    tokio::time::sleep(Duration::from_secs(7)).await;

    assert!(pool.is_empty());
    assert!(pool.stats().connections.is_empty());
    assert_eq!(pool.stats().idle_evictions, 2);
    assert_eq!(factory.closes(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reaper_skips_leased_and_recently_touched() {
    let factory = MockFactory::new();
    let mut pool_config = config(10, Duration::from_secs(5));
    pool_config.reap_interval = Some(Duration::from_secs(1));
    let pool = pool(&factory, pool_config);

    let held = pool.acquire("held").await.unwrap();
    pool.acquire("busy").await.unwrap();

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_secs(4)).await;
        pool.acquire("busy").await.unwrap();
    }
    assert!(pool.contains("held"));
    assert!(pool.contains("busy"));

    drop(held);
    tokio::time::sleep(Duration::from_secs(7)).await;
    assert!(!pool.contains("held"));
    assert!(!pool.contains("busy"));
}

#[tokio::test]
async fn test_reap_idle_returns_zero_when_nothing_idle() {
    let factory = MockFactory::new();
    let pool = pool(&factory, config(10, IDLE));
    pool.acquire("acme").await.unwrap();

    assert_eq!(pool.reap_idle().await, 0);
    assert!(pool.contains("acme"));
}

#[tokio::test]
async fn test_close_all_continues_past_failures() {
    let factory = MockFactory::new();
    factory.fail_closes();
    let pool = pool(&factory, config(10, IDLE));
    let lease = pool.acquire("a").await.unwrap();
    pool.acquire("b").await.unwrap();
    pool.acquire("c").await.unwrap();

    assert_eq!(pool.close_all().await, 3);
    assert_eq!(factory.closes(), 3);
    assert!(pool.is_empty());
    assert_eq!(lease.ready_state(), ReadyState::Disconnected);
    assert_eq!(pool.acquire("a").await.unwrap_err(), PoolError::ShuttingDown);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_in_flight_open() {
    let factory = MockFactory::with_delay(Duration::from_secs(1));
    let pool = pool(&factory, config(10, IDLE));

    let opening = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire("acme").await })
    };
    while pool.stats().pending_opens == 0 {
        tokio::task::yield_now().await;
    }

    assert_eq!(pool.close_all().await, 0);

    let err = opening.await.unwrap().unwrap_err();
    assert_eq!(err, PoolError::ShuttingDown);
    assert_eq!(factory.opens(), 1);
    assert_eq!(factory.closes(), 1);
    assert!(pool.is_empty());
}
