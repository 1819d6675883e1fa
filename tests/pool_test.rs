//! Tests for the cubestore-driver connection pool

mod common;

use common::{pool, test_pool_config, MockBackend};
use cubestore_driver::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

async fn session_of(conn: &PooledConnection) -> u64 {
    let row = conn
        .query_one("select connection_id() as connectionId", &[])
        .await
        .unwrap()
        .unwrap();
    SessionId::from_row(&row).unwrap().get()
}

// ==================== Acquire / Release ====================

#[tokio::test]
async fn test_release_returns_connection_for_reuse() {
    let backend = MockBackend::new();
    let pool = pool(&backend, test_pool_config(2)).await;

    let conn = pool.acquire().await.unwrap();
    let id = conn.id();
    assert_eq!(pool.borrowed(), 1);
    pool.release(conn).await;

    assert_eq!(pool.borrowed(), 0);
    assert_eq!(pool.idle().await, 1);

    let conn = pool.acquire().await.unwrap();
    assert_eq!(conn.id(), id);
    pool.release(conn).await;

    assert_eq!(backend.connections_opened(), 1);
    let stats = pool.stats();
    assert_eq!(stats.acquisitions, 2);
    assert_eq!(stats.releases, 2);
}

#[tokio::test]
async fn test_min_size_prepopulates() {
    let backend = MockBackend::new();
    let pool = pool(&backend, test_pool_config(4).with_min_size(2)).await;

    assert_eq!(backend.connections_opened(), 2);
    assert_eq!(pool.idle().await, 2);
    assert_eq!(pool.size().await, 2);
}

#[tokio::test]
async fn test_concurrent_acquires_get_distinct_connections() {
    let backend = MockBackend::new();
    let pool = pool(&backend, test_pool_config(4)).await;

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        })
        .collect();

    let mut conns = Vec::new();
    for task in tasks {
        conns.push(task.await.unwrap().unwrap());
    }

    let ids: HashSet<u64> = conns.iter().map(|c| c.id()).collect();
    assert_eq!(ids.len(), 4);
    assert_eq!(pool.borrowed(), 4);
    assert_eq!(
        pool.borrowed_ids().into_iter().collect::<HashSet<_>>(),
        ids
    );

    for conn in conns {
        pool.release(conn).await;
    }
    assert_eq!(pool.borrowed(), 0);
    assert_eq!(pool.idle().await, 4);
}

#[tokio::test]
async fn test_acquire_times_out_when_exhausted() {
    let backend = MockBackend::new();
    let pool = pool(&backend, test_pool_config(1)).await;

    let held = pool.acquire().await.unwrap();
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, Error::PoolExhausted { .. }));
    assert!(err.is_retriable());
    assert_eq!(pool.stats().exhausted_count, 1);

    // the timed-out attempt left no phantom borrow behind
    assert_eq!(pool.borrowed(), 1);
    pool.release(held).await;
    assert_eq!(pool.borrowed(), 0);

    let conn = pool.acquire().await.unwrap();
    pool.release(conn).await;
}

#[tokio::test]
async fn test_waiter_gets_released_connection() {
    let backend = MockBackend::new();
    let pool = pool(
        &backend,
        test_pool_config(1).with_acquire_timeout(Duration::from_secs(5)),
    )
    .await;

    let held = pool.acquire().await.unwrap();
    let held_id = held.id();
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());
    pool.release(held).await;

    let conn = waiter.await.unwrap().unwrap();
    assert_eq!(conn.id(), held_id);
    pool.release(conn).await;
}

#[tokio::test]
async fn test_connect_failure_surfaces_and_frees_slot() {
    let backend = MockBackend::new();
    let pool = pool(&backend, test_pool_config(1)).await;

    backend.set_fail_connect(true);
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, Error::Connection { .. }));
    assert_eq!(pool.borrowed(), 0);

    backend.set_fail_connect(false);
    let conn = pool.acquire().await.unwrap();
    pool.release(conn).await;
}

#[tokio::test]
async fn test_dropped_connection_is_returned() {
    let backend = MockBackend::new();
    let pool = pool(&backend, test_pool_config(1)).await;

    let conn = pool.acquire().await.unwrap();
    drop(conn);

    let conn = pool.acquire().await.unwrap();
    assert_eq!(backend.connections_opened(), 1);
    pool.release(conn).await;
}

#[tokio::test]
async fn test_destroy_closes_connection() {
    let backend = MockBackend::new();
    let pool = pool(&backend, test_pool_config(1)).await;

    let conn = pool.acquire().await.unwrap();
    pool.destroy(conn).await;

    assert_eq!(backend.connections_closed(), 1);
    assert_eq!(pool.idle().await, 0);
    assert_eq!(pool.borrowed(), 0);
}

// ==================== Health Checks ====================

#[tokio::test]
async fn test_validate_never_errors() {
    let backend = MockBackend::new();
    let pool = pool(&backend, test_pool_config(1)).await;

    let conn = pool.acquire().await.unwrap();
    assert!(pool.validate(&*conn).await);

    backend.set_fail_ping(true);
    assert!(!pool.validate(&*conn).await);

    backend.break_session(session_of(&conn).await);
    assert!(!pool.validate(conn.connection()).await);
    pool.release(conn).await;
}

#[tokio::test]
async fn test_failed_validation_discards_idle_connection() {
    let backend = MockBackend::new();
    let pool = pool(&backend, test_pool_config(2)).await;

    let conn = pool.acquire().await.unwrap();
    let stale_id = conn.id();
    pool.release(conn).await;

    backend.set_fail_ping(true);
    let conn = pool.acquire().await.unwrap();
    assert_ne!(conn.id(), stale_id);
    assert_eq!(backend.connections_closed(), 1);
    assert_eq!(pool.stats().health_check_failures, 1);
    pool.release(conn).await;
}

#[tokio::test]
async fn test_no_validation_when_disabled() {
    let backend = MockBackend::new();
    let pool = pool(&backend, test_pool_config(1).with_validate_on_borrow(false)).await;

    let conn = pool.acquire().await.unwrap();
    let id = conn.id();
    pool.release(conn).await;

    backend.set_fail_ping(true);
    let conn = pool.acquire().await.unwrap();
    assert_eq!(conn.id(), id);
    assert!(backend.statements_starting("SELECT 1").is_empty());
    pool.release(conn).await;
}

#[tokio::test]
async fn test_broken_connection_is_not_reused() {
    let backend = MockBackend::new();
    let pool = pool(&backend, test_pool_config(1).with_validate_on_borrow(false)).await;

    let conn = pool.acquire().await.unwrap();
    let id = conn.id();
    backend.break_session(session_of(&conn).await);
    assert!(conn.is_broken());
    pool.release(conn).await;

    assert_eq!(pool.idle().await, 0);
    assert_eq!(backend.connections_closed(), 1);

    let conn = pool.acquire().await.unwrap();
    assert_ne!(conn.id(), id);
    pool.release(conn).await;
}

#[tokio::test]
async fn test_idle_broken_connection_is_skipped() {
    let backend = MockBackend::new();
    let pool = pool(&backend, test_pool_config(1).with_validate_on_borrow(false)).await;

    let conn = pool.acquire().await.unwrap();
    let id = conn.id();
    let session = session_of(&conn).await;
    pool.release(conn).await;

    // fails while sitting idle
    backend.break_session(session);

    let conn = pool.acquire().await.unwrap();
    assert_ne!(conn.id(), id);
    pool.release(conn).await;
}

#[tokio::test]
async fn test_acquire_timeout_during_health_check_closes_connection() {
    let backend = MockBackend::new();
    let pool = pool(&backend, test_pool_config(1)).await;

    let conn = pool.acquire().await.unwrap();
    let stale_id = conn.id();
    pool.release(conn).await;

    // the health check stalls past the acquire timeout
    let ping = backend.gate("SELECT 1");
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, Error::PoolExhausted { .. }));

    assert_eq!(pool.stats().connections_closed, 1);
    tokio::time::timeout(Duration::from_secs(1), async {
        while backend.connections_closed() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(pool.size().await, 0);

    ping.open();
    let conn = pool.acquire().await.unwrap();
    assert_ne!(conn.id(), stale_id);
    pool.release(conn).await;
}

// ==================== Eviction ====================

#[tokio::test(start_paused = true)]
async fn test_evict_idle_respects_min_size() {
    let backend = MockBackend::new();
    let pool = pool(&backend, test_pool_config(4).with_min_size(1)).await;

    let conns = vec![
        pool.acquire().await.unwrap(),
        pool.acquire().await.unwrap(),
        pool.acquire().await.unwrap(),
    ];
    for conn in conns {
        pool.release(conn).await;
    }
    assert_eq!(pool.idle().await, 3);

    tokio::time::advance(Duration::from_secs(10)).await;
    assert_eq!(pool.evict_idle().await, 0);

    tokio::time::advance(Duration::from_secs(21)).await;
    assert_eq!(pool.evict_idle().await, 2);
    assert_eq!(pool.idle().await, 1);
    assert_eq!(pool.stats().evictions, 2);

    // never below min_size
    tokio::time::advance(Duration::from_secs(60)).await;
    assert_eq!(pool.evict_idle().await, 0);
    assert_eq!(pool.size().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_borrowed_connections_count_towards_min_size() {
    let backend = MockBackend::new();
    let pool = pool(&backend, test_pool_config(4).with_min_size(2)).await;

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    let c = pool.acquire().await.unwrap();
    pool.release(a).await;
    pool.release(b).await;

    tokio::time::advance(Duration::from_secs(31)).await;
    // size 3 with one borrowed: one idle connection may go
    assert_eq!(pool.evict_idle().await, 1);
    assert_eq!(pool.size().await, 2);
    pool.release(c).await;
}

#[tokio::test(start_paused = true)]
async fn test_shorter_idle_timeout_wins_above_min_size() {
    let timeouts = [
        (Duration::from_secs(60), Duration::from_secs(5)),
        (Duration::from_secs(5), Duration::from_secs(60)),
    ];
    for (idle_timeout, soft_idle_timeout) in timeouts {
        let backend = MockBackend::new();
        let pool = pool(
            &backend,
            test_pool_config(4)
                .with_min_size(1)
                .with_idle_timeout(idle_timeout)
                .with_soft_idle_timeout(soft_idle_timeout),
        )
        .await;

        let conns = vec![
            pool.acquire().await.unwrap(),
            pool.acquire().await.unwrap(),
            pool.acquire().await.unwrap(),
        ];
        for conn in conns {
            pool.release(conn).await;
        }

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(pool.evict_idle().await, 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(pool.evict_idle().await, 2);

        // the longer timeout does not reach below min_size either
        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(pool.evict_idle().await, 0);
        assert_eq!(pool.size().await, 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_background_evictor_runs() {
    let backend = MockBackend::new();
    let pool = pool(
        &backend,
        test_pool_config(2).with_eviction_interval(Duration::from_secs(10)),
    )
    .await;

    let conn = pool.acquire().await.unwrap();
    pool.release(conn).await;
    assert_eq!(pool.idle().await, 1);

    // expires at 30s, next run at 40s
    tokio::time::sleep(Duration::from_secs(45)).await;
    assert_eq!(pool.idle().await, 0);
    assert_eq!(backend.connections_closed(), 1);
}

// ==================== Drain ====================

#[tokio::test]
async fn test_drain_waits_for_borrowed_connections() {
    let backend = MockBackend::new();
    let pool = pool(&backend, test_pool_config(2)).await;

    let idle = pool.acquire().await.unwrap();
    let busy = pool.acquire().await.unwrap();
    pool.release(idle).await;

    let drain = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.drain().await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!drain.is_finished());
    assert!(pool.is_closed());
    assert!(matches!(pool.acquire().await, Err(Error::PoolClosed)));

    pool.release(busy).await;
    drain.await.unwrap().unwrap();

    assert_eq!(pool.size().await, 0);
    assert_eq!(backend.connections_closed(), 2);
    assert!(matches!(pool.acquire().await, Err(Error::PoolClosed)));
}

#[tokio::test]
async fn test_drain_is_idempotent() {
    let backend = MockBackend::new();
    let pool = pool(&backend, test_pool_config(2).with_min_size(1)).await;

    pool.drain().await.unwrap();
    pool.drain().await.unwrap();

    assert_eq!(backend.connections_closed(), 1);
    assert_eq!(pool.stats().connections_closed, 1);
}

#[tokio::test]
async fn test_drain_wakes_pending_acquire() {
    let backend = MockBackend::new();
    let pool = pool(
        &backend,
        test_pool_config(1).with_acquire_timeout(Duration::from_secs(5)),
    )
    .await;

    let held = pool.acquire().await.unwrap();
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let drain = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.drain().await })
    };

    assert!(matches!(waiter.await.unwrap(), Err(Error::PoolClosed)));
    pool.release(held).await;
    drain.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_drain_waits_for_acquire_in_flight() {
    let backend = MockBackend::new();
    let pool = pool(
        &backend,
        test_pool_config(1).with_acquire_timeout(Duration::from_secs(5)),
    )
    .await;

    let conn = pool.acquire().await.unwrap();
    pool.release(conn).await;

    // the acquire holds its slot while the idle connection is checked
    let ping = backend.gate("SELECT 1");
    let acquire = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire().await })
    };
    ping.wait_entered().await;

    let drain = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.drain().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!drain.is_finished());

    ping.open();
    assert!(matches!(acquire.await.unwrap(), Err(Error::PoolClosed)));
    drain.await.unwrap().unwrap();

    assert_eq!(pool.borrowed(), 0);
    assert_eq!(pool.size().await, 0);
    assert_eq!(backend.connections_closed(), 1);
}
