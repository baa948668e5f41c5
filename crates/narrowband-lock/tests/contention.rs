//! Async contention tests for the game lock registry.
//!
//! Time is paused, so polling sleeps resolve as soon as every task is
//! idle and multi-second ceilings cost nothing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use narrowband_lock::{GameLocks, LockConfig, LockError, LockMode, OnTimeout, OwnerId};
use narrowband_protocol::RowId;

const ROW: RowId = RowId(42);

fn locks() -> GameLocks {
    GameLocks::new(LockConfig {
        poll_interval: Duration::from_millis(10),
        deadlock_ceiling: Duration::from_secs(5),
        ..LockConfig::default()
    })
}

#[tokio::test(start_paused = true)]
async fn test_acquire_waits_for_holder_to_release() {
    let locks = locks();
    let held = locks.try_acquire(ROW, OwnerId::new(), LockMode::Write).unwrap();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        drop(held);
    });

    let got = locks
        .acquire(ROW, OwnerId::new(), LockMode::Write, Duration::from_secs(1), OnTimeout::Error)
        .await
        .unwrap();
    assert!(got.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_acquire_bounded_timeout_follows_policy() {
    let locks = locks();
    let _held = locks.try_acquire(ROW, OwnerId::new(), LockMode::Write).unwrap();
    let me = OwnerId::new();

    let none = locks
        .acquire(ROW, me, LockMode::Read, Duration::from_millis(200), OnTimeout::ReturnNone)
        .await
        .unwrap();
    assert!(none.is_none());

    let err = locks
        .acquire(ROW, me, LockMode::Read, Duration::from_millis(200), OnTimeout::Error)
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(err, LockError::Locked(ROW)));
}

#[tokio::test(start_paused = true)]
async fn test_acquire_bounded_wait_is_clamped() {
    let locks = locks();
    let _held = locks.try_acquire(ROW, OwnerId::new(), LockMode::Write).unwrap();

    let start = tokio::time::Instant::now();
    let got = locks
        .acquire(ROW, OwnerId::new(), LockMode::Write, Duration::from_secs(30), OnTimeout::ReturnNone)
        .await
        .unwrap();

    assert!(got.is_none());
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_acquire_unbounded_reports_deadlock_past_ceiling() {
    let locks = locks();
    let _held = locks.try_acquire(ROW, OwnerId::new(), LockMode::Write).unwrap();

    let err = locks
        .acquire(ROW, OwnerId::new(), LockMode::Write, Duration::ZERO, OnTimeout::Error)
        .await
        .unwrap_err();

    assert!(!err.is_retryable());
    match err {
        LockError::Deadlock { row, waited } => {
            assert_eq!(row, ROW);
            assert!(waited >= Duration::from_secs(5));
        }
        other => panic!("expected deadlock, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_wait_leaves_table_unchanged() {
    let locks = locks();
    let holder = OwnerId::new();
    let _held = locks.try_acquire(ROW, holder, LockMode::Write).unwrap();

    let waiter = locks.acquire(ROW, OwnerId::new(), LockMode::Write, Duration::ZERO, OnTimeout::Error);
    let abandoned = tokio::time::timeout(Duration::from_millis(100), waiter).await;

    assert!(abandoned.is_err());
    assert_eq!(locks.holder(ROW), Some((holder, LockMode::Write, 1)));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_writers_never_overlap() {
    let locks = locks();
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let locks = locks.clone();
        let inside = Arc::clone(&inside);
        let max_inside = Arc::clone(&max_inside);
        tasks.push(tokio::spawn(async move {
            let lock = locks
                .acquire(ROW, OwnerId::new(), LockMode::Write, Duration::ZERO, OnTimeout::Error)
                .await
                .unwrap()
                .unwrap();
            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
            max_inside.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            inside.fetch_sub(1, Ordering::SeqCst);
            drop(lock);
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }

    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    assert!(!locks.is_locked(ROW));
}

#[tokio::test(start_paused = true)]
async fn test_n_reentrant_reads_need_n_releases() {
    let locks = locks();
    let owner = OwnerId::new();
    let mut guards = Vec::new();
    for _ in 0..4 {
        let g = locks
            .acquire(ROW, owner, LockMode::Read, Duration::from_millis(50), OnTimeout::Error)
            .await
            .unwrap()
            .unwrap();
        guards.push(g);
    }
    assert_eq!(locks.holder(ROW), Some((owner, LockMode::Read, 4)));

    while let Some(g) = guards.pop() {
        assert!(locks.is_locked(ROW));
        g.release().unwrap();
    }
    assert!(!locks.is_locked(ROW));
}
