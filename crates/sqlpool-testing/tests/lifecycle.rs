//! Connection lifecycle scenarios across driver, proxy and pool.
//!
//! These tests drive `ConnectionHandle` through whole borrow cycles against
//! the scripted mock driver and a recording pool. Leak detection tests run
//! on a paused tokio clock.
//!
//! ```bash
//! RUST_LOG=debug cargo test -p sqlpool-testing --test lifecycle
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Barrier, Once};
use std::thread;
use std::time::Duration;

use sqlpool_driver::{DriverConnection, DriverError};
use sqlpool_proxy::{Error, HandleConfig, LeakState, LeakTimer};
use sqlpool_testing::mock::{DriverEvent, MockConnection};
use sqlpool_testing::{ChannelLeakReporter, RecordingPool};
use tokio::runtime::Handle;

static TRACING_INIT: Once = Once::new();

fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

async fn settle(duration: Duration) {
    tokio::time::sleep(duration).await;
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
}

fn sql_error(code: &str) -> DriverError {
    DriverError::new("driver failure").with_sql_state(code)
}

// =============================================================================
// Teardown
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_close_sweeps_statements_and_releases_once() {
    init_tracing();
    let (reporter, mut leaks) = ChannelLeakReporter::new();
    let timer = LeakTimer::with_reporter(Handle::current(), reporter);
    let config = HandleConfig::new().leak_detection_threshold(Duration::from_secs(10));
    let pool = RecordingPool::with_config(config, timer);

    let driver = MockConnection::new();
    let journal = driver.journal();
    let id = pool.add_idle(driver);

    let conn = pool.borrow().unwrap().unwrap();
    assert_eq!(conn.leak_state(), LeakState::Armed);

    let a = conn.prepare_statement("A").unwrap();
    let b = conn.prepare_statement("B").unwrap();
    let c = conn.prepare_statement("C").unwrap();
    assert_eq!(conn.open_statement_ids(), vec![a.id(), b.id(), c.id()]);

    conn.close().unwrap();
    conn.close().unwrap();

    assert_eq!(journal.closed_statements(), vec!["C", "B", "A"]);
    assert!(a.is_closed() && b.is_closed() && c.is_closed());

    let releases = pool.releases_of(id);
    assert_eq!(releases.len(), 1);
    assert_eq!(releases[0].open_statements, 0);
    assert_eq!(releases[0].leak_state, LeakState::Cancelled);
    assert!(!releases[0].broken);

    settle(Duration::from_secs(60)).await;
    assert!(leaks.try_recv().is_err());
}

#[test]
fn test_statement_closed_by_caller_is_not_closed_again() {
    let pool = RecordingPool::new();
    let driver = MockConnection::new();
    let journal = driver.journal();
    let conn = pool.connect(driver);

    let a = conn.prepare_statement("A").unwrap();
    conn.prepare_call("{call B}").unwrap();
    a.close().unwrap();
    assert_eq!(conn.open_statement_count(), 1);

    conn.close().unwrap();
    a.close().unwrap();

    assert_eq!(journal.closed_statements(), vec!["A", "{call B}"]);
}

#[test]
fn test_concurrent_close_releases_once() {
    const THREADS: usize = 8;

    let pool = RecordingPool::new();
    let driver = MockConnection::new();
    let journal = driver.journal();
    let conn = pool.connect(driver);
    for i in 0..16 {
        conn.prepare_statement(&format!("SELECT {i}")).unwrap();
    }

    let barrier = Arc::new(Barrier::new(THREADS));
    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let conn = Arc::clone(&conn);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                conn.close()
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap().unwrap();
    }

    assert_eq!(pool.release_count(), 1);
    assert_eq!(journal.close_attempts().len(), 16);
    assert_eq!(conn.open_statement_count(), 0);
}

#[test]
fn test_concurrent_close_on_recycling_pool_lends_handle_once() {
    const THREADS: usize = 8;

    let pool = RecordingPool::recycling();
    let driver = MockConnection::new();
    let journal = driver.journal();
    pool.add_idle(driver);

    let conn = pool.borrow().unwrap().unwrap();
    for i in 0..4 {
        conn.prepare_statement(&format!("SELECT {i}")).unwrap();
    }

    let barrier = Arc::new(Barrier::new(THREADS));
    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let conn = Arc::clone(&conn);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                conn.close()
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap().unwrap();
    }

    // A late close from the same borrower is still a no-op.
    conn.close().unwrap();

    assert_eq!(pool.release_count(), 1);
    assert_eq!(pool.idle_count(), 1);
    assert_eq!(journal.close_attempts().len(), 4);
    assert!(conn.is_closed());

    let next = pool.borrow().unwrap().unwrap();
    assert!(Arc::ptr_eq(&conn, &next));
    assert!(!next.is_closed());
    assert!(pool.borrow().unwrap().is_none());
}

#[test]
fn test_cleanup_failure_is_reported_after_release() {
    let pool = RecordingPool::new();
    let driver = MockConnection::new();
    let journal = driver.journal();
    journal.fail_close("B", sql_error("HY000"));
    let conn = pool.connect(driver);

    conn.prepare_statement("A").unwrap();
    let b = conn.prepare_statement("B").unwrap();
    conn.prepare_statement("C").unwrap();

    let err = conn.close().unwrap_err();
    assert!(matches!(
        err,
        Error::Cleanup { statement_id, .. } if statement_id == b.id()
    ));
    assert_eq!(journal.close_attempts(), vec!["C", "B", "A"]);
    assert_eq!(pool.release_count(), 1);
    assert!(!conn.is_broken());

    // A second close is a no-op, not a second failure.
    assert!(conn.close().is_ok());
}

#[test]
fn test_panicking_statement_close_still_releases() {
    let pool = RecordingPool::new();
    let driver = MockConnection::new();
    let journal = driver.journal();
    journal.panic_on_close("B");
    let conn = pool.connect(driver);

    conn.prepare_statement("A").unwrap();
    conn.prepare_statement("B").unwrap();

    let outcome = catch_unwind(AssertUnwindSafe(|| conn.close()));
    assert!(outcome.is_err());
    assert!(conn.is_closed());
    assert_eq!(pool.release_count(), 1);
}

#[test]
fn test_dropped_pool_is_tolerated() {
    let pool = RecordingPool::new();
    let driver = MockConnection::new();
    let journal = driver.journal();
    let conn = pool.connect(driver);
    conn.prepare_statement("A").unwrap();
    drop(pool);

    conn.close().unwrap();
    assert!(conn.is_closed());
    assert_eq!(journal.closed_statements(), vec!["A"]);
}

#[test]
fn test_closed_handle_rejects_new_statements() {
    let pool = RecordingPool::new();
    let driver = MockConnection::new();
    let journal = driver.journal();
    let conn = pool.connect(driver);
    conn.close().unwrap();

    assert!(matches!(
        conn.create_statement(),
        Err(Error::ConnectionClosed(_))
    ));
    assert!(matches!(
        conn.prepare_statement("SELECT 1"),
        Err(Error::ConnectionClosed(_))
    ));
    assert!(journal.events().is_empty());
}

// =============================================================================
// Fatal error classification
// =============================================================================

#[test]
fn test_fatal_errors_cause_discard() {
    for code in ["08001", "08S01", "57P01", "57P02", "57P03", "01002"] {
        let pool = RecordingPool::recycling();
        let driver = MockConnection::new();
        let journal = driver.journal();
        pool.add_idle(driver);

        let conn = pool.borrow().unwrap().unwrap();
        journal.fail_next_call(sql_error(code));
        assert!(conn.rollback().is_err());
        assert!(conn.is_broken(), "{code} should be fatal");

        conn.close().unwrap();
        assert_eq!(pool.discarded(), vec![conn.id()], "{code}");
        assert_eq!(pool.idle_count(), 0);
    }
}

#[test]
fn test_non_fatal_errors_keep_connection() {
    let pool = RecordingPool::recycling();
    let driver = MockConnection::new();
    let journal = driver.journal();
    pool.add_idle(driver);

    let conn = pool.borrow().unwrap().unwrap();
    for code in ["42000", "23505", "HY000", "57P04"] {
        journal.fail_next_call(sql_error(code));
        let err = conn.commit().unwrap_err();
        assert_eq!(err.sql_state().map(|s| s.as_str()), Some(code));
    }
    journal.fail_next_call(DriverError::new("no sqlstate"));
    assert!(conn.set_auto_commit(false).is_err());

    assert!(!conn.is_broken());
    conn.close().unwrap();
    assert!(pool.discarded().is_empty());
    assert_eq!(pool.idle_count(), 1);
}

#[test]
fn test_fatal_error_through_statement_marks_connection() {
    let pool = RecordingPool::new();
    let conn = pool.connect(MockConnection::new());
    let stmt = conn.prepare_statement("SELECT 1").unwrap();

    let err = stmt
        .with_driver(|_| Err::<(), _>(sql_error("08003")))
        .unwrap_err();
    assert!(err.is_driver());
    assert!(conn.is_broken());

    conn.close().unwrap();
    assert!(pool.releases()[0].broken);
}

#[test]
fn test_configured_vendor_codes_are_fatal() {
    let config = HandleConfig::from_config_string("fatalSqlStates=HY000").unwrap();
    let timer_runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    let timer = LeakTimer::new(timer_runtime.handle().clone());
    let pool = RecordingPool::with_config(config, timer);

    let driver = MockConnection::new();
    let journal = driver.journal();
    pool.add_idle(driver);
    let conn = pool.borrow().unwrap().unwrap();
    assert_eq!(conn.leak_state(), LeakState::Unarmed);

    journal.fail_next_call(sql_error("HY000"));
    assert!(conn.commit().is_err());
    assert!(conn.is_broken());
}

// =============================================================================
// Leak detection
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_leak_reported_once_with_borrow_site() {
    init_tracing();
    let (reporter, mut leaks) = ChannelLeakReporter::new();
    let timer = LeakTimer::with_reporter(Handle::current(), reporter);
    let config = HandleConfig::new().leak_detection_threshold(Duration::from_secs(2));
    let pool = RecordingPool::with_config(config, timer);
    let id = pool.add_idle(MockConnection::new());

    let conn = pool.borrow().unwrap().unwrap();

    settle(Duration::from_secs(1)).await;
    assert!(leaks.try_recv().is_err());

    settle(Duration::from_secs(2)).await;
    let report = leaks.try_recv().unwrap();
    assert_eq!(report.connection_id, id);
    assert_eq!(report.threshold, Duration::from_secs(2));
    assert!(report.site.location.file().ends_with("lifecycle.rs"));
    assert_eq!(conn.leak_state(), LeakState::Fired);

    settle(Duration::from_secs(10)).await;
    assert!(leaks.try_recv().is_err());

    // Firing does not close or break the connection.
    assert!(!conn.is_closed());
    assert!(!conn.is_broken());
    conn.close().unwrap();
    assert_eq!(pool.releases()[0].leak_state, LeakState::Fired);
}

#[tokio::test(start_paused = true)]
async fn test_reuse_rearms_leak_detection() {
    let (reporter, mut leaks) = ChannelLeakReporter::new();
    let timer = LeakTimer::with_reporter(Handle::current(), reporter);
    let config = HandleConfig::new().leak_detection_threshold(Duration::from_secs(5));
    let pool = RecordingPool::with_config(config, timer);
    pool.add_idle(MockConnection::new());

    let first = pool.borrow().unwrap().unwrap();
    settle(Duration::from_secs(1)).await;
    first.close().unwrap();
    assert!(first.is_closed());
    assert_eq!(first.leak_state(), LeakState::Cancelled);

    let second = pool.borrow().unwrap().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(second.leak_state(), LeakState::Armed);

    settle(Duration::from_secs(6)).await;
    let report = leaks.try_recv().unwrap();
    assert_eq!(report.connection_id, second.id());
    assert!(leaks.try_recv().is_err());

    second.close().unwrap();
    let states: Vec<_> = pool.releases().iter().map(|r| r.leak_state).collect();
    assert_eq!(states, vec![LeakState::Cancelled, LeakState::Fired]);
}

#[tokio::test(start_paused = true)]
async fn test_timer_shutdown_stops_pending_reports() {
    let (reporter, mut leaks) = ChannelLeakReporter::new();
    let timer = LeakTimer::with_reporter(Handle::current(), reporter);
    let config = HandleConfig::new().leak_detection_threshold(Duration::from_secs(1));
    let pool = RecordingPool::with_config(config, timer.clone());
    pool.add_idle(MockConnection::new());
    pool.add_idle(MockConnection::new());

    let _held = pool.borrow().unwrap().unwrap();
    timer.shutdown();
    settle(Duration::from_secs(5)).await;
    assert!(leaks.try_recv().is_err());

    assert!(matches!(pool.borrow(), Err(Error::TimerShutdown)));
}

// =============================================================================
// Driver passthrough
// =============================================================================

#[test]
fn test_transaction_passthrough() {
    let pool = RecordingPool::new();
    let driver = MockConnection::new();
    let journal = driver.journal();
    let conn = pool.connect(driver);

    conn.set_auto_commit(false).unwrap();
    conn.prepare_statement_returning_keys("INSERT INTO t VALUES (?)")
        .unwrap();
    conn.commit().unwrap();
    assert!(!conn.with_driver(|driver| driver.auto_commit()).unwrap());
    conn.close().unwrap();

    let events = journal.events();
    assert_eq!(events[0], DriverEvent::AutoCommitSet(false));
    assert!(matches!(events[1], DriverEvent::StatementPrepared { .. }));
    assert_eq!(events[2], DriverEvent::Commit);
    assert!(matches!(events[3], DriverEvent::StatementClosed { .. }));
    assert!(!events.contains(&DriverEvent::ConnectionClosed));
}
