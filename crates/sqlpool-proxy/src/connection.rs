//! Connection handle: one borrowed driver connection.
//!
//! A [`ConnectionHandle`] exclusively owns a live driver connection for the
//! pool. While borrowed it tracks every statement opened through it, routes
//! driver errors through the [`ErrorClassifier`] and, when armed, watches
//! for leaks. [`ConnectionHandle::close`] tears the borrow down exactly once
//! and always hands the connection back to its pool.
//!
//! ```text
//! pool borrows ──▶ revive_for_reuse ──▶ arm_leak_detection ──▶ statements
//!      ▲                                                            │
//!      │ idle          pool.release_connection ◀── close() ◀────────┘
//!      └─────────────────────────┤
//!                                └── is_broken()? discard
//! ```
//!
//! A released handle stays closed while it sits idle; the pool revives it
//! when it lends it out again, so a late `close()` from the previous
//! borrower cannot release it a second time.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use sqlpool_driver::{
    DriverConnection, DriverError, GeneratedKeys, PrepareOptions, ResultSetShape,
};

use crate::classify::ErrorClassifier;
use crate::config::HandleConfig;
use crate::error::{Error, Result};
use crate::leak::{BorrowSite, LeakDetector, LeakState, LeakTimer};
use crate::lifecycle::{ConnectionLifecycle, ConnectionMetadata};
use crate::registry::StatementRegistry;
use crate::statement::{StatementHandle, StatementKind, StatementShared};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// The pool a handle returns to on close.
pub trait ConnectionPool<C: DriverConnection>: Send + Sync {
    /// Take back a closed handle. Called exactly once per borrow cycle,
    /// after the handle's statements have been closed.
    fn release_connection(&self, connection: Arc<ConnectionHandle<C>>);
}

/// A pooled driver connection lent to one caller at a time.
pub struct ConnectionHandle<C: DriverConnection> {
    id: u64,
    this: Weak<Self>,
    driver: Mutex<C>,
    statements: StatementRegistry<Arc<StatementShared<C>>>,
    closed: AtomicBool,
    broken: AtomicBool,
    created_at: Instant,
    last_access: Mutex<Instant>,
    leak: Mutex<LeakDetector>,
    pool: RwLock<Weak<dyn ConnectionPool<C>>>,
    classifier: Arc<ErrorClassifier>,
}

impl<C: DriverConnection> ConnectionHandle<C> {
    /// Wrap `driver` for `pool` with the default configuration.
    pub fn new<P>(driver: C, pool: &Arc<P>) -> Arc<Self>
    where
        P: ConnectionPool<C> + 'static,
    {
        Self::with_config(driver, pool, &HandleConfig::default())
    }

    /// Wrap `driver` for `pool`.
    pub fn with_config<P>(driver: C, pool: &Arc<P>, config: &HandleConfig) -> Arc<Self>
    where
        P: ConnectionPool<C> + 'static,
    {
        let pool = Arc::downgrade(pool);
        let pool: Weak<dyn ConnectionPool<C>> = pool;
        let now = Instant::now();

        let handle = Arc::new_cyclic(|this| Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            this: this.clone(),
            driver: Mutex::new(driver),
            statements: StatementRegistry::with_capacity(config.statement_capacity),
            closed: AtomicBool::new(false),
            broken: AtomicBool::new(false),
            created_at: now,
            last_access: Mutex::new(now),
            leak: Mutex::new(LeakDetector::new()),
            pool: RwLock::new(pool),
            classifier: config.classifier(),
        });

        tracing::debug!(connection_id = handle.id, "connection handle created");
        handle
    }

    /// Unique connection id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Return the connection to its pool.
    ///
    /// Only the first call of a borrow cycle does anything: it cancels leak
    /// detection, closes every tracked statement newest first, and notifies
    /// the pool. A statement that fails to close does not stop the sweep;
    /// the first failure is returned after the pool has been notified.
    pub fn close(&self) -> Result<()> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        // Releases to the pool on every exit path, unwinding included.
        let release = ReleaseOnDrop { handle: self };

        if self.leak.lock().cancel() {
            tracing::debug!(connection_id = self.id, "leak detection cancelled");
        }

        let mut first_error = None;
        let statements = self.statements.drain_newest_first();
        let swept = statements.len();

        for (statement_id, statement) in statements {
            if let Err(err) = statement.close_driver() {
                let err = self.inspect_error(err);
                tracing::warn!(
                    connection_id = self.id,
                    statement_id = statement_id,
                    error = %err,
                    "failed to close statement during connection teardown"
                );
                if first_error.is_none() {
                    first_error = Some(Error::Cleanup {
                        connection_id: self.id,
                        statement_id,
                        source: err,
                    });
                }
            }
        }

        tracing::debug!(
            connection_id = self.id,
            statements = swept,
            broken = self.is_broken(),
            "connection handle closed"
        );

        drop(release);
        first_error.map_or(Ok(()), Err)
    }

    /// Whether the handle has been returned to the pool.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Rebind a closed handle to a new borrow cycle without reconnecting.
    ///
    /// Clears the closed flag and returns leak detection to `Unarmed`. The
    /// broken flag is left alone. Only the pool's checkout path should call
    /// this, when it lends the handle out again.
    pub fn revive_for_reuse(&self) {
        self.leak.lock().reset();
        self.closed.store(false, Ordering::Release);
        tracing::debug!(connection_id = self.id, "connection handle revived for reuse");
    }

    /// Point the handle at a different pool.
    pub fn reassign_owner<P>(&self, pool: &Arc<P>)
    where
        P: ConnectionPool<C> + 'static,
    {
        let pool = Arc::downgrade(pool);
        let pool: Weak<dyn ConnectionPool<C>> = pool;
        *self.pool.write() = pool;
        tracing::debug!(connection_id = self.id, "connection handle reassigned to new pool");
    }

    fn release_to_pool(&self) {
        let pool = self.pool.read().upgrade();
        match (pool, self.this.upgrade()) {
            (Some(pool), Some(this)) => pool.release_connection(this),
            _ => tracing::warn!(
                connection_id = self.id,
                "owning pool is gone; connection handle not released"
            ),
        }
    }

    // =========================================================================
    // Broken state
    // =========================================================================

    /// Whether the physical connection must be discarded.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Mark the physical connection unusable. Never cleared.
    pub fn mark_broken(&self) {
        if !self.broken.swap(true, Ordering::AcqRel) {
            tracing::debug!(connection_id = self.id, "connection marked broken");
        }
    }

    /// Classify a driver error, marking the connection broken if it is
    /// fatal. The error is returned unchanged.
    pub fn inspect_error(&self, err: DriverError) -> DriverError {
        if self.classifier.classify(&err).is_fatal() && !self.broken.swap(true, Ordering::AcqRel)
        {
            tracing::warn!(
                connection_id = self.id,
                sql_state = ?err.sql_state().map(|s| s.as_str()),
                error = %err,
                "fatal driver error; connection will be discarded"
            );
        }
        err
    }

    // =========================================================================
    // Timestamps
    // =========================================================================

    /// When the handle was created.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the pool last recorded activity.
    #[must_use]
    pub fn last_access(&self) -> Instant {
        *self.last_access.lock()
    }

    /// Record activity at `at`.
    pub fn set_last_access(&self, at: Instant) {
        *self.last_access.lock() = at;
    }

    /// Record activity now.
    pub fn touch(&self) {
        self.set_last_access(Instant::now());
    }

    // =========================================================================
    // Leak detection
    // =========================================================================

    /// Capture the borrow site and schedule a leak report after `threshold`
    /// on `timer`, unless the handle is closed first.
    ///
    /// The captured location is the caller's; pool checkout paths should be
    /// `#[track_caller]` so the application's call site is recorded.
    /// Fails with [`Error::ConnectionClosed`] if the handle is not borrowed.
    #[track_caller]
    pub fn arm_leak_detection(&self, threshold: Duration, timer: &LeakTimer) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed(self.id));
        }
        let site = BorrowSite::capture();
        let location = site.location;
        self.leak.lock().arm(self.id, threshold, site, timer)?;
        tracing::debug!(
            connection_id = self.id,
            threshold = ?threshold,
            borrowed_at = %location,
            "leak detection armed"
        );
        Ok(())
    }

    /// Leak detector state of the current borrow cycle.
    #[must_use]
    pub fn leak_state(&self) -> LeakState {
        self.leak.lock().state()
    }

    /// Where the current borrow started, if leak detection is armed.
    #[must_use]
    pub fn borrow_site(&self) -> Option<Arc<BorrowSite>> {
        self.leak.lock().site()
    }

    // =========================================================================
    // Statement tracking
    // =========================================================================

    /// Track `statement` for closing with the connection.
    ///
    /// Returns `false` without tracking when the handle is closed; a
    /// registration racing with `close()` is dropped, not retried.
    pub fn register_statement(&self, statement: &StatementHandle<C>) -> bool {
        if self.is_closed() {
            return false;
        }
        self.statements
            .register(statement.id(), Arc::clone(statement.shared()));
        tracing::trace!(
            connection_id = self.id,
            statement_id = statement.id(),
            "statement registered"
        );
        true
    }

    /// Stop tracking statement `statement_id`. Unknown ids, and calls made
    /// while the handle is closing, are ignored.
    pub fn unregister_statement(&self, statement_id: u64) {
        if self.is_closed() {
            return;
        }
        if self.statements.unregister(statement_id).is_some() {
            tracing::trace!(
                connection_id = self.id,
                statement_id = statement_id,
                "statement unregistered"
            );
        }
    }

    /// Number of tracked open statements.
    #[must_use]
    pub fn open_statement_count(&self) -> usize {
        self.statements.len()
    }

    /// Ids of tracked open statements in registration order.
    #[must_use]
    pub fn open_statement_ids(&self) -> Vec<u64> {
        self.statements.ids()
    }

    // =========================================================================
    // Statement factories
    // =========================================================================

    /// Create a plain statement.
    pub fn create_statement(&self) -> Result<StatementHandle<C>> {
        self.track(StatementKind::Plain, None, |driver| {
            driver.create_statement(None)
        })
    }

    /// Create a plain statement with a result-set shape.
    pub fn create_statement_with(&self, shape: ResultSetShape) -> Result<StatementHandle<C>> {
        self.track(StatementKind::Plain, None, |driver| {
            driver.create_statement(Some(&shape))
        })
    }

    /// Prepare a parameterized statement.
    pub fn prepare_statement(&self, sql: &str) -> Result<StatementHandle<C>> {
        self.prepare_statement_with(sql, &PrepareOptions::default())
    }

    /// Prepare a parameterized statement with a result-set shape and/or a
    /// generated key request.
    pub fn prepare_statement_with(
        &self,
        sql: &str,
        options: &PrepareOptions,
    ) -> Result<StatementHandle<C>> {
        self.track(StatementKind::Prepared, Some(sql), |driver| {
            driver.prepare_statement(sql, options)
        })
    }

    /// Prepare a statement that returns driver-chosen generated keys.
    pub fn prepare_statement_returning_keys(&self, sql: &str) -> Result<StatementHandle<C>> {
        let options = PrepareOptions::new().generated_keys(GeneratedKeys::Return);
        self.prepare_statement_with(sql, &options)
    }

    /// Prepare a statement returning the generated values of `columns`
    /// (1-based indexes).
    pub fn prepare_statement_with_column_indexes(
        &self,
        sql: &str,
        columns: &[u32],
    ) -> Result<StatementHandle<C>> {
        let options =
            PrepareOptions::new().generated_keys(GeneratedKeys::ColumnIndexes(columns.to_vec()));
        self.prepare_statement_with(sql, &options)
    }

    /// Prepare a statement returning the generated values of the named
    /// columns.
    pub fn prepare_statement_with_column_names(
        &self,
        sql: &str,
        columns: &[&str],
    ) -> Result<StatementHandle<C>> {
        let names = columns.iter().map(|name| (*name).to_string()).collect();
        let options = PrepareOptions::new().generated_keys(GeneratedKeys::ColumnNames(names));
        self.prepare_statement_with(sql, &options)
    }

    /// Prepare a stored procedure call.
    pub fn prepare_call(&self, sql: &str) -> Result<StatementHandle<C>> {
        self.track(StatementKind::Callable, Some(sql), |driver| {
            driver.prepare_call(sql, None)
        })
    }

    /// Prepare a stored procedure call with a result-set shape.
    pub fn prepare_call_with(&self, sql: &str, shape: ResultSetShape) -> Result<StatementHandle<C>> {
        self.track(StatementKind::Callable, Some(sql), |driver| {
            driver.prepare_call(sql, Some(&shape))
        })
    }

    fn track(
        &self,
        kind: StatementKind,
        sql: Option<&str>,
        open: impl FnOnce(&mut C) -> std::result::Result<C::Statement, DriverError>,
    ) -> Result<StatementHandle<C>> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed(self.id));
        }

        let opened = {
            let mut driver = self.driver.lock();
            open(&mut *driver)
        };
        let opened = opened.map_err(|err| Error::Driver(self.inspect_error(err)))?;

        let statement = StatementHandle::new(
            kind,
            sql.map(str::to_string),
            opened,
            self.id,
            self.this.clone(),
        );

        if !self.register_statement(&statement) {
            tracing::debug!(
                connection_id = self.id,
                statement_id = statement.id(),
                "connection closed while statement was created; statement not tracked"
            );
        }

        Ok(statement)
    }

    // =========================================================================
    // Driver passthrough
    // =========================================================================

    /// Run `f` against the driver connection. Driver errors are classified.
    pub fn with_driver<R>(
        &self,
        f: impl FnOnce(&mut C) -> std::result::Result<R, DriverError>,
    ) -> Result<R> {
        let mut driver = self.driver.lock();
        f(&mut *driver).map_err(|err| Error::Driver(self.inspect_error(err)))
    }

    /// Current auto-commit mode.
    pub fn auto_commit(&self) -> Result<bool> {
        self.with_driver(|driver| driver.auto_commit())
    }

    /// Change auto-commit mode.
    pub fn set_auto_commit(&self, enabled: bool) -> Result<()> {
        self.with_driver(|driver| driver.set_auto_commit(enabled))
    }

    /// Commit the current transaction.
    pub fn commit(&self) -> Result<()> {
        self.with_driver(|driver| driver.commit())
    }

    /// Roll back the current transaction.
    pub fn rollback(&self) -> Result<()> {
        self.with_driver(|driver| driver.rollback())
    }

    /// Snapshot of the handle's state.
    #[must_use]
    pub fn metadata(&self) -> ConnectionMetadata {
        ConnectionMetadata {
            id: self.id,
            created_at: self.created_at,
            last_access: self.last_access(),
            open_statements: self.open_statement_count(),
            closed: self.is_closed(),
            broken: self.is_broken(),
            leak_state: self.leak_state(),
        }
    }
}

/// Notifies the pool when dropped.
struct ReleaseOnDrop<'a, C: DriverConnection> {
    handle: &'a ConnectionHandle<C>,
}

impl<C: DriverConnection> Drop for ReleaseOnDrop<'_, C> {
    fn drop(&mut self) {
        self.handle.release_to_pool();
    }
}

impl<C: DriverConnection> ConnectionLifecycle for ConnectionHandle<C> {
    fn id(&self) -> u64 {
        self.id
    }

    fn created_at(&self) -> Instant {
        self.created_at
    }

    fn last_access(&self) -> Instant {
        ConnectionHandle::last_access(self)
    }

    fn set_last_access(&self, at: Instant) {
        ConnectionHandle::set_last_access(self, at);
    }

    fn is_closed(&self) -> bool {
        ConnectionHandle::is_closed(self)
    }

    fn is_broken(&self) -> bool {
        ConnectionHandle::is_broken(self)
    }

    fn mark_broken(&self) {
        ConnectionHandle::mark_broken(self);
    }

    fn revive_for_reuse(&self) {
        ConnectionHandle::revive_for_reuse(self);
    }

    fn leak_state(&self) -> LeakState {
        ConnectionHandle::leak_state(self)
    }

    fn metadata(&self) -> ConnectionMetadata {
        ConnectionHandle::metadata(self)
    }
}

impl<C: DriverConnection> fmt::Debug for ConnectionHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .field("broken", &self.is_broken())
            .field("open_statements", &self.open_statement_count())
            .field("leak_state", &self.leak_state())
            .finish_non_exhaustive()
    }
}
