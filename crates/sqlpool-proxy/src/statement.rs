//! Statement handles bound to a connection handle.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use sqlpool_driver::{DriverConnection, DriverError, DriverStatement};

use crate::connection::ConnectionHandle;
use crate::error::{Error, Result};

static NEXT_STATEMENT_ID: AtomicU64 = AtomicU64::new(1);

/// Kind of statement a handle wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// Plain statement.
    Plain,
    /// Parameterized (prepared) statement.
    Prepared,
    /// Stored procedure call.
    Callable,
}

pub(crate) struct StatementShared<C: DriverConnection> {
    id: u64,
    connection_id: u64,
    kind: StatementKind,
    sql: Option<String>,
    driver: Mutex<C::Statement>,
    closed: AtomicBool,
    connection: Weak<ConnectionHandle<C>>,
}

impl<C: DriverConnection> StatementShared<C> {
    /// Close the driver statement if this is the first close.
    ///
    /// Returns `Ok(false)` when the statement was already closed.
    pub(crate) fn close_driver(&self) -> std::result::Result<bool, DriverError> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }
        self.driver.lock().close()?;
        Ok(true)
    }
}

/// A statement opened through a [`ConnectionHandle`].
///
/// Clones share the same underlying statement. Closing it unregisters it
/// from the owning connection; statements still open when the connection
/// closes are closed by the connection.
pub struct StatementHandle<C: DriverConnection> {
    shared: Arc<StatementShared<C>>,
}

impl<C: DriverConnection> StatementHandle<C> {
    pub(crate) fn new(
        kind: StatementKind,
        sql: Option<String>,
        statement: C::Statement,
        connection_id: u64,
        connection: Weak<ConnectionHandle<C>>,
    ) -> Self {
        Self {
            shared: Arc::new(StatementShared {
                id: NEXT_STATEMENT_ID.fetch_add(1, Ordering::Relaxed),
                connection_id,
                kind,
                sql,
                driver: Mutex::new(statement),
                closed: AtomicBool::new(false),
                connection,
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<StatementShared<C>> {
        &self.shared
    }

    /// Unique statement id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Id of the owning connection.
    #[must_use]
    pub fn connection_id(&self) -> u64 {
        self.shared.connection_id
    }

    /// Statement kind.
    #[must_use]
    pub fn kind(&self) -> StatementKind {
        self.shared.kind
    }

    /// SQL text; `None` for plain statements.
    #[must_use]
    pub fn sql(&self) -> Option<&str> {
        self.shared.sql.as_deref()
    }

    /// Whether the statement has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// The owning connection, while it is alive.
    #[must_use]
    pub fn connection(&self) -> Option<Arc<ConnectionHandle<C>>> {
        self.shared.connection.upgrade()
    }

    /// Run `f` against the driver statement.
    ///
    /// Driver errors are classified against the owning connection.
    pub fn with_driver<R>(
        &self,
        f: impl FnOnce(&mut C::Statement) -> std::result::Result<R, DriverError>,
    ) -> Result<R> {
        if self.is_closed() {
            return Err(Error::StatementClosed(self.id()));
        }
        let mut statement = self.shared.driver.lock();
        f(&mut *statement).map_err(|err| Error::Driver(self.classify(err)))
    }

    /// Close the statement and unregister it from its connection.
    ///
    /// Closing an already closed statement does nothing.
    pub fn close(&self) -> Result<()> {
        let outcome = self.shared.close_driver();

        if let Some(connection) = self.shared.connection.upgrade() {
            connection.unregister_statement(self.id());
        }

        match outcome {
            Ok(true) => {
                tracing::trace!(
                    connection_id = self.connection_id(),
                    statement_id = self.id(),
                    "statement closed"
                );
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(err) => Err(Error::Driver(self.classify(err))),
        }
    }

    fn classify(&self, err: DriverError) -> DriverError {
        match self.shared.connection.upgrade() {
            Some(connection) => connection.inspect_error(err),
            None => err,
        }
    }
}

impl<C: DriverConnection> Clone for StatementHandle<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: DriverConnection> fmt::Debug for StatementHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatementHandle")
            .field("id", &self.id())
            .field("connection_id", &self.connection_id())
            .field("kind", &self.kind())
            .field("sql", &self.sql())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use sqlpool_driver::mock::{MockConnection, MockStatement};

    fn detached(label: &str) -> (StatementHandle<MockConnection>, MockConnection) {
        let mut conn = MockConnection::new();
        let stmt: MockStatement = conn
            .prepare_statement(label, &Default::default())
            .unwrap();
        (
            StatementHandle::new(
                StatementKind::Prepared,
                Some(label.to_string()),
                stmt,
                0,
                Weak::new(),
            ),
            conn,
        )
    }

    #[test]
    fn test_close_is_idempotent() {
        let (stmt, conn) = detached("SELECT 1");
        stmt.close().unwrap();
        stmt.close().unwrap();

        assert!(stmt.is_closed());
        assert_eq!(conn.journal().closed_statements(), vec!["SELECT 1"]);
    }

    #[test]
    fn test_with_driver_after_close() {
        let (stmt, _conn) = detached("SELECT 2");
        assert_eq!(stmt.with_driver(|s| Ok(s.label().len())).unwrap(), 8);

        stmt.close().unwrap();
        let err = stmt.with_driver(|_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::StatementClosed(id) if id == stmt.id()));
    }

    #[test]
    fn test_clones_share_state() {
        let (stmt, _conn) = detached("SELECT 3");
        let clone = stmt.clone();
        clone.close().unwrap();
        assert!(stmt.is_closed());
        assert_eq!(stmt.id(), clone.id());
    }

    #[test]
    fn test_detached_error_is_returned_unchanged() {
        let (stmt, conn) = detached("SELECT 4");
        conn.journal()
            .fail_close("SELECT 4", DriverError::new("gone").with_sql_state("08006"));

        let err = stmt.close().unwrap_err();
        assert_eq!(err.sql_state().map(|s| s.as_str()), Some("08006"));
    }
}
