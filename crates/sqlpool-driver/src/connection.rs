//! Driver connection and statement traits.

use crate::error::DriverError;
use crate::options::{PrepareOptions, ResultSetShape};

/// A live connection to a database, owned by exactly one proxy at a time.
///
/// Implementations are driven by one caller at a time; the proxy serializes
/// access, so methods take `&mut self`.
pub trait DriverConnection: Send + 'static {
    /// Statement-like resource opened by this connection.
    type Statement: DriverStatement;

    /// Create a plain statement.
    fn create_statement(
        &mut self,
        shape: Option<&ResultSetShape>,
    ) -> Result<Self::Statement, DriverError>;

    /// Prepare a parameterized statement.
    fn prepare_statement(
        &mut self,
        sql: &str,
        options: &PrepareOptions,
    ) -> Result<Self::Statement, DriverError>;

    /// Prepare a stored procedure call.
    fn prepare_call(
        &mut self,
        sql: &str,
        shape: Option<&ResultSetShape>,
    ) -> Result<Self::Statement, DriverError>;

    /// Current auto-commit mode.
    fn auto_commit(&self) -> Result<bool, DriverError>;

    /// Change auto-commit mode.
    fn set_auto_commit(&mut self, enabled: bool) -> Result<(), DriverError>;

    /// Commit the current transaction.
    fn commit(&mut self) -> Result<(), DriverError>;

    /// Roll back the current transaction.
    fn rollback(&mut self) -> Result<(), DriverError>;

    /// Close the physical connection.
    fn close(&mut self) -> Result<(), DriverError>;
}

/// A statement-like resource opened against a [`DriverConnection`].
pub trait DriverStatement: Send + 'static {
    /// Release the statement and any server-side resources.
    fn close(&mut self) -> Result<(), DriverError>;
}
