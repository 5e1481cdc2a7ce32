//! Proxy error types.

use sqlpool_driver::{DriverError, SqlState};
use thiserror::Error;

use crate::leak::LeakState;

/// Errors raised by connection and statement handles.
#[derive(Debug, Error)]
pub enum Error {
    /// A delegated driver call failed. The error has already been
    /// classified against the owning connection.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    /// Closing a tracked statement failed during connection teardown.
    ///
    /// Only the first failure of a teardown is reported; the sweep always
    /// completes and the pool is always notified before this is returned.
    #[error("failed to close statement {statement_id} of connection {connection_id}: {source}")]
    Cleanup {
        /// Connection being closed.
        connection_id: u64,
        /// Statement whose close failed.
        statement_id: u64,
        /// Driver error raised by the statement close.
        #[source]
        source: DriverError,
    },

    /// The connection handle has already been returned to the pool.
    #[error("connection {0} is closed")]
    ConnectionClosed(u64),

    /// The statement handle has already been closed.
    #[error("statement {0} is closed")]
    StatementClosed(u64),

    /// Leak detection can only be armed once per borrow cycle.
    #[error("leak detection for connection {connection_id} is already {state}")]
    LeakDetection {
        /// Connection whose detector was armed again.
        connection_id: u64,
        /// Current detector state.
        state: LeakState,
    },

    /// The shared leak timer has been shut down.
    #[error("leak detection timer has been shut down")]
    TimerShutdown,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error came from a driver call.
    #[must_use]
    pub fn is_driver(&self) -> bool {
        matches!(self, Self::Driver(_) | Self::Cleanup { .. })
    }

    /// The SQLSTATE of the underlying driver error, if any.
    #[must_use]
    pub fn sql_state(&self) -> Option<&SqlState> {
        match self {
            Self::Driver(err) | Self::Cleanup { source: err, .. } => err.sql_state(),
            _ => None,
        }
    }
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, Error>;
