//! # sqlpool-proxy
//!
//! Lifecycle proxy for pooled database connections.
//!
//! A pool lends out [`ConnectionHandle`]s instead of raw driver
//! connections. The handle keeps the physical connection safe to recycle:
//!
//! - Every statement opened through the handle is tracked and closed,
//!   newest first, when the handle is closed
//! - Driver errors are classified by SQLSTATE; a fatal error marks the
//!   connection broken so the pool discards it instead of recycling it
//! - An optional leak detector reports, once, a connection held longer than
//!   a threshold together with the site that borrowed it
//! - `close()` is idempotent and always notifies the pool exactly once per
//!   borrow cycle, even if a statement fails to close
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use sqlpool_proxy::{ConnectionHandle, ConnectionPool, HandleConfig, LeakTimer};
//!
//! struct MyPool { /* idle list, ... */ }
//!
//! impl ConnectionPool<MyDriverConnection> for MyPool {
//!     fn release_connection(&self, conn: Arc<ConnectionHandle<MyDriverConnection>>) {
//!         if conn.is_broken() {
//!             // drop it and open a replacement
//!         } else {
//!             // push back onto the idle list, still closed
//!         }
//!     }
//! }
//!
//! let config = HandleConfig::from_config_string("leakDetectionThreshold=30000")?;
//! let timer = LeakTimer::new(tokio::runtime::Handle::current());
//!
//! // Checkout: take an idle handle (or wrap a new driver connection) and
//! // revive it for the new borrow cycle.
//! let conn = ConnectionHandle::with_config(driver, &pool, &config);
//! conn.revive_for_reuse();
//! if let Some(threshold) = config.leak_detection_threshold {
//!     conn.arm_leak_detection(threshold, &timer)?;
//! }
//!
//! let stmt = conn.prepare_statement("SELECT * FROM users WHERE id = ?")?;
//! // use stmt...
//! conn.close()?; // closes stmt, returns the connection to the pool
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod classify;
pub mod config;
pub mod connection;
pub mod error;
pub mod leak;
pub mod lifecycle;
pub mod registry;
pub mod statement;

// Configuration
pub use config::HandleConfig;

// Error types
pub use error::{Error, Result};

// Connection and statement handles
pub use connection::{ConnectionHandle, ConnectionPool};
pub use statement::{StatementHandle, StatementKind};

// Error classification
pub use classify::{Disposition, ErrorClassifier, FATAL_SQL_STATE_CLASSES, FATAL_SQL_STATES};

// Leak detection
pub use leak::{
    BorrowSite, LeakDetector, LeakReport, LeakReporter, LeakState, LeakTimer,
    TracingLeakReporter,
};

// Lifecycle management
pub use lifecycle::{ConnectionLifecycle, ConnectionMetadata, DynConnectionLifecycle};

pub use registry::{DEFAULT_STATEMENT_CAPACITY, StatementRegistry};
