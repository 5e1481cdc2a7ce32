//! # sqlpool-driver
//!
//! The driver surface consumed by the sqlpool connection proxy.
//!
//! A database driver plugs into the pool by implementing
//! [`DriverConnection`] for its live connection type and
//! [`DriverStatement`] for the statement-like resources that connection
//! opens. Every fallible operation reports a [`DriverError`], which may
//! carry a standardized five-character [`SqlState`] used by the proxy to
//! decide whether the physical connection is still usable.
//!
//! ## Features
//!
//! - `test-utils`: a scripted in-memory driver ([`mock`]) with failure
//!   injection and a shared journal of every driver call.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod connection;
pub mod error;
#[cfg(feature = "test-utils")]
pub mod mock;
pub mod options;

pub use connection::{DriverConnection, DriverStatement};
pub use error::{DriverError, SqlState};
pub use options::{
    GeneratedKeys, Holdability, PrepareOptions, ResultSetConcurrency, ResultSetShape,
    ResultSetType,
};
