//! Driver-level error types.

use std::fmt;

use thiserror::Error;

/// A standardized five-character SQLSTATE code reported by a driver.
///
/// The code is stored exactly as the driver reported it; comparisons that
/// need to be case-insensitive should upper-case a copy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SqlState(String);

impl SqlState {
    /// Wrap a code as reported by the driver.
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    /// The code as reported.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The two-character class prefix (`"08"` for connection exceptions).
    ///
    /// Codes shorter than two characters are returned whole.
    #[must_use]
    pub fn class(&self) -> &str {
        self.0.get(..2).unwrap_or(&self.0)
    }
}

impl fmt::Display for SqlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SqlState {
    fn from(code: &str) -> Self {
        Self::new(code)
    }
}

/// An error raised by a driver call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}{}", sql_state_suffix(.sql_state))]
pub struct DriverError {
    /// SQLSTATE code, when the driver reported one.
    pub sql_state: Option<SqlState>,
    /// Vendor-specific error number (0 when not reported).
    pub vendor_code: i32,
    /// Human-readable message.
    pub message: String,
}

impl DriverError {
    /// Create an error with a message and no SQLSTATE.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            sql_state: None,
            vendor_code: 0,
            message: message.into(),
        }
    }

    /// Attach a SQLSTATE code.
    #[must_use]
    pub fn with_sql_state(mut self, code: impl Into<SqlState>) -> Self {
        self.sql_state = Some(code.into());
        self
    }

    /// Attach a vendor error number.
    #[must_use]
    pub fn with_vendor_code(mut self, code: i32) -> Self {
        self.vendor_code = code;
        self
    }

    /// The SQLSTATE code, if any.
    #[must_use]
    pub fn sql_state(&self) -> Option<&SqlState> {
        self.sql_state.as_ref()
    }
}

fn sql_state_suffix(state: &Option<SqlState>) -> String {
    state
        .as_ref()
        .map(|s| format!(" (SQLSTATE {s})"))
        .unwrap_or_default()
}
