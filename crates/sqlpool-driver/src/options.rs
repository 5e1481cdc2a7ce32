//! Statement creation options.
//!
//! Drivers traditionally expose a family of overloads for creating
//! statements (result-set type/concurrency/holdability, auto-generated key
//! requests by flag, column index or column name). These types fold that
//! family into plain values passed to a single driver entry point.

/// Scrolling behavior of result sets produced by a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultSetType {
    /// Cursor moves forward only.
    #[default]
    ForwardOnly,
    /// Scrollable, not sensitive to concurrent changes.
    ScrollInsensitive,
    /// Scrollable and sensitive to concurrent changes.
    ScrollSensitive,
}

/// Whether result sets may be updated through the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultSetConcurrency {
    /// Read-only cursor.
    #[default]
    ReadOnly,
    /// Updatable cursor.
    Updatable,
}

/// Cursor behavior across commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Holdability {
    /// Cursors stay open after commit.
    HoldCursorsOverCommit,
    /// Cursors are closed at commit.
    CloseCursorsAtCommit,
}

/// Shape of the result sets a statement produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResultSetShape {
    /// Scrolling behavior.
    pub result_type: ResultSetType,
    /// Update behavior.
    pub concurrency: ResultSetConcurrency,
    /// Commit behavior; `None` leaves the driver default.
    pub holdability: Option<Holdability>,
}

impl ResultSetShape {
    /// Create a shape with the given type and concurrency.
    #[must_use]
    pub fn new(result_type: ResultSetType, concurrency: ResultSetConcurrency) -> Self {
        Self {
            result_type,
            concurrency,
            holdability: None,
        }
    }

    /// Set the holdability.
    #[must_use]
    pub fn holdability(mut self, holdability: Holdability) -> Self {
        self.holdability = Some(holdability);
        self
    }
}

/// Request for auto-generated keys from an insert.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GeneratedKeys {
    /// Do not return generated keys.
    #[default]
    None,
    /// Return whatever keys the driver considers generated.
    Return,
    /// Return the generated values of these 1-based column indexes.
    ColumnIndexes(Vec<u32>),
    /// Return the generated values of these columns.
    ColumnNames(Vec<String>),
}

impl GeneratedKeys {
    /// Whether any generated keys are requested.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Options for preparing a parameterized statement.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PrepareOptions {
    /// Result-set shape; `None` leaves the driver default.
    pub shape: Option<ResultSetShape>,
    /// Generated key request.
    pub generated_keys: GeneratedKeys,
}

impl PrepareOptions {
    /// Driver defaults, no generated keys.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the result-set shape.
    #[must_use]
    pub fn shape(mut self, shape: ResultSetShape) -> Self {
        self.shape = Some(shape);
        self
    }

    /// Set the generated key request.
    #[must_use]
    pub fn generated_keys(mut self, keys: GeneratedKeys) -> Self {
        self.generated_keys = keys;
        self
    }
}
