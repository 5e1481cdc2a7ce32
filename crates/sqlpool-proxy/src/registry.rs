//! Open statement tracking.

use parking_lot::Mutex;

/// Default initial capacity of a registry.
pub const DEFAULT_STATEMENT_CAPACITY: usize = 64;

/// Statements currently open against one connection handle, in
/// registration order.
///
/// Access is expected from one caller at a time (the borrower) plus the
/// teardown in `close()`; the lock only guards against the latter.
#[derive(Debug)]
pub struct StatementRegistry<T> {
    entries: Mutex<Vec<(u64, T)>>,
}

impl<T> StatementRegistry<T> {
    /// Create a registry with room for `capacity` statements.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    /// Append an entry.
    pub fn register(&self, id: u64, entry: T) {
        self.entries.lock().push((id, entry));
    }

    /// Remove the entry with `id`. Absent ids are ignored.
    pub fn unregister(&self, id: u64) -> Option<T> {
        let mut entries = self.entries.lock();
        let position = entries.iter().rposition(|(entry_id, _)| *entry_id == id)?;
        Some(entries.remove(position).1)
    }

    /// Whether an entry with `id` is registered.
    #[must_use]
    pub fn contains(&self, id: u64) -> bool {
        self.entries.lock().iter().any(|(entry_id, _)| *entry_id == id)
    }

    /// Number of registered entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no entries are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Registered ids in registration order.
    #[must_use]
    pub fn ids(&self) -> Vec<u64> {
        self.entries.lock().iter().map(|(id, _)| *id).collect()
    }

    /// Empty the registry, returning the entries newest first.
    pub fn drain_newest_first(&self) -> Vec<(u64, T)> {
        let mut drained = std::mem::take(&mut *self.entries.lock());
        drained.reverse();
        drained
    }
}

impl<T> Default for StatementRegistry<T> {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_STATEMENT_CAPACITY)
    }
}
