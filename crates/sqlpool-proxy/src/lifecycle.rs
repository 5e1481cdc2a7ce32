//! Pool-facing connection lifecycle capabilities.
//!
//! The pool's admission and eviction logic works with connections through
//! [`ConnectionLifecycle`], independent of the driver type behind them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::leak::LeakState;

/// Bookkeeping operations the pool performs on a lent-out connection.
pub trait ConnectionLifecycle: Send + Sync {
    /// Unique connection id.
    fn id(&self) -> u64;

    /// When the handle was created.
    fn created_at(&self) -> Instant;

    /// When the pool last recorded activity on the handle.
    fn last_access(&self) -> Instant;

    /// Record activity at `at`.
    fn set_last_access(&self, at: Instant);

    /// Record activity now.
    fn touch(&self) {
        self.set_last_access(Instant::now());
    }

    /// Whether the handle has been returned to the pool.
    fn is_closed(&self) -> bool;

    /// Whether the physical connection must be discarded.
    fn is_broken(&self) -> bool;

    /// Mark the physical connection unusable.
    fn mark_broken(&self);

    /// Rebind a closed handle to a new borrow cycle.
    fn revive_for_reuse(&self);

    /// Leak detector state of the current borrow cycle.
    fn leak_state(&self) -> LeakState;

    /// Snapshot of the handle's state.
    fn metadata(&self) -> ConnectionMetadata;
}

/// Type-erased lifecycle handle.
pub type DynConnectionLifecycle = Arc<dyn ConnectionLifecycle>;

/// Point-in-time view of a connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionMetadata {
    /// Connection id.
    pub id: u64,
    /// Creation time.
    pub created_at: Instant,
    /// Last recorded activity.
    pub last_access: Instant,
    /// Number of tracked open statements.
    pub open_statements: usize,
    /// Whether the handle is closed.
    pub closed: bool,
    /// Whether the physical connection is broken.
    pub broken: bool,
    /// Leak detector state.
    pub leak_state: LeakState,
}

impl ConnectionMetadata {
    /// Time since creation, measured at `now`.
    #[must_use]
    pub fn age_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Time since last activity, measured at `now`.
    #[must_use]
    pub fn idle_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_access)
    }

    /// Whether the pool may hand this connection out again.
    #[must_use]
    pub fn is_recyclable(&self) -> bool {
        self.closed && !self.broken
    }
}
