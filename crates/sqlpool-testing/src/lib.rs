//! # sqlpool-testing
//!
//! Test infrastructure for the sqlpool connection proxy.
//!
//! - [`RecordingPool`]: a minimal [`ConnectionPool`] that records every
//!   release it receives and optionally recycles healthy connections
//! - [`ChannelLeakReporter`]: forwards leak reports to a tokio channel so
//!   tests can await them
//!
//! Drivers for tests come from `sqlpool_driver::mock`, re-exported here as
//! [`mock`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use sqlpool_testing::{mock::MockConnection, RecordingPool};
//!
//! let pool = RecordingPool::new();
//! let conn = pool.connect(MockConnection::new());
//! conn.prepare_statement("SELECT 1")?;
//! conn.close()?;
//! assert_eq!(pool.release_count(), 1);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use sqlpool_driver::DriverConnection;
use sqlpool_proxy::{
    ConnectionHandle, ConnectionLifecycle, ConnectionPool, DynConnectionLifecycle, HandleConfig,
    LeakReport, LeakReporter, LeakState, LeakTimer, Result,
};
use tokio::sync::mpsc;

pub use sqlpool_driver::mock;

/// One release notification observed by a [`RecordingPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Release {
    /// Released connection.
    pub connection_id: u64,
    /// Broken flag at the time of release.
    pub broken: bool,
    /// Statements still tracked at the time of release.
    pub open_statements: usize,
    /// Leak detector state at the time of release.
    pub leak_state: LeakState,
}

/// A pool that records what it is handed back.
///
/// In recycling mode, healthy connections are kept idle, still closed, and
/// revived by the next [`borrow`](Self::borrow); broken ones are discarded.
pub struct RecordingPool<C: DriverConnection> {
    config: HandleConfig,
    timer: Option<LeakTimer>,
    recycle: bool,
    releases: Mutex<Vec<Release>>,
    idle: Mutex<Vec<Arc<ConnectionHandle<C>>>>,
    discarded: Mutex<Vec<u64>>,
}

impl<C: DriverConnection> RecordingPool<C> {
    /// A pool that only records releases.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(HandleConfig::default(), None, false))
    }

    /// A pool that records releases and recycles healthy connections.
    #[must_use]
    pub fn recycling() -> Arc<Self> {
        Arc::new(Self::build(HandleConfig::default(), None, true))
    }

    /// A recycling pool that builds handles from `config` and arms leak
    /// detection on `timer` when the configuration enables it.
    #[must_use]
    pub fn with_config(config: HandleConfig, timer: LeakTimer) -> Arc<Self> {
        Arc::new(Self::build(config, Some(timer), true))
    }

    fn build(config: HandleConfig, timer: Option<LeakTimer>, recycle: bool) -> Self {
        Self {
            config,
            timer,
            recycle,
            releases: Mutex::new(Vec::new()),
            idle: Mutex::new(Vec::new()),
            discarded: Mutex::new(Vec::new()),
        }
    }

    /// Wrap a driver connection in a handle owned by this pool.
    pub fn connect(self: &Arc<Self>, driver: C) -> Arc<ConnectionHandle<C>> {
        ConnectionHandle::with_config(driver, self, &self.config)
    }

    /// Add a new connection to the idle list.
    pub fn add_idle(self: &Arc<Self>, driver: C) -> u64 {
        let conn = self.connect(driver);
        let id = conn.id();
        self.idle.lock().push(conn);
        id
    }

    /// Lend out an idle connection: revive it for a new borrow cycle and arm
    /// leak detection when configured.
    ///
    /// The borrow site recorded for leak reports is the caller's.
    #[track_caller]
    pub fn borrow(&self) -> Result<Option<Arc<ConnectionHandle<C>>>> {
        let Some(conn) = self.idle.lock().pop() else {
            return Ok(None);
        };

        conn.revive_for_reuse();
        conn.touch();
        if let (Some(threshold), Some(timer)) = (self.config.leak_detection_threshold, &self.timer)
        {
            conn.arm_leak_detection(threshold, timer)?;
        }

        tracing::debug!(connection_id = conn.id(), "connection borrowed");
        Ok(Some(conn))
    }

    /// Every release received, in order.
    #[must_use]
    pub fn releases(&self) -> Vec<Release> {
        self.releases.lock().clone()
    }

    /// Number of releases received.
    #[must_use]
    pub fn release_count(&self) -> usize {
        self.releases.lock().len()
    }

    /// Releases received for connection `connection_id`.
    #[must_use]
    pub fn releases_of(&self, connection_id: u64) -> Vec<Release> {
        self.releases
            .lock()
            .iter()
            .filter(|release| release.connection_id == connection_id)
            .copied()
            .collect()
    }

    /// Ids of connections discarded as broken.
    #[must_use]
    pub fn discarded(&self) -> Vec<u64> {
        self.discarded.lock().clone()
    }

    /// Number of idle connections.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Idle connections as type-erased lifecycle handles.
    #[must_use]
    pub fn idle_lifecycles(&self) -> Vec<DynConnectionLifecycle> {
        self.idle
            .lock()
            .iter()
            .map(|conn| Arc::clone(conn) as DynConnectionLifecycle)
            .collect()
    }

    /// Drop idle connections that have become broken. Returns how many
    /// were evicted.
    pub fn evict_broken(&self) -> usize {
        let mut idle = self.idle.lock();
        let before = idle.len();
        let mut discarded = self.discarded.lock();
        idle.retain(|conn| {
            let keep = !ConnectionLifecycle::is_broken(conn.as_ref());
            if !keep {
                discarded.push(conn.id());
            }
            keep
        });
        before - idle.len()
    }
}

impl<C: DriverConnection> ConnectionPool<C> for RecordingPool<C> {
    fn release_connection(&self, connection: Arc<ConnectionHandle<C>>) {
        let meta = connection.metadata();
        self.releases.lock().push(Release {
            connection_id: meta.id,
            broken: meta.broken,
            open_statements: meta.open_statements,
            leak_state: meta.leak_state,
        });

        if !self.recycle {
            return;
        }

        if meta.is_recyclable() {
            self.idle.lock().push(connection);
        } else {
            tracing::debug!(connection_id = meta.id, "discarding broken connection");
            self.discarded.lock().push(meta.id);
        }
    }
}

/// Forwards leak reports to an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelLeakReporter {
    tx: mpsc::UnboundedSender<LeakReport>,
}

impl ChannelLeakReporter {
    /// Create a reporter and the receiving end of its channel.
    #[must_use]
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<LeakReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl LeakReporter for ChannelLeakReporter {
    fn report(&self, report: &LeakReport) {
        if self.tx.send(report.clone()).is_err() {
            tracing::debug!(
                connection_id = report.connection_id,
                "leak report dropped: receiver closed"
            );
        }
    }
}
