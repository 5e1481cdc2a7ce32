//! Connection leak detection.
//!
//! When a pool hands out a connection with leak detection enabled, it arms
//! the handle's [`LeakDetector`]: the borrow site is captured and a task is
//! scheduled on the shared [`LeakTimer`]. If the handle is still open when
//! the threshold elapses, the task emits a [`LeakReport`]; if the handle is
//! closed first, the task is cancelled.
//!
//! ```text
//! UNARMED ──arm──▶ ARMED ──threshold elapses──▶ FIRED
//!                    │
//!                    └──────close()───────────▶ CANCELLED
//! ```
//!
//! `FIRED` and `CANCELLED` are terminal for the borrow cycle. The race
//! between the timer and `close()` is resolved by a single
//! compare-and-exchange, so exactly one of them wins. Firing only reports;
//! it never touches the connection.

use std::backtrace::Backtrace;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

const ARMED: u8 = 1;
const FIRED: u8 = 2;
const CANCELLED: u8 = 3;

/// Leak detector state for one borrow cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeakState {
    /// No detection scheduled.
    Unarmed,
    /// Detection scheduled and pending.
    Armed,
    /// Threshold elapsed while the connection was open; a report was emitted.
    Fired,
    /// The connection was closed before the threshold elapsed.
    Cancelled,
}

impl LeakState {
    /// Whether the state is terminal for the current borrow cycle.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Fired | Self::Cancelled)
    }
}

impl fmt::Display for LeakState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unarmed => "unarmed",
            Self::Armed => "armed",
            Self::Fired => "fired",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Diagnostic snapshot of where a connection was borrowed.
#[derive(Debug)]
pub struct BorrowSite {
    /// Source location of the borrowing call.
    pub location: &'static Location<'static>,
    /// Name of the borrowing thread, if it has one.
    pub thread: Option<String>,
    /// When the snapshot was taken.
    pub captured_at: Instant,
    /// Call stack at capture. Honors `RUST_BACKTRACE`/`RUST_LIB_BACKTRACE`.
    pub backtrace: Backtrace,
}

impl BorrowSite {
    /// Capture the caller's location, thread and backtrace.
    ///
    /// The location is that of the nearest caller not marked
    /// `#[track_caller]`, so pool checkout paths that propagate
    /// `#[track_caller]` report the application's call site.
    #[track_caller]
    #[must_use]
    pub fn capture() -> Self {
        Self {
            location: Location::caller(),
            thread: std::thread::current().name().map(str::to_string),
            captured_at: Instant::now(),
            backtrace: Backtrace::capture(),
        }
    }
}

impl fmt::Display for BorrowSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.location)?;
        if let Some(thread) = &self.thread {
            write!(f, " on thread '{thread}'")?;
        }
        Ok(())
    }
}

/// Emitted when a borrowed connection outlives the leak threshold.
#[derive(Debug, Clone)]
pub struct LeakReport {
    /// The leaked connection.
    pub connection_id: u64,
    /// The configured threshold.
    pub threshold: Duration,
    /// Where the connection was borrowed.
    pub site: Arc<BorrowSite>,
    /// How long the connection had been held when the report was made.
    pub held_for: Duration,
}

/// Sink for leak reports.
pub trait LeakReporter: Send + Sync {
    /// Handle a leak report. Called from the timer's runtime.
    fn report(&self, report: &LeakReport);
}

/// Reports leaks as `warn` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLeakReporter;

impl LeakReporter for TracingLeakReporter {
    fn report(&self, report: &LeakReport) {
        tracing::warn!(
            connection_id = report.connection_id,
            threshold = ?report.threshold,
            borrowed_at = %report.site,
            held_for = ?report.held_for,
            backtrace = %report.site.backtrace,
            "connection leak detected: borrowed connection not returned within threshold"
        );
    }
}

struct TimerInner {
    runtime: Handle,
    shutdown: CancellationToken,
    reporter: Arc<dyn LeakReporter>,
}

/// Shared timer service for leak detection.
///
/// Owned by the pool and shared by every handle it lends out. Each armed
/// detector becomes a task on the wrapped tokio runtime; the runtime must
/// have its time driver enabled.
#[derive(Clone)]
pub struct LeakTimer {
    inner: Arc<TimerInner>,
}

impl LeakTimer {
    /// Create a timer that reports through [`TracingLeakReporter`].
    #[must_use]
    pub fn new(runtime: Handle) -> Self {
        Self::with_reporter(runtime, Arc::new(TracingLeakReporter))
    }

    /// Create a timer with a custom report sink.
    #[must_use]
    pub fn with_reporter(runtime: Handle, reporter: Arc<dyn LeakReporter>) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                runtime,
                shutdown: CancellationToken::new(),
                reporter,
            }),
        }
    }

    /// Cancel every pending detection and reject new ones.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        tracing::debug!("leak detection timer shut down");
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    fn schedule(&self, trap: Arc<LeakTrap>) {
        let reporter = Arc::clone(&self.inner.reporter);
        self.inner.runtime.spawn(async move {
            tokio::select! {
                () = trap.token.cancelled() => {}
                () = tokio::time::sleep(trap.threshold) => {
                    if trap.fire() {
                        reporter.report(&trap.report());
                    }
                }
            }
        });
    }
}

impl fmt::Debug for LeakTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeakTimer")
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

/// Shared between a detector and its scheduled task.
#[derive(Debug)]
struct LeakTrap {
    state: AtomicU8,
    connection_id: u64,
    threshold: Duration,
    site: Arc<BorrowSite>,
    token: CancellationToken,
}

impl LeakTrap {
    fn state(&self) -> LeakState {
        match self.state.load(Ordering::Acquire) {
            ARMED => LeakState::Armed,
            FIRED => LeakState::Fired,
            _ => LeakState::Cancelled,
        }
    }

    fn fire(&self) -> bool {
        self.state
            .compare_exchange(ARMED, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn cancel(&self) -> bool {
        let won = self
            .state
            .compare_exchange(ARMED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.token.cancel();
        }
        won
    }

    fn report(&self) -> LeakReport {
        LeakReport {
            connection_id: self.connection_id,
            threshold: self.threshold,
            site: Arc::clone(&self.site),
            held_for: self.site.captured_at.elapsed(),
        }
    }
}

/// Per-handle leak detection state machine.
#[derive(Debug, Default)]
pub struct LeakDetector {
    trap: Option<Arc<LeakTrap>>,
}

impl LeakDetector {
    /// A detector in the `Unarmed` state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LeakState {
        self.trap
            .as_ref()
            .map_or(LeakState::Unarmed, |trap| trap.state())
    }

    /// The captured borrow site, once armed.
    #[must_use]
    pub fn site(&self) -> Option<Arc<BorrowSite>> {
        self.trap.as_ref().map(|trap| Arc::clone(&trap.site))
    }

    /// Schedule a leak check for `connection_id` after `threshold`.
    ///
    /// Only valid from `Unarmed`; a new borrow cycle must
    /// [`reset`](Self::reset) the detector first.
    pub fn arm(
        &mut self,
        connection_id: u64,
        threshold: Duration,
        site: BorrowSite,
        timer: &LeakTimer,
    ) -> Result<()> {
        let state = self.state();
        if state != LeakState::Unarmed {
            return Err(Error::LeakDetection {
                connection_id,
                state,
            });
        }
        if timer.is_shut_down() {
            return Err(Error::TimerShutdown);
        }

        let trap = Arc::new(LeakTrap {
            state: AtomicU8::new(ARMED),
            connection_id,
            threshold,
            site: Arc::new(site),
            token: timer.inner.shutdown.child_token(),
        });
        timer.schedule(Arc::clone(&trap));
        self.trap = Some(trap);
        Ok(())
    }

    /// Cancel a pending check. Returns `true` if this call moved the
    /// detector from `Armed` to `Cancelled`; a check that already fired
    /// is left as is.
    pub fn cancel(&self) -> bool {
        self.trap.as_ref().is_some_and(|trap| trap.cancel())
    }

    /// Return to `Unarmed` for a new borrow cycle, cancelling any pending
    /// check.
    pub fn reset(&mut self) {
        if let Some(trap) = self.trap.take() {
            trap.cancel();
        }
    }
}
