//! Scripted in-memory driver for tests.
//!
//! [`MockConnection`] records every call into a shared [`DriverJournal`].
//! The journal can also be scripted to fail the next driver call, to fail
//! the close of a specific statement, or to panic while closing one.
//!
//! Statements are identified by a label: the SQL text for prepared
//! statements and calls, `statement#N` for plain statements.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::{DriverConnection, DriverStatement};
use crate::error::DriverError;
use crate::options::{PrepareOptions, ResultSetShape};

/// A recorded driver call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    /// A plain statement was created.
    StatementCreated {
        /// Statement label.
        label: String,
        /// Requested shape.
        shape: Option<ResultSetShape>,
    },
    /// A parameterized statement was prepared.
    StatementPrepared {
        /// Statement label.
        label: String,
        /// Requested options.
        options: PrepareOptions,
    },
    /// A stored procedure call was prepared.
    CallPrepared {
        /// Statement label.
        label: String,
        /// Requested shape.
        shape: Option<ResultSetShape>,
    },
    /// A statement closed successfully.
    StatementClosed {
        /// Statement label.
        label: String,
    },
    /// A statement close was attempted and failed.
    StatementCloseFailed {
        /// Statement label.
        label: String,
    },
    /// Auto-commit mode changed.
    AutoCommitSet(bool),
    /// Transaction committed.
    Commit,
    /// Transaction rolled back.
    Rollback,
    /// The physical connection closed.
    ConnectionClosed,
}

#[derive(Debug, Default)]
struct Script {
    next_error: Option<DriverError>,
    close_failures: HashMap<String, DriverError>,
    close_panics: HashSet<String>,
}

/// Shared record of driver calls plus the failure script.
#[derive(Debug, Default)]
pub struct DriverJournal {
    events: Mutex<Vec<DriverEvent>>,
    script: Mutex<Script>,
}

impl DriverJournal {
    /// Create an empty journal.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All recorded events in call order.
    #[must_use]
    pub fn events(&self) -> Vec<DriverEvent> {
        self.events.lock().clone()
    }

    /// Labels of statements that closed successfully, in close order.
    #[must_use]
    pub fn closed_statements(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                DriverEvent::StatementClosed { label } => Some(label.clone()),
                _ => None,
            })
            .collect()
    }

    /// Labels of statements whose close was attempted (successful or not),
    /// in attempt order.
    #[must_use]
    pub fn close_attempts(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                DriverEvent::StatementClosed { label }
                | DriverEvent::StatementCloseFailed { label } => Some(label.clone()),
                _ => None,
            })
            .collect()
    }

    /// Fail the next connection-level driver call with `error`.
    pub fn fail_next_call(&self, error: DriverError) {
        self.script.lock().next_error = Some(error);
    }

    /// Fail every close of the statement labelled `label` with `error`.
    pub fn fail_close(&self, label: impl Into<String>, error: DriverError) {
        self.script.lock().close_failures.insert(label.into(), error);
    }

    /// Panic while closing the statement labelled `label`.
    pub fn panic_on_close(&self, label: impl Into<String>) {
        self.script.lock().close_panics.insert(label.into());
    }

    fn record(&self, event: DriverEvent) {
        self.events.lock().push(event);
    }

    fn take_next_error(&self) -> Result<(), DriverError> {
        match self.script.lock().next_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// In-memory driver connection.
#[derive(Debug)]
pub struct MockConnection {
    journal: Arc<DriverJournal>,
    auto_commit: bool,
    next_plain: u32,
}

impl MockConnection {
    /// Create a connection with a fresh journal.
    #[must_use]
    pub fn new() -> Self {
        Self::with_journal(DriverJournal::new())
    }

    /// Create a connection recording into `journal`.
    #[must_use]
    pub fn with_journal(journal: Arc<DriverJournal>) -> Self {
        Self {
            journal,
            auto_commit: true,
            next_plain: 0,
        }
    }

    /// The journal this connection records into.
    #[must_use]
    pub fn journal(&self) -> Arc<DriverJournal> {
        Arc::clone(&self.journal)
    }

    fn statement(&self, label: String) -> MockStatement {
        MockStatement {
            label,
            journal: Arc::clone(&self.journal),
        }
    }
}

impl Default for MockConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverConnection for MockConnection {
    type Statement = MockStatement;

    fn create_statement(
        &mut self,
        shape: Option<&ResultSetShape>,
    ) -> Result<Self::Statement, DriverError> {
        self.journal.take_next_error()?;
        self.next_plain += 1;
        let label = format!("statement#{}", self.next_plain);
        self.journal.record(DriverEvent::StatementCreated {
            label: label.clone(),
            shape: shape.copied(),
        });
        Ok(self.statement(label))
    }

    fn prepare_statement(
        &mut self,
        sql: &str,
        options: &PrepareOptions,
    ) -> Result<Self::Statement, DriverError> {
        self.journal.take_next_error()?;
        self.journal.record(DriverEvent::StatementPrepared {
            label: sql.to_string(),
            options: options.clone(),
        });
        Ok(self.statement(sql.to_string()))
    }

    fn prepare_call(
        &mut self,
        sql: &str,
        shape: Option<&ResultSetShape>,
    ) -> Result<Self::Statement, DriverError> {
        self.journal.take_next_error()?;
        self.journal.record(DriverEvent::CallPrepared {
            label: sql.to_string(),
            shape: shape.copied(),
        });
        Ok(self.statement(sql.to_string()))
    }

    fn auto_commit(&self) -> Result<bool, DriverError> {
        self.journal.take_next_error()?;
        Ok(self.auto_commit)
    }

    fn set_auto_commit(&mut self, enabled: bool) -> Result<(), DriverError> {
        self.journal.take_next_error()?;
        self.auto_commit = enabled;
        self.journal.record(DriverEvent::AutoCommitSet(enabled));
        Ok(())
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        self.journal.take_next_error()?;
        self.journal.record(DriverEvent::Commit);
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        self.journal.take_next_error()?;
        self.journal.record(DriverEvent::Rollback);
        Ok(())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        self.journal.take_next_error()?;
        self.journal.record(DriverEvent::ConnectionClosed);
        Ok(())
    }
}

/// In-memory driver statement.
#[derive(Debug)]
pub struct MockStatement {
    label: String,
    journal: Arc<DriverJournal>,
}

impl MockStatement {
    /// The statement label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl DriverStatement for MockStatement {
    #[allow(clippy::panic)]
    fn close(&mut self) -> Result<(), DriverError> {
        let (panics, failure) = {
            let script = self.journal.script.lock();
            (
                script.close_panics.contains(&self.label),
                script.close_failures.get(&self.label).cloned(),
            )
        };

        if panics {
            panic!("scripted panic closing {}", self.label);
        }

        match failure {
            Some(err) => {
                self.journal.record(DriverEvent::StatementCloseFailed {
                    label: self.label.clone(),
                });
                Err(err)
            }
            None => {
                self.journal.record(DriverEvent::StatementClosed {
                    label: self.label.clone(),
                });
                Ok(())
            }
        }
    }
}
