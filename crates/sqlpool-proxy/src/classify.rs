//! Fatal error classification.
//!
//! A driver error whose SQLSTATE indicates the physical connection is gone
//! is *fatal*: the connection must be discarded by the pool rather than
//! recycled. Classification is pure; the side effect of marking a handle
//! broken is applied by [`ConnectionHandle::inspect_error`].
//!
//! Fatal codes:
//!
//! | Code / class | Meaning |
//! |---|---|
//! | `08xxx` | connection exception (any code in the class) |
//! | `57P01` | admin shutdown |
//! | `57P02` | crash shutdown |
//! | `57P03` | cannot connect now |
//! | `01002` | disconnect error |
//!
//! [`ConnectionHandle::inspect_error`]: crate::ConnectionHandle::inspect_error

use std::collections::HashSet;
use std::sync::Arc;

use once_cell::sync::Lazy;
use sqlpool_driver::{DriverError, SqlState};

/// SQLSTATE classes in which every code is fatal.
pub const FATAL_SQL_STATE_CLASSES: &[&str] = &["08"];

/// Individual fatal SQLSTATE codes outside the fatal classes.
pub const FATAL_SQL_STATES: &[&str] = &["57P01", "57P02", "57P03", "01002"];

static STANDARD: Lazy<Arc<ErrorClassifier>> = Lazy::new(|| Arc::new(ErrorClassifier::new()));

/// Outcome of classifying a driver error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The connection is unusable and must be discarded.
    Fatal,
    /// The connection may be recycled.
    NonFatal,
}

impl Disposition {
    /// Whether the disposition is [`Disposition::Fatal`].
    #[must_use]
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::Fatal)
    }
}

/// Immutable fatal-code tables.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    classes: Vec<String>,
    codes: HashSet<String>,
}

impl ErrorClassifier {
    /// Classifier with the built-in tables.
    #[must_use]
    pub fn new() -> Self {
        Self {
            classes: FATAL_SQL_STATE_CLASSES
                .iter()
                .map(|c| c.to_string())
                .collect(),
            codes: FATAL_SQL_STATES.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// Classifier with the built-in tables plus `extra` vendor codes.
    ///
    /// Codes are matched case-insensitively.
    pub fn with_extra_codes<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut classifier = Self::new();
        classifier
            .codes
            .extend(extra.into_iter().map(|c| c.as_ref().to_ascii_uppercase()));
        classifier
    }

    /// The process-wide classifier with the built-in tables.
    #[must_use]
    pub fn standard() -> Arc<Self> {
        Arc::clone(&STANDARD)
    }

    /// Classify a SQLSTATE code. Absent codes are non-fatal.
    #[must_use]
    pub fn classify_code(&self, code: Option<&str>) -> Disposition {
        code.map_or(Disposition::NonFatal, |code| {
            self.classify_state(&SqlState::from(code))
        })
    }

    /// Classify a SQLSTATE: fatal if its class is a fatal class or the code
    /// itself is listed.
    #[must_use]
    pub fn classify_state(&self, state: &SqlState) -> Disposition {
        let class = state.class();
        if self
            .classes
            .iter()
            .any(|fatal| fatal.eq_ignore_ascii_case(class))
            || self.codes.contains(&state.as_str().to_ascii_uppercase())
        {
            Disposition::Fatal
        } else {
            Disposition::NonFatal
        }
    }

    /// Classify a driver error by its SQLSTATE.
    #[must_use]
    pub fn classify(&self, error: &DriverError) -> Disposition {
        error
            .sql_state()
            .map_or(Disposition::NonFatal, |state| self.classify_state(state))
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(code: &str) -> DriverError {
        DriverError::new("test").with_sql_state(code)
    }

    #[test]
    fn test_connection_exception_class_is_fatal() {
        let classifier = ErrorClassifier::new();
        assert_eq!(classifier.classify(&err("08001")), Disposition::Fatal);
        assert_eq!(classifier.classify(&err("08S01")), Disposition::Fatal);
        assert_eq!(classifier.classify(&err("08s01")), Disposition::Fatal);
    }

    #[test]
    fn test_vendor_codes_are_fatal() {
        let classifier = ErrorClassifier::new();
        for code in ["57P01", "57P02", "57P03", "01002", "57p01"] {
            assert!(classifier.classify(&err(code)).is_fatal(), "{code}");
        }
    }

    #[test]
    fn test_other_codes_are_not_fatal() {
        let classifier = ErrorClassifier::new();
        assert_eq!(classifier.classify(&err("42000")), Disposition::NonFatal);
        assert_eq!(classifier.classify(&err("57P04")), Disposition::NonFatal);
        assert_eq!(classifier.classify(&err("0")), Disposition::NonFatal);
        assert_eq!(classifier.classify(&err("8")), Disposition::NonFatal);
        assert_eq!(
            classifier.classify(&DriverError::new("no state")),
            Disposition::NonFatal
        );
    }

    #[test]
    fn test_class_match_uses_two_character_prefix() {
        let classifier = ErrorClassifier::new();
        assert!(classifier.classify_state(&SqlState::new("08")).is_fatal());
        assert!(classifier.classify_state(&SqlState::new("08ZZZ")).is_fatal());
        assert!(!classifier.classify_state(&SqlState::new("0")).is_fatal());
        assert!(!classifier.classify_state(&SqlState::new("80001")).is_fatal());
        assert_eq!(classifier.classify_code(None), Disposition::NonFatal);
    }

    #[test]
    fn test_extra_codes() {
        let classifier = ErrorClassifier::with_extra_codes(["hy000"]);
        assert!(classifier.classify(&err("HY000")).is_fatal());
        assert!(classifier.classify(&err("57P01")).is_fatal());
        assert!(!classifier.classify(&err("HY001")).is_fatal());
    }

    #[test]
    fn test_classify_leaves_error_untouched() {
        let classifier = ErrorClassifier::standard();
        let original = err("08003");
        let copy = original.clone();
        let _ = classifier.classify(&original);
        assert_eq!(original, copy);
    }
}
