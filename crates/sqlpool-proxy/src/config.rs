//! Connection handle configuration.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;

use crate::classify::ErrorClassifier;
use crate::error::{Error, Result};
use crate::registry::DEFAULT_STATEMENT_CAPACITY;

/// Configuration shared by every handle a pool creates.
#[derive(Debug, Clone)]
pub struct HandleConfig {
    /// How long a connection may stay borrowed before a leak is reported.
    /// `None` disables leak detection.
    pub leak_detection_threshold: Option<Duration>,

    /// Initial capacity of each handle's statement registry.
    pub statement_capacity: usize,

    /// Vendor SQLSTATE codes treated as fatal in addition to the built-in
    /// table.
    pub extra_fatal_sql_states: Vec<String>,

    classifier: OnceCell<Arc<ErrorClassifier>>,
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self {
            leak_detection_threshold: None,
            statement_capacity: DEFAULT_STATEMENT_CAPACITY,
            extra_fatal_sql_states: Vec::new(),
            classifier: OnceCell::new(),
        }
    }
}

impl HandleConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `key=value;` configuration string.
    ///
    /// ```text
    /// leakDetectionThreshold=5000;statementCapacity=32;fatalSqlStates=HY000,S1000
    /// ```
    ///
    /// Keys are case-insensitive. The threshold is in milliseconds and `0`
    /// disables leak detection. Unknown keys are ignored.
    pub fn from_config_string(config_str: &str) -> Result<Self> {
        let mut config = Self::default();

        for part in config_str.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("invalid key-value: {part}")))?;

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "leakdetectionthreshold" | "leak detection threshold" => {
                    let millis: u64 = value.parse().map_err(|_| {
                        Error::Config(format!("invalid leak detection threshold: {value}"))
                    })?;
                    config.leak_detection_threshold =
                        (millis > 0).then(|| Duration::from_millis(millis));
                }
                "statementcapacity" | "statement capacity" => {
                    config.statement_capacity = value.parse().map_err(|_| {
                        Error::Config(format!("invalid statement capacity: {value}"))
                    })?;
                }
                "fatalsqlstates" | "fatal sql states" => {
                    config.extra_fatal_sql_states = value
                        .split(',')
                        .map(str::trim)
                        .filter(|code| !code.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                _ => {
                    tracing::debug!(
                        key = key,
                        value = value,
                        "ignoring unknown handle configuration option"
                    );
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the leak detection threshold.
    #[must_use]
    pub fn leak_detection_threshold(mut self, threshold: Duration) -> Self {
        self.leak_detection_threshold = Some(threshold);
        self
    }

    /// Disable leak detection.
    #[must_use]
    pub fn without_leak_detection(mut self) -> Self {
        self.leak_detection_threshold = None;
        self
    }

    /// Set the initial statement registry capacity.
    #[must_use]
    pub fn statement_capacity(mut self, capacity: usize) -> Self {
        self.statement_capacity = capacity;
        self
    }

    /// Add a vendor SQLSTATE code that marks a connection broken.
    #[must_use]
    pub fn fatal_sql_state(mut self, code: impl Into<String>) -> Self {
        self.extra_fatal_sql_states.push(code.into());
        self.classifier = OnceCell::new();
        self
    }

    /// Check the configuration for invalid values.
    pub fn validate(&self) -> Result<()> {
        if self.leak_detection_threshold == Some(Duration::ZERO) {
            return Err(Error::Config(
                "leak detection threshold must be greater than zero".into(),
            ));
        }

        for code in &self.extra_fatal_sql_states {
            validate_sql_state(code)?;
        }

        Ok(())
    }

    /// The classifier for handles built from this configuration.
    ///
    /// Built once per configuration; the built-in table is shared when no
    /// extra codes are configured.
    #[must_use]
    pub fn classifier(&self) -> Arc<ErrorClassifier> {
        Arc::clone(self.classifier.get_or_init(|| {
            if self.extra_fatal_sql_states.is_empty() {
                ErrorClassifier::standard()
            } else {
                Arc::new(ErrorClassifier::with_extra_codes(
                    &self.extra_fatal_sql_states,
                ))
            }
        }))
    }
}

/// Validate a SQLSTATE code: exactly five ASCII letters or digits.
fn validate_sql_state(code: &str) -> Result<()> {
    #[allow(clippy::expect_used)]
    static SQL_STATE_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^[0-9A-Za-z]{5}$").expect("valid SQLSTATE pattern"));

    if !SQL_STATE_RE.is_match(code) {
        return Err(Error::Config(format!(
            "invalid SQLSTATE '{code}': must be exactly 5 letters or digits"
        )));
    }

    Ok(())
}
