use serde::{Deserialize, Serialize};
use std::fmt;

/// Single structured error shape used across all layers.
///
/// `retryable` marks connectivity/query-class failures the periodic loops
/// should simply retry next cycle. Usage errors (unknown status, unknown
/// procedure, bad action parameters) are non-retryable: they indicate a
/// configuration defect, not an operational condition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppError {
    pub code: String,
    pub message: String,
    pub details: Option<String>,
    pub retryable: bool,
}

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            retryable: false,
        }
    }

    /// Connectivity/query-class error wrapping an underlying SQLite failure.
    pub fn sql(code: impl Into<String>, message: impl Into<String>, e: rusqlite::Error) -> Self {
        Self::new(code, message)
            .with_details(e.to_string())
            .with_retryable(true)
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}
