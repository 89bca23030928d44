//! Unified error handling for the crawl-scheduler crate
//!
//! Every component returns [`Result`], whose error type consolidates storage,
//! data, invariant and scheduler failures into a single [`Error`] enum.
//!
//! # Architecture
//!
//! - [`ClassifiedError`] - Common interface for recoverability and classification
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum
//!
//! # Usage
//!
//! ```rust,ignore
//! use crawl_scheduler::error::{ClassifiedError, Error};
//!
//! fn handle_error(err: Error) {
//!     if err.is_recoverable() {
//!         println!("Retrying later: {err}");
//!     } else {
//!         eprintln!("Fatal error ({}): {err}", err.category());
//!     }
//! }
//! ```

use std::fmt;
use std::io;
use thiserror::Error;

pub use crate::scheduler::error::SchedulerError;

/// Common trait for classified crate errors
pub trait ClassifiedError: std::error::Error {
    /// Check if this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Store unavailable, busy or I/O failure
    Storage,
    /// Malformed input or metadata
    Data,
    /// Impossible state transition or missing entity
    Invariant,
    /// Configuration and validation errors
    Config,
    /// Job scheduler errors
    Scheduler,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Storage => "storage",
            Self::Data => "data",
            Self::Invariant => "invariant",
            Self::Config => "config",
            Self::Scheduler => "scheduler",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for the crawl-scheduler crate
#[derive(Error, Debug)]
pub enum Error {
    /// Scheduler and job errors
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[source] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// A caller-supplied value was rejected
    #[error("Invalid {field}: {reason}")]
    InvalidInput { field: String, reason: String },

    /// The requested entity does not exist
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    /// A status change that the entity's state machine does not allow
    #[error("Invalid transition for {key}: {from} -> {to}")]
    InvalidTransition {
        key: String,
        from: String,
        to: String,
    },

    /// A mutex guarding shared state was poisoned by a panicking holder
    #[error("Lock poisoned: {0}")]
    LockPoisoned(&'static str),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ClassifiedError for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Scheduler(e) => e.is_recoverable(),
            Self::Database(e) => is_busy(e),
            Self::Io(_) => true, // I/O errors are often transient
            Self::Json(_) => false,
            Self::Config(_) => false,
            Self::InvalidInput { .. } => false,
            Self::NotFound { .. } => false,
            Self::InvalidTransition { .. } => false,
            Self::LockPoisoned(_) => false,
            Self::Other { .. } => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Scheduler(_) => ErrorCategory::Scheduler,
            Self::Database(_) | Self::Io(_) | Self::LockPoisoned(_) => ErrorCategory::Storage,
            Self::Json(_) | Self::InvalidInput { .. } => ErrorCategory::Data,
            Self::NotFound { .. } | Self::InvalidTransition { .. } => ErrorCategory::Invariant,
            Self::Config(_) => ErrorCategory::Config,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

/// SQLITE_BUSY / SQLITE_LOCKED clear once the competing writer commits
fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            key: key.into(),
        }
    }

    /// Create an invalid transition error
    pub fn transition(
        key: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self::InvalidTransition {
            key: key.into(),
            from: from.into(),
            to: to.into(),
        }
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }
}

// Conversion from rusqlite::Error
impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err)
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category() {
        let err = Error::invalid("url", "missing host");
        assert_eq!(err.category(), ErrorCategory::Data);

        let err = Error::transition("https://a.example/", "queued", "completed");
        assert_eq!(err.category(), ErrorCategory::Invariant);

        let err = Error::LockPoisoned("database connection");
        assert_eq!(err.category(), ErrorCategory::Storage);
    }

    #[test]
    fn test_busy_database_is_recoverable() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(Error::from(busy).is_recoverable());

        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        assert!(!Error::from(constraint).is_recoverable());
    }

    #[test]
    fn test_not_found_message() {
        let err = Error::not_found("queue entry", "https://a.example/x");
        assert_eq!(err.to_string(), "queue entry not found: https://a.example/x");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_config_error() {
        let err = Error::config("max_workers must be greater than 0");
        assert_eq!(err.category(), ErrorCategory::Config);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_scheduler_error_conversion() {
        let err: Error = SchedulerError::job_not_found("abc").into();
        assert!(matches!(err, Error::Scheduler(_)));
        assert_eq!(err.category(), ErrorCategory::Scheduler);
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::Invariant.to_string(), "invariant");
    }
}
