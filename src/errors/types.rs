//! Error type definitions for the job engine
//!
//! Besides the error enums this module owns the recoverability rules used by
//! the execution runner when a processor fails.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Message fragments that mark a processor failure as non-recoverable.
///
/// Matching is case-insensitive and runs against the full error chain.
pub const NON_RECOVERABLE_PATTERNS: &[&str] = &[
    "validation",
    "invalid input",
    "authorization",
    "not found",
    "forbidden",
];

/// Top-level engine error type
#[derive(Error, Debug)]
pub enum EngineError {
    /// Duplicate queue or processor registration, invalid configuration,
    /// unparseable schedule
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Routing problems: no processor for a job type, missing queue,
    /// unknown job or dependency
    #[error("Processing error: {message}")]
    Processing { message: String },

    /// Processor exceeded its time budget
    #[error("Job timed out after {}", humantime::format_duration(*timeout))]
    Timeout { timeout: Duration },

    /// The engine has been shut down and accepts no more work
    #[error("Engine is shutting down")]
    ShuttingDown,

    /// Configuration file could not be read
    #[error("Failed to read configuration: {0}")]
    ConfigIo(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl EngineError {
    pub fn configuration(message: impl Into<String>) -> Self {
        EngineError::Configuration {
            message: message.into(),
        }
    }

    pub fn processing(message: impl Into<String>) -> Self {
        EngineError::Processing {
            message: message.into(),
        }
    }
}

/// Error a processor can return to force a terminal failure regardless of
/// its message or the remaining retry budget.
///
/// ```rust
/// use job_engine::errors::PermanentFailure;
///
/// let err = anyhow::Error::new(PermanentFailure::new("target host decommissioned"));
/// assert!(err.downcast_ref::<PermanentFailure>().is_some());
/// ```
#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct PermanentFailure(pub String);

impl PermanentFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Category of an execution-time failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    /// The processor did not settle within the effective timeout
    Timeout,
    /// The processor returned an error
    Processor,
    /// The processor task panicked
    Panic,
    /// The job could not be routed at run time (processor vanished)
    Processing,
    /// A declared dependency ended without completing
    Dependency,
}

/// Structured error recorded on a failed execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub message: String,
    pub recoverable: bool,
}

impl ExecutionError {
    /// Build an execution error from whatever a processor returned.
    pub fn from_processor(error: &anyhow::Error) -> Self {
        if let Some(EngineError::Timeout { .. }) = error.downcast_ref::<EngineError>() {
            return Self::timeout(error.to_string());
        }

        // `{:#}` renders the whole context chain on one line
        let message = format!("{error:#}");
        let recoverable =
            error.downcast_ref::<PermanentFailure>().is_none() && is_recoverable_message(&message);

        Self {
            kind: ExecutionErrorKind::Processor,
            message,
            recoverable,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: ExecutionErrorKind::Timeout,
            message: message.into(),
            recoverable: true,
        }
    }

    pub fn panic(message: impl Into<String>) -> Self {
        Self {
            kind: ExecutionErrorKind::Panic,
            message: message.into(),
            recoverable: true,
        }
    }

    pub fn processing(message: impl Into<String>) -> Self {
        Self {
            kind: ExecutionErrorKind::Processing,
            message: message.into(),
            recoverable: false,
        }
    }

    pub fn dependency(message: impl Into<String>) -> Self {
        Self {
            kind: ExecutionErrorKind::Dependency,
            message: message.into(),
            recoverable: false,
        }
    }
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Whether a failure message is worth retrying
pub fn is_recoverable_message(message: &str) -> bool {
    let msg = message.to_lowercase();
    !NON_RECOVERABLE_PATTERNS
        .iter()
        .any(|pattern| msg.contains(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_denylist_is_case_insensitive() {
        assert!(!is_recoverable_message("Validation failed: missing url"));
        assert!(!is_recoverable_message("upstream returned 403 FORBIDDEN"));
        assert!(!is_recoverable_message("monitor not found"));
        assert!(is_recoverable_message("connection reset by peer"));
        assert!(is_recoverable_message("502 bad gateway"));
    }

    #[test]
    fn test_classification_reads_context_chain() {
        let err = Err::<(), _>(anyhow::anyhow!("authorization header rejected"))
            .context("sending webhook")
            .unwrap_err();

        let classified = ExecutionError::from_processor(&err);
        assert_eq!(classified.kind, ExecutionErrorKind::Processor);
        assert!(!classified.recoverable);
        assert!(classified.message.contains("sending webhook"));
    }

    #[test]
    fn test_permanent_failure_short_circuits() {
        let err = anyhow::Error::new(PermanentFailure::new("disk quota exhausted"));
        let classified = ExecutionError::from_processor(&err);
        assert!(!classified.recoverable);
    }

    #[test]
    fn test_timeout_is_recoverable() {
        let err = anyhow::Error::new(EngineError::Timeout {
            timeout: Duration::from_millis(50),
        });
        let classified = ExecutionError::from_processor(&err);
        assert_eq!(classified.kind, ExecutionErrorKind::Timeout);
        assert!(classified.recoverable);
        assert_eq!(classified.message, "Job timed out after 50ms");
    }
}
