//! Centralized error handling for the job engine
//!
//! Errors fall into two groups:
//!
//! - **Caller-facing errors** ([`EngineError`]): configuration and routing
//!   problems returned synchronously from `submit`, `register_processor`,
//!   `register_queue` and config loading.
//! - **Execution-time errors** ([`ExecutionError`]): failures produced while a
//!   job runs. These are never returned to the submitter; they are recorded on
//!   the execution record and surfaced through history, metrics and events.
//!
//! # Usage
//!
//! ```rust
//! use job_engine::errors::{EngineError, EngineResult};
//!
//! fn lookup(name: &str) -> EngineResult<()> {
//!     Err(EngineError::Processing {
//!         message: format!("queue '{name}' does not exist"),
//!     })
//! }
//!
//! assert!(lookup("missing").is_err());
//! ```

pub mod types;

pub use types::*;

/// Convenience type alias for Results using EngineError
pub type EngineResult<T> = Result<T, EngineError>;
