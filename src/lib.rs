//! In-memory priority job scheduler and execution engine
//!
//! Jobs are routed into named queues by priority or resource class, dispatched
//! under per-queue concurrency ceilings, raced against a timeout and retried
//! with configurable backoff.

pub mod config;
pub mod errors;
pub mod job_scheduling;

pub use config::EngineConfig;
pub use errors::{EngineError, EngineResult, ExecutionError, ExecutionErrorKind, PermanentFailure};
pub use job_scheduling::{
    CronEvaluator, JobDefinition, JobEngine, JobEvent, JobExecution, JobPriority, JobProcessor,
    JobType, QueueConfig, RetryConfig, ScheduleSpec,
};
