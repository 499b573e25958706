//! Job scheduling subsystem
//!
//! This module provides the priority job scheduler and execution engine:
//! - Named queues with concurrency, retry, timeout and rate-limit settings
//! - Delayed, once, interval and cron scheduling
//! - A tick-driven dispatcher with per-queue and global concurrency ceilings
//! - Timeout-raced execution with backoff retries
//!
//! The system is built around these components:
//! - `QueueRegistry`: named queues and their pause state
//! - `JobScheduler`: arms delays, schedules and retry timers
//! - `JobQueueRunner`: the dispatch tick loop
//! - `JobExecutor`: runs one attempt against its processor
//! - `JobEngine`: the public facade tying them together

pub mod cron;
pub mod engine;
pub mod events;
mod job_executor;
pub mod job_queue;
mod job_queue_runner;
pub mod job_scheduler;
mod job_store;
pub mod metrics;
pub mod processor;
pub mod retry_policy;
mod timer;
pub mod types;

pub use self::cron::{CronEvaluator, CronScheduleEvaluator};
pub use engine::{JobEngine, ShutdownReport};
pub use events::JobEvent;
pub use job_queue::{resolve_queue_for_priority, QueueConfig, QueueStatus, RateLimit};
pub use metrics::{JobTypeMetrics, MetricsSnapshot, QueueMetrics};
pub use processor::JobProcessor;
pub use retry_policy::{GiveUpReason, RetryDecision};
pub use types::*;
