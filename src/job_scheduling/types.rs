//! Job scheduling type definitions
//!
//! These records form the stable shape consumed by any API or persistence
//! layer built on top of the engine, so every type here is serde-friendly.

use crate::config::duration_serde::{duration, option_duration};
use crate::errors::ExecutionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Priority levels for job execution
///
/// Ordering follows urgency: `Critical < High < Normal < Low < Bulk`, so the
/// smallest value is dispatched first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum JobPriority {
    /// Incident checks, alert fan-out
    Critical = 0,
    /// Manual user triggers
    High = 1,
    /// Regular scheduled checks
    #[default]
    Normal = 2,
    /// Reports and digests
    Low = 3,
    /// Backups, exports, maintenance sweeps
    Bulk = 4,
}

impl JobPriority {
    /// All priorities in dispatch order
    pub const ALL: [JobPriority; 5] = [
        JobPriority::Critical,
        JobPriority::High,
        JobPriority::Normal,
        JobPriority::Low,
        JobPriority::Bulk,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::Critical => "critical",
            JobPriority::High => "high",
            JobPriority::Normal => "normal",
            JobPriority::Low => "low",
            JobPriority::Bulk => "bulk",
        }
    }
}

impl PartialOrd for JobPriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for JobPriority {
    fn cmp(&self, other: &Self) -> Ordering {
        (*self as u8).cmp(&(*other as u8))
    }
}

impl FromStr for JobPriority {
    type Err = std::convert::Infallible;

    /// Unknown values fall back to `Normal`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "critical" => JobPriority::Critical,
            "high" => JobPriority::High,
            "low" => JobPriority::Low,
            "bulk" => JobPriority::Bulk,
            _ => JobPriority::Normal,
        })
    }
}

impl From<String> for JobPriority {
    fn from(value: String) -> Self {
        value.parse().unwrap_or_default()
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type of job to be executed; selects the processor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Uptime / latency check against a monitored target
    MonitorCheck,
    /// Email or chat notification
    Notification,
    /// Outbound webhook delivery
    Webhook,
    /// Backup routine
    Backup,
    /// Report generation
    Report,
    /// Housekeeping operation
    Maintenance,
    /// Anything else, identified by name
    Custom(String),
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobType::MonitorCheck => f.write_str("monitor_check"),
            JobType::Notification => f.write_str("notification"),
            JobType::Webhook => f.write_str("webhook"),
            JobType::Backup => f.write_str("backup"),
            JobType::Report => f.write_str("report"),
            JobType::Maintenance => f.write_str("maintenance"),
            JobType::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

/// Backoff strategy between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
    Linear,
}

/// Retry configuration attached to a job or inherited from its queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    #[serde(with = "duration")]
    pub base_delay: Duration,
    #[serde(with = "duration")]
    pub max_delay: Duration,
    #[serde(default)]
    pub jitter: bool,
}

impl RetryConfig {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: BackoffKind::Fixed,
            base_delay: delay,
            max_delay: delay,
            jitter: false,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: BackoffKind::Exponential,
            base_delay,
            max_delay,
            jitter: false,
        }
    }

    pub fn linear(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: BackoffKind::Linear,
            base_delay,
            max_delay,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

/// How a recurring or deferred job is triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    Cron,
    Interval,
    Once,
}

/// Schedule attached to a job definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub kind: ScheduleKind,
    /// Cron expression, interval period, or once-delay / RFC 3339 timestamp
    pub expression: String,
    /// IANA timezone for cron evaluation (UTC when absent)
    #[serde(default)]
    pub timezone: Option<String>,
    /// No fire happens before this instant
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
    /// No fire happens after this instant
    #[serde(default)]
    pub end_at: Option<DateTime<Utc>>,
}

impl ScheduleSpec {
    pub fn cron(expression: impl Into<String>) -> Self {
        Self::new(ScheduleKind::Cron, expression)
    }

    pub fn interval(expression: impl Into<String>) -> Self {
        Self::new(ScheduleKind::Interval, expression)
    }

    pub fn once(expression: impl Into<String>) -> Self {
        Self::new(ScheduleKind::Once, expression)
    }

    fn new(kind: ScheduleKind, expression: impl Into<String>) -> Self {
        Self {
            kind,
            expression: expression.into(),
            timezone: None,
            start_at: None,
            end_at: None,
        }
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    pub fn with_window(
        mut self,
        start_at: Option<DateTime<Utc>>,
        end_at: Option<DateTime<Utc>>,
    ) -> Self {
        self.start_at = start_at;
        self.end_at = end_at;
        self
    }
}

/// Immutable description of a unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Unique job identifier
    pub id: Uuid,
    /// Selects the processor
    pub job_type: JobType,
    /// Selects the queue unless `queue` is set
    #[serde(default)]
    pub priority: JobPriority,
    /// Opaque payload handed to the processor
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Wait this long before the first enqueue
    #[serde(default, with = "option_duration")]
    pub delay: Option<Duration>,
    /// Overrides the queue's retry defaults
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    /// Overrides the queue's default timeout
    #[serde(default, with = "option_duration")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub schedule: Option<ScheduleSpec>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Jobs that must complete before this one is dispatched
    #[serde(default)]
    pub depends_on: Vec<Uuid>,
    /// Maximum concurrently running executions of this job
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    /// Resource class: explicit queue name, bypassing priority routing
    #[serde(default)]
    pub queue: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl JobDefinition {
    /// Create a new job definition with normal priority
    pub fn new(job_type: JobType) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type,
            priority: JobPriority::Normal,
            payload: serde_json::Value::Null,
            delay: None,
            retry: None,
            timeout: None,
            schedule: None,
            tags: BTreeSet::new(),
            depends_on: Vec::new(),
            max_concurrency: None,
            queue: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_schedule(mut self, schedule: ScheduleSpec) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_dependency(mut self, job_id: Uuid) -> Self {
        self.depends_on.push(job_id);
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = Some(max);
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Whether the job is armed by the scheduler rather than enqueued directly
    pub fn is_deferred(&self) -> bool {
        self.schedule.is_some() || self.delay.is_some()
    }
}

/// Lifecycle state of one execution record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Waiting for a dispatch slot
    Pending,
    /// Handed to a processor
    Running,
    Completed,
    /// Terminal failure
    Failed,
    /// This attempt failed and a successor attempt is armed
    Retrying,
    Cancelled,
    /// Waiting for a schedule or delay to fire
    Scheduled,
    /// Reserved for API layers that surface queue gating; never assigned by
    /// the engine itself
    Paused,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One line of an execution's log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Timing figures for one execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    /// Time spent inside the processor
    #[serde(default, with = "option_duration")]
    pub duration: Option<Duration>,
    /// Time between enqueue and dispatch
    #[serde(default, with = "option_duration")]
    pub queue_wait: Option<Duration>,
    /// Backoff applied before the successor attempt
    #[serde(default, with = "option_duration")]
    pub retry_delay: Option<Duration>,
}

/// Mutable record of one attempt of a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: Uuid,
    pub job_id: Uuid,
    /// Shared by every attempt of the same run
    pub run_id: Uuid,
    pub queue: String,
    pub status: ExecutionStatus,
    /// 1-based attempt number within the run
    pub attempt: u32,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<ExecutionError>,
    #[serde(default)]
    pub logs: Vec<ExecutionLog>,
    #[serde(default)]
    pub metrics: ExecutionMetrics,
    pub worker_id: Option<String>,
}

impl JobExecution {
    pub(crate) fn new(job_id: Uuid, run_id: Uuid, queue: &str, attempt: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            run_id,
            queue: queue.to_string(),
            status: ExecutionStatus::Pending,
            attempt,
            scheduled_for: None,
            enqueued_at: None,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            logs: Vec::new(),
            metrics: ExecutionMetrics::default(),
            worker_id: None,
        }
    }

    pub(crate) fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.logs.push(ExecutionLog {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_priority_ordering() {
        assert!(JobPriority::Critical < JobPriority::High);
        assert!(JobPriority::High < JobPriority::Normal);
        assert!(JobPriority::Normal < JobPriority::Low);
        assert!(JobPriority::Low < JobPriority::Bulk);
    }

    #[test]
    fn test_unknown_priority_defaults_to_normal() {
        assert_eq!("CRITICAL".parse::<JobPriority>().unwrap(), JobPriority::Critical);
        assert_eq!("urgent".parse::<JobPriority>().unwrap(), JobPriority::Normal);

        let parsed: JobPriority = serde_json::from_str(r#""whenever""#).unwrap();
        assert_eq!(parsed, JobPriority::Normal);
        assert_eq!(serde_json::to_string(&JobPriority::Bulk).unwrap(), r#""bulk""#);
        assert_eq!(JobPriority::default(), JobPriority::Normal);
    }

    #[test]
    fn test_job_definition_deserializes_with_defaults() {
        let json = serde_json::json!({
            "id": Uuid::new_v4(),
            "job_type": "webhook",
            "priority": "high",
            "payload": {"url": "https://example.com/hook"},
            "timeout": "30s",
            "retry": {
                "max_attempts": 3,
                "backoff": "fixed",
                "base_delay": 100,
                "max_delay": "1s"
            },
            "created_at": "2024-01-01T00:00:00Z"
        });

        let job: JobDefinition = serde_json::from_value(json).unwrap();
        assert_eq!(job.job_type, JobType::Webhook);
        assert_eq!(job.priority, JobPriority::High);
        assert_eq!(job.timeout, Some(Duration::from_secs(30)));
        let retry = job.retry.unwrap();
        assert_eq!(retry.base_delay, Duration::from_millis(100));
        assert!(!retry.jitter);
        assert!(job.depends_on.is_empty());
        assert!(job.schedule.is_none());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Retrying.is_terminal());
        assert!(!ExecutionStatus::Scheduled.is_terminal());
    }

    #[test]
    fn test_custom_job_type_display() {
        assert_eq!(JobType::Custom("dns".into()).to_string(), "custom:dns");
        assert_eq!(JobType::MonitorCheck.to_string(), "monitor_check");
    }
}
