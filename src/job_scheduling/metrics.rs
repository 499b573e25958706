//! Execution metrics aggregation
//!
//! Counters and exponentially smoothed averages derived from execution
//! outcomes. Read-only with respect to jobs and executions.

use crate::config::duration_serde::option_duration;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::RwLock;

/// Weight of a new sample in the moving averages
pub const SMOOTHING_FACTOR: f64 = 0.1;

/// Exponential moving average in seconds; the first sample seeds it
#[derive(Debug, Clone, Copy, Default)]
struct MovingAverage(Option<f64>);

impl MovingAverage {
    fn record(&mut self, sample: Duration) {
        let sample = sample.as_secs_f64();
        self.0 = Some(match self.0 {
            Some(avg) => avg * (1.0 - SMOOTHING_FACTOR) + sample * SMOOTHING_FACTOR,
            None => sample,
        });
    }

    fn get(&self) -> Option<Duration> {
        self.0.map(Duration::from_secs_f64)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueMetrics {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    #[serde(with = "option_duration")]
    pub average_execution_time: Option<Duration>,
    #[serde(with = "option_duration")]
    pub average_queue_wait: Option<Duration>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobTypeMetrics {
    pub completed: u64,
    pub failed: u64,
    #[serde(with = "option_duration")]
    pub average_execution_time: Option<Duration>,
}

/// Point-in-time copy of the engine metrics
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub total_submitted: u64,
    pub total_started: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_retried: u64,
    pub total_timeouts: u64,
    pub total_cancelled: u64,
    pub currently_running: usize,
    #[serde(with = "option_duration")]
    pub average_execution_time: Option<Duration>,
    pub queues: BTreeMap<String, QueueMetrics>,
    pub job_types: BTreeMap<String, JobTypeMetrics>,
}

#[derive(Debug, Default)]
struct QueueAccumulator {
    metrics: QueueMetrics,
    execution_time: MovingAverage,
    queue_wait: MovingAverage,
}

#[derive(Debug, Default)]
struct JobTypeAccumulator {
    metrics: JobTypeMetrics,
    execution_time: MovingAverage,
}

#[derive(Debug, Default)]
struct MetricsState {
    snapshot: MetricsSnapshot,
    execution_time: MovingAverage,
    queues: BTreeMap<String, QueueAccumulator>,
    job_types: BTreeMap<String, JobTypeAccumulator>,
}

#[derive(Debug, Default)]
pub(crate) struct MetricsAggregator {
    state: RwLock<MetricsState>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_submitted(&self) {
        self.state.write().await.snapshot.total_submitted += 1;
    }

    pub async fn record_started(&self, queue: &str, queue_wait: Option<Duration>) {
        let mut state = self.state.write().await;
        state.snapshot.total_started += 1;
        state.snapshot.currently_running += 1;

        let acc = state.queues.entry(queue.to_string()).or_default();
        acc.metrics.started += 1;
        if let Some(wait) = queue_wait {
            acc.queue_wait.record(wait);
        }
    }

    pub async fn record_completed(&self, queue: &str, job_type: &str, duration: Duration) {
        let mut state = self.state.write().await;
        state.snapshot.total_completed += 1;
        state.snapshot.currently_running = state.snapshot.currently_running.saturating_sub(1);
        state.execution_time.record(duration);

        let acc = state.queues.entry(queue.to_string()).or_default();
        acc.metrics.completed += 1;
        acc.execution_time.record(duration);

        let acc = state.job_types.entry(job_type.to_string()).or_default();
        acc.metrics.completed += 1;
        acc.execution_time.record(duration);
    }

    /// A failed attempt that will be retried
    pub async fn record_retry(&self, queue: &str, timed_out: bool) {
        let mut state = self.state.write().await;
        state.snapshot.total_retried += 1;
        state.snapshot.currently_running = state.snapshot.currently_running.saturating_sub(1);
        if timed_out {
            state.snapshot.total_timeouts += 1;
        }

        let acc = state.queues.entry(queue.to_string()).or_default();
        acc.metrics.retried += 1;
        if timed_out {
            acc.metrics.timed_out += 1;
        }
    }

    /// A terminal failure. `was_running` is false for executions that failed
    /// before dispatch.
    pub async fn record_failed(
        &self,
        queue: &str,
        job_type: &str,
        timed_out: bool,
        was_running: bool,
    ) {
        let mut state = self.state.write().await;
        state.snapshot.total_failed += 1;
        if was_running {
            state.snapshot.currently_running = state.snapshot.currently_running.saturating_sub(1);
        }
        if timed_out {
            state.snapshot.total_timeouts += 1;
        }

        let acc = state.queues.entry(queue.to_string()).or_default();
        acc.metrics.failed += 1;
        if timed_out {
            acc.metrics.timed_out += 1;
        }

        state
            .job_types
            .entry(job_type.to_string())
            .or_default()
            .metrics
            .failed += 1;
    }

    pub async fn record_cancelled(&self, count: usize) {
        self.state.write().await.snapshot.total_cancelled += count as u64;
    }

    /// A running attempt whose job was cancelled before it settled
    pub async fn record_cancelled_attempt(&self, queue: &str) {
        let mut state = self.state.write().await;
        state.snapshot.total_cancelled += 1;
        state.snapshot.currently_running = state.snapshot.currently_running.saturating_sub(1);
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .metrics
            .cancelled += 1;
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.read().await;
        let mut snapshot = state.snapshot.clone();
        snapshot.average_execution_time = state.execution_time.get();
        snapshot.queues = state
            .queues
            .iter()
            .map(|(name, acc)| {
                let mut metrics = acc.metrics.clone();
                metrics.average_execution_time = acc.execution_time.get();
                metrics.average_queue_wait = acc.queue_wait.get();
                (name.clone(), metrics)
            })
            .collect();
        snapshot.job_types = state
            .job_types
            .iter()
            .map(|(name, acc)| {
                let mut metrics = acc.metrics.clone();
                metrics.average_execution_time = acc.execution_time.get();
                (name.clone(), metrics)
            })
            .collect();
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_moving_average_seeds_then_smooths() {
        let mut avg = MovingAverage::default();
        assert_eq!(avg.get(), None);

        avg.record(Duration::from_secs(10));
        assert_eq!(avg.get(), Some(Duration::from_secs(10)));

        avg.record(Duration::from_secs(20));
        let secs = avg.get().unwrap().as_secs_f64();
        assert!((secs - 11.0).abs() < 1e-9, "{secs}");
    }

    #[tokio::test]
    async fn test_counters_follow_outcomes() {
        let metrics = MetricsAggregator::new();
        metrics.record_submitted().await;
        metrics
            .record_started("critical", Some(Duration::from_millis(5)))
            .await;
        metrics.record_retry("critical", true).await;
        metrics.record_started("critical", None).await;
        metrics
            .record_completed("critical", "webhook", Duration::from_millis(200))
            .await;

        let snapshot = metrics.snapshot().await;
        assert_eq!(snapshot.total_submitted, 1);
        assert_eq!(snapshot.total_started, 2);
        assert_eq!(snapshot.total_completed, 1);
        assert_eq!(snapshot.total_retried, 1);
        assert_eq!(snapshot.total_timeouts, 1);
        assert_eq!(snapshot.currently_running, 0);
        assert_eq!(snapshot.average_execution_time, Some(Duration::from_millis(200)));

        let critical = &snapshot.queues["critical"];
        assert_eq!(critical.completed, 1);
        assert_eq!(critical.timed_out, 1);
        assert_eq!(critical.average_queue_wait, Some(Duration::from_millis(5)));
        assert_eq!(snapshot.job_types["webhook"].completed, 1);
    }

    #[tokio::test]
    async fn test_cancelled_attempt_releases_running_gauge() {
        let metrics = MetricsAggregator::new();
        metrics.record_started("normal", None).await;
        metrics.record_cancelled(2).await;
        metrics.record_cancelled_attempt("normal").await;

        let snapshot = metrics.snapshot().await;
        assert_eq!(snapshot.total_cancelled, 3);
        assert_eq!(snapshot.currently_running, 0);
        assert_eq!(snapshot.queues["normal"].cancelled, 1);
        assert_eq!(snapshot.total_failed, 0);
    }
}
