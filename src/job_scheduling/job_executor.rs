//! Execution runner: runs one dispatched attempt against its processor

use super::events::{EventBus, JobEvent};
use super::job_queue::QueueConfig;
use super::job_scheduler::JobScheduler;
use super::job_store::JobStore;
use super::metrics::MetricsAggregator;
use super::processor::ProcessorRegistry;
use super::retry_policy::{self, GiveUpReason, RetryDecision};
use super::types::{ExecutionStatus, JobDefinition, JobExecution, LogLevel, RetryConfig};
use crate::config::RetryDefaults;
use crate::errors::{EngineError, ExecutionError, ExecutionErrorKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// An execution claimed by the dispatcher, ready to run
#[derive(Debug, Clone)]
pub(crate) struct Dispatched {
    pub job: Arc<JobDefinition>,
    pub execution: JobExecution,
    pub queue: QueueConfig,
    /// The job's timer token; retry delays are armed on it
    pub token: CancellationToken,
}

/// Service responsible for running dispatched executions
#[derive(Clone)]
pub(crate) struct JobExecutor {
    store: Arc<JobStore>,
    processors: Arc<ProcessorRegistry>,
    scheduler: JobScheduler,
    metrics: Arc<MetricsAggregator>,
    events: EventBus,
    retry_defaults: RetryDefaults,
    tracker: TaskTracker,
}

impl JobExecutor {
    pub fn new(
        store: Arc<JobStore>,
        processors: Arc<ProcessorRegistry>,
        scheduler: JobScheduler,
        metrics: Arc<MetricsAggregator>,
        events: EventBus,
        retry_defaults: RetryDefaults,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            store,
            processors,
            scheduler,
            metrics,
            events,
            retry_defaults,
            tracker,
        }
    }

    /// Run a dispatched execution on its own tracked task
    pub fn spawn(&self, dispatched: Dispatched) {
        let executor = self.clone();
        self.tracker.spawn(async move { executor.run(dispatched).await });
    }

    /// Retry config in force for a job: its own, else derived from its queue
    fn effective_retry(&self, job: &JobDefinition, queue: &QueueConfig) -> RetryConfig {
        job.retry
            .clone()
            .unwrap_or_else(|| self.retry_defaults.for_queue(queue))
    }

    pub async fn run(&self, dispatched: Dispatched) {
        let Dispatched {
            job,
            execution,
            queue,
            token,
        } = dispatched;
        let timeout = job.timeout.unwrap_or(queue.default_timeout);

        let Some(processor) = self.processors.get(&job.job_type).await else {
            let error = ExecutionError::processing(format!(
                "No processor registered for job type '{}'",
                job.job_type
            ));
            self.handle_failure(&job, &execution, &queue, &token, error, Duration::ZERO)
                .await;
            return;
        };

        debug!(
            "Running job {} ({}) attempt {} on worker {} with timeout {:?}",
            job.id,
            job.job_type,
            execution.attempt,
            execution.worker_id.as_deref().unwrap_or("-"),
            timeout
        );

        let started = Instant::now();
        let handle = {
            let job = job.clone();
            let execution = execution.clone();
            tokio::spawn(async move { processor.process(&job, &execution).await })
        };

        // On timeout the JoinHandle is dropped, which detaches the processor
        // task instead of aborting it
        let outcome = match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(ExecutionError::from_processor(&e)),
            Ok(Err(join_error)) => Err(ExecutionError::panic(format!(
                "Processor task failed: {join_error}"
            ))),
            Err(_) => Err(ExecutionError::timeout(
                EngineError::Timeout { timeout }.to_string(),
            )),
        };
        let duration = started.elapsed();

        match outcome {
            Ok(result) => self.handle_success(&job, &execution, result, duration).await,
            Err(error) => {
                self.handle_failure(&job, &execution, &queue, &token, error, duration)
                    .await
            }
        }
    }

    async fn handle_success(
        &self,
        job: &JobDefinition,
        execution: &JobExecution,
        result: serde_json::Value,
        duration: Duration,
    ) {
        let settled = self.store.write().await.settle(
            execution.id,
            ExecutionStatus::Completed,
            |record| {
                record.result = Some(result);
                record.metrics.duration = Some(duration);
                record.log(
                    LogLevel::Info,
                    format!("Attempt {} completed in {:?}", record.attempt, duration),
                );
            },
        );
        if settled.is_none() {
            warn!("Execution {} vanished before completion was recorded", execution.id);
            return;
        }

        info!(
            "Job {} ({}) completed on attempt {} in {:?}",
            job.id, job.job_type, execution.attempt, duration
        );
        self.metrics
            .record_completed(&execution.queue, &job.job_type.to_string(), duration)
            .await;
        self.events.publish(JobEvent::Completed {
            job_id: job.id,
            execution_id: execution.id,
            attempt: execution.attempt,
            duration,
        });
    }

    async fn handle_failure(
        &self,
        job: &JobDefinition,
        execution: &JobExecution,
        queue: &QueueConfig,
        token: &CancellationToken,
        error: ExecutionError,
        duration: Duration,
    ) {
        let retry = self.effective_retry(job, queue);
        let timed_out = error.kind == ExecutionErrorKind::Timeout;

        let decision = {
            let mut store = self.store.write().await;
            let cancelled = store.job(&job.id).map_or(true, |stored| stored.cancelled);

            // Shutdown cancels every job token, so no retry timer could fire
            let decision = if cancelled {
                RetryDecision::GiveUp(GiveUpReason::Cancelled)
            } else if token.is_cancelled() {
                RetryDecision::GiveUp(GiveUpReason::ShuttingDown)
            } else {
                retry_policy::decide(&retry, execution.attempt, error.recoverable)
            };

            match decision {
                RetryDecision::Retry { delay, .. } => {
                    let settled =
                        store.settle(execution.id, ExecutionStatus::Retrying, |record| {
                            record.error = Some(error.clone());
                            record.metrics.duration = Some(duration);
                            record.metrics.retry_delay = Some(delay);
                            record.log(
                                LogLevel::Warn,
                                format!(
                                    "Attempt {} failed, retrying in {:?}: {}",
                                    record.attempt, delay, error.message
                                ),
                            );
                        });
                    if settled.is_some() {
                        store.await_retry(execution.run_id, execution.id);
                    }
                }
                RetryDecision::GiveUp(GiveUpReason::Cancelled) => {
                    store.settle(execution.id, ExecutionStatus::Cancelled, |record| {
                        record.error = Some(error.clone());
                        record.metrics.duration = Some(duration);
                        record.log(
                            LogLevel::Info,
                            format!(
                                "Attempt {} cancelled while running: {}",
                                record.attempt, error.message
                            ),
                        );
                    });
                }
                RetryDecision::GiveUp(_) => {
                    store.settle(execution.id, ExecutionStatus::Failed, |record| {
                        record.error = Some(error.clone());
                        record.metrics.duration = Some(duration);
                        record.log(
                            LogLevel::Error,
                            format!(
                                "Attempt {} failed permanently: {}",
                                record.attempt, error.message
                            ),
                        );
                    });
                }
            }
            decision
        };

        match decision {
            RetryDecision::Retry {
                delay,
                next_attempt,
            } => {
                warn!(
                    "Job {} ({}) attempt {}/{} failed, retrying in {:?}: {}",
                    job.id,
                    job.job_type,
                    execution.attempt,
                    retry.max_attempts,
                    delay,
                    error.message
                );
                self.scheduler
                    .schedule_retry(job.id, execution.run_id, next_attempt, delay, token);
                self.metrics.record_retry(&execution.queue, timed_out).await;
                self.events.publish(JobEvent::Retrying {
                    job_id: job.id,
                    execution_id: execution.id,
                    attempt: execution.attempt,
                    delay,
                    error,
                });
            }
            RetryDecision::GiveUp(GiveUpReason::Cancelled) => {
                info!(
                    "Job {} ({}) was cancelled during attempt {}: {}",
                    job.id, job.job_type, execution.attempt, error.message
                );
                self.metrics.record_cancelled_attempt(&execution.queue).await;
            }
            RetryDecision::GiveUp(reason) => {
                error!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempt = execution.attempt,
                    ?reason,
                    "Job failed permanently after {} attempt(s): {}",
                    execution.attempt,
                    error.message
                );
                self.metrics
                    .record_failed(&execution.queue, &job.job_type.to_string(), timed_out, true)
                    .await;
                self.events.publish(JobEvent::Failed {
                    job_id: job.id,
                    execution_id: execution.id,
                    attempt: execution.attempt,
                    error,
                });
            }
        }
    }
}
