//! Engine facade: the public operations of the job engine

use super::cron::{CronEvaluator, CronScheduleEvaluator};
use super::events::{EventBus, JobEvent};
use super::job_executor::JobExecutor;
use super::job_queue::{queue_for_job, QueueConfig, QueueRegistry, QueueStatus};
use super::job_queue_runner::JobQueueRunner;
use super::job_scheduler::JobScheduler;
use super::job_store::JobStore;
use super::metrics::{MetricsAggregator, MetricsSnapshot};
use super::processor::{JobProcessor, ProcessorRegistry};
use super::types::{JobDefinition, JobExecution, JobType};
use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult};
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outcome of [`JobEngine::shutdown`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    /// Executions running when shutdown began
    pub in_flight: usize,
    /// Executions that finished within the grace period
    pub drained: usize,
    /// Executions still running when the grace period ran out
    pub abandoned: usize,
}

struct DispatchLoop {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// In-memory priority job scheduler and execution engine
///
/// ```no_run
/// use job_engine::{EngineConfig, EngineResult, JobDefinition, JobEngine, JobPriority, JobType};
///
/// # use std::sync::Arc;
/// # async fn example(processor: Arc<dyn job_engine::JobProcessor>) -> EngineResult<()> {
/// let engine = JobEngine::new(EngineConfig::default())?;
/// engine.register_processor(JobType::MonitorCheck, processor).await?;
/// engine.start(None).await?;
///
/// let job = JobDefinition::new(JobType::MonitorCheck).with_priority(JobPriority::Critical);
/// let job_id = engine.submit(job).await?;
/// let history = engine.get_execution_history(job_id).await;
/// # Ok(())
/// # }
/// ```
pub struct JobEngine {
    config: EngineConfig,
    store: Arc<JobStore>,
    queues: Arc<QueueRegistry>,
    processors: Arc<ProcessorRegistry>,
    scheduler: JobScheduler,
    runner: Arc<JobQueueRunner>,
    metrics: Arc<MetricsAggregator>,
    events: EventBus,
    tracker: TaskTracker,
    root_token: CancellationToken,
    dispatch: Mutex<Option<DispatchLoop>>,
    shutting_down: AtomicBool,
}

impl JobEngine {
    /// Create an engine using the default cron evaluator
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        Self::with_cron_evaluator(config, Arc::new(CronScheduleEvaluator))
    }

    /// Create an engine with a custom cron evaluator
    pub fn with_cron_evaluator(
        config: EngineConfig,
        cron: Arc<dyn CronEvaluator>,
    ) -> EngineResult<Self> {
        config.validate()?;

        let store = Arc::new(JobStore::new());
        let queues = Arc::new(QueueRegistry::new(config.queue_configs())?);
        let processors = Arc::new(ProcessorRegistry::new());
        let metrics = Arc::new(MetricsAggregator::new());
        let events = EventBus::new(config.event_buffer);
        let tracker = TaskTracker::new();

        let scheduler = JobScheduler::new(store.clone(), events.clone(), cron);
        let executor = JobExecutor::new(
            store.clone(),
            processors.clone(),
            scheduler.clone(),
            metrics.clone(),
            events.clone(),
            config.retry.clone(),
            tracker.clone(),
        );
        let runner = Arc::new(JobQueueRunner::new(
            store.clone(),
            queues.clone(),
            executor,
            metrics.clone(),
            events.clone(),
            config.global_max_concurrency,
        ));

        Ok(Self {
            config,
            store,
            queues,
            processors,
            scheduler,
            runner,
            metrics,
            events,
            tracker,
            root_token: CancellationToken::new(),
            dispatch: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn register_processor(
        &self,
        job_type: JobType,
        processor: Arc<dyn JobProcessor>,
    ) -> EngineResult<()> {
        self.processors.register(job_type, processor).await
    }

    pub async fn register_queue(&self, config: QueueConfig) -> EngineResult<()> {
        self.queues.register(config).await
    }

    /// Validate and accept a job. Immediate jobs are enqueued PENDING;
    /// delayed and scheduled jobs are armed.
    pub async fn submit(&self, job: JobDefinition) -> EngineResult<Uuid> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }

        if !self.processors.contains(&job.job_type).await {
            return Err(EngineError::processing(format!(
                "No processor registered for job type '{}'",
                job.job_type
            )));
        }

        let queue = queue_for_job(&job).to_string();
        if !self.queues.contains(&queue).await {
            return Err(EngineError::processing(format!(
                "Queue '{queue}' does not exist"
            )));
        }

        if job.timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(EngineError::configuration("job timeout must be greater than zero"));
        }
        if job.retry.as_ref().is_some_and(|retry| retry.max_attempts == 0) {
            return Err(EngineError::configuration(
                "retry max_attempts must be at least 1",
            ));
        }
        if job.max_concurrency == Some(0) {
            return Err(EngineError::configuration(
                "job max_concurrency must be greater than zero",
            ));
        }
        self.scheduler.validate(&job)?;

        let job_id = job.id;
        let deferred = job.is_deferred();
        let token = self.root_token.child_token();

        let (job, enqueued) = {
            let mut store = self.store.write().await;

            if store.contains_job(&job_id) {
                return Err(EngineError::configuration(format!(
                    "Job {job_id} has already been submitted"
                )));
            }
            if let Some(unknown) = job.depends_on.iter().find(|dep| !store.contains_job(dep)) {
                return Err(EngineError::processing(format!(
                    "Unknown dependency {unknown}"
                )));
            }

            let job = store.insert_job(job, queue.clone(), token.clone());
            let enqueued = if deferred {
                None
            } else {
                store.create_pending(job_id, Uuid::new_v4(), 1)
            };
            (job, enqueued)
        };

        info!(
            "Submitted job {} ({}, priority {}) to queue '{}'",
            job_id, job.job_type, job.priority, queue
        );
        self.metrics.record_submitted().await;
        self.events.publish(JobEvent::Submitted {
            job_id,
            queue: queue.clone(),
        });

        if let Some(execution) = enqueued {
            self.events.publish(JobEvent::Enqueued {
                job_id,
                execution_id: execution.id,
                queue,
                attempt: execution.attempt,
            });
        }
        if deferred {
            self.scheduler.schedule(job, token).await;
        }

        Ok(job_id)
    }

    /// Cancel a job: stop its timers and every execution that has not
    /// started. Running executions finish but are not retried. Returns
    /// whether the job exists.
    pub async fn cancel(&self, job_id: Uuid) -> bool {
        let cancelled = self.store.write().await.cancel_job(&job_id);
        let Some(cancelled) = cancelled else {
            return false;
        };

        info!(
            "Cancelled job {} ({} execution(s) stopped)",
            job_id,
            cancelled.len()
        );
        self.metrics.record_cancelled(cancelled.len()).await;
        self.events.publish(JobEvent::Cancelled {
            job_id,
            executions: cancelled.len(),
        });
        true
    }

    /// Stop dispatching from a queue. Returns whether the queue exists.
    pub async fn pause_queue(&self, name: &str) -> bool {
        let exists = self.queues.pause(name).await;
        if exists {
            self.events.publish(JobEvent::QueuePaused {
                queue: name.to_string(),
            });
        }
        exists
    }

    /// Resume dispatching from a queue. Returns whether the queue exists.
    pub async fn resume_queue(&self, name: &str) -> bool {
        let exists = self.queues.resume(name).await;
        if exists {
            self.events.publish(JobEvent::QueueResumed {
                queue: name.to_string(),
            });
        }
        exists
    }

    /// Start the dispatch loop; `None` uses the configured tick interval
    pub async fn start(&self, tick_interval: Option<Duration>) -> EngineResult<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }

        let tick_interval = tick_interval.unwrap_or(self.config.tick_interval);
        if tick_interval.is_zero() {
            return Err(EngineError::configuration("tick interval must be greater than zero"));
        }

        let mut dispatch = self.dispatch.lock().await;
        if dispatch.is_some() {
            warn!("Job engine already started");
            return Ok(());
        }

        let token = self.root_token.child_token();
        let runner = self.runner.clone();
        let loop_token = token.clone();
        let handle = tokio::spawn(async move { runner.run(loop_token, tick_interval).await });
        *dispatch = Some(DispatchLoop { token, handle });

        info!("Job engine started");
        Ok(())
    }

    /// Stop the dispatch loop. Timers keep arming work and in-flight
    /// executions keep running.
    pub async fn stop(&self) {
        let dispatch = self.dispatch.lock().await.take();
        if let Some(DispatchLoop { token, handle }) = dispatch {
            token.cancel();
            if let Err(e) = handle.await {
                warn!("Dispatch loop ended abnormally: {}", e);
            }
            info!("Job engine stopped");
        }
    }

    /// Run one dispatch pass immediately
    pub async fn tick(&self) -> usize {
        if self.shutting_down.load(Ordering::SeqCst) {
            return 0;
        }
        self.runner.tick().await
    }

    /// Every recorded execution of a job, most recent first
    pub async fn get_execution_history(&self, job_id: Uuid) -> Vec<JobExecution> {
        self.store.read().await.history(&job_id)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Option<JobDefinition> {
        self.store
            .read()
            .await
            .job(&job_id)
            .map(|job| job.definition.as_ref().clone())
    }

    pub async fn get_queue_status(&self, name: &str) -> Option<QueueStatus> {
        let queue = self.queues.get(name).await?;
        let (counts, pending_jobs) = {
            let store = self.store.read().await;
            (store.queue_counts(name), store.pending_jobs(name))
        };

        let mut estimated_backlog = Duration::ZERO;
        for job in pending_jobs {
            if let Some(processor) = self.processors.get(&job.job_type).await {
                estimated_backlog =
                    estimated_backlog.saturating_add(processor.estimated_duration(&job));
            }
        }

        Some(QueueStatus {
            name: queue.name,
            paused: queue.paused,
            max_concurrency: queue.max_concurrency,
            max_retries: queue.max_retries,
            default_timeout: queue.default_timeout,
            rate_limit: queue.rate_limit,
            pending: counts.pending,
            running: counts.running,
            scheduled: counts.scheduled,
            retrying: counts.retrying,
            estimated_backlog,
        })
    }

    /// Status of every queue in dispatch order
    pub async fn list_queues(&self) -> Vec<QueueStatus> {
        let mut statuses = Vec::new();
        for queue in self.queues.dispatch_order().await {
            if let Some(status) = self.get_queue_status(&queue.name).await {
                statuses.push(status);
            }
        }
        statuses
    }

    pub async fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Remove settled execution records that ended more than `older_than`
    /// ago. Returns the number removed.
    pub async fn cleanup(&self, older_than: Duration) -> usize {
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        self.store.write().await.cleanup(cutoff)
    }

    /// Stop dispatching and all timers, then wait up to `grace` (the
    /// configured grace period when `None`) for in-flight executions.
    /// Executions still running afterwards are abandoned and their records
    /// left as they are.
    pub async fn shutdown(&self, grace: Option<Duration>) -> ShutdownReport {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("Job engine already shut down");
            return ShutdownReport::default();
        }

        let grace = grace.unwrap_or(self.config.shutdown_grace_period);
        info!("Shutting down job engine (grace period: {:?})", grace);

        self.stop().await;
        self.root_token.cancel();
        self.tracker.close();

        let in_flight = self.tracker.len();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                "Grace period elapsed with {} execution(s) still running, abandoning them",
                self.tracker.len()
            );
        }
        let abandoned = self.tracker.len();

        let report = ShutdownReport {
            in_flight,
            drained: in_flight.saturating_sub(abandoned),
            abandoned,
        };
        info!(
            "Job engine shut down ({} drained, {} abandoned)",
            report.drained, report.abandoned
        );
        report
    }
}
