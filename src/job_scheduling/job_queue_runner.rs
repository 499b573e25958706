//! Dispatcher: the tick loop that hands pending executions to the runner

use super::events::{EventBus, JobEvent};
use super::job_executor::{Dispatched, JobExecutor};
use super::job_queue::QueueRegistry;
use super::job_store::{dependency_error, DependencyState, JobStore};
use super::metrics::MetricsAggregator;
use super::types::{ExecutionStatus, JobDefinition, JobExecution, LogLevel};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Service responsible for dispatching pending executions
pub(crate) struct JobQueueRunner {
    store: Arc<JobStore>,
    queues: Arc<QueueRegistry>,
    executor: JobExecutor,
    metrics: Arc<MetricsAggregator>,
    events: EventBus,
    global_max_concurrency: Option<usize>,
    /// Recent dispatch instants per rate-limited queue. Holding this lock
    /// for the whole tick also serializes ticks.
    dispatch_windows: Mutex<HashMap<String, VecDeque<Instant>>>,
    worker_seq: AtomicU64,
}

impl JobQueueRunner {
    pub fn new(
        store: Arc<JobStore>,
        queues: Arc<QueueRegistry>,
        executor: JobExecutor,
        metrics: Arc<MetricsAggregator>,
        events: EventBus,
        global_max_concurrency: Option<usize>,
    ) -> Self {
        Self {
            store,
            queues,
            executor,
            metrics,
            events,
            global_max_concurrency,
            dispatch_windows: Mutex::new(HashMap::new()),
            worker_seq: AtomicU64::new(0),
        }
    }

    /// Run the dispatch loop until `cancellation_token` fires
    pub async fn run(&self, cancellation_token: CancellationToken, tick_interval: Duration) {
        info!("Starting job dispatcher (tick interval: {:?})", tick_interval);
        let mut ticker = interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancellation_token.cancelled() => {
                    info!("Job dispatcher received cancellation signal");
                    break;
                }
                _ = ticker.tick() => {
                    let dispatched = self.tick().await;
                    if dispatched > 0 {
                        debug!("Dispatched {} execution(s)", dispatched);
                    }
                }
            }
        }

        info!("Job dispatcher stopped");
    }

    /// One dispatch pass over every queue. Returns how many executions were
    /// handed to the runner.
    pub async fn tick(&self) -> usize {
        let mut windows = self.dispatch_windows.lock().await;
        let queues = self.queues.dispatch_order().await;
        let now = Instant::now();

        let mut dispatched = Vec::new();
        let mut dependency_failures: Vec<(Arc<JobDefinition>, JobExecution)> = Vec::new();

        {
            let mut store = self.store.write().await;

            for queue in &queues {
                if queue.paused {
                    continue;
                }

                let mut spare = queue
                    .max_concurrency
                    .saturating_sub(store.running_in_queue(&queue.name));

                if let Some(limit) = &queue.rate_limit {
                    let window = windows.entry(queue.name.clone()).or_default();
                    while window
                        .front()
                        .is_some_and(|at| now.duration_since(*at) >= limit.per)
                    {
                        window.pop_front();
                    }
                    spare = spare.min((limit.max_jobs as usize).saturating_sub(window.len()));
                }

                if let Some(global) = self.global_max_concurrency {
                    spare = spare.min(global.saturating_sub(store.running_total()));
                }

                if spare == 0 {
                    continue;
                }

                for execution_id in store.pending_ids(&queue.name) {
                    if spare == 0 {
                        break;
                    }

                    let Some(job) = store
                        .execution(&execution_id)
                        .and_then(|execution| store.job(&execution.job_id))
                    else {
                        continue;
                    };
                    let definition = job.definition.clone();
                    let token = job.token.clone();

                    if let Some(max) = definition.max_concurrency {
                        if store.running_for_job(&definition.id) >= max {
                            continue;
                        }
                    }

                    match store.dependency_state(&definition) {
                        DependencyState::Satisfied => {}
                        DependencyState::Waiting => continue,
                        DependencyState::Failed(dependency) => {
                            let error = dependency_error(dependency);
                            let failed =
                                store.settle(execution_id, ExecutionStatus::Failed, |record| {
                                    record.log(LogLevel::Error, error.message.clone());
                                    record.error = Some(error);
                                });
                            if let Some(failed) = failed {
                                dependency_failures.push((definition, failed));
                            }
                            continue;
                        }
                    }

                    let worker_id = format!(
                        "{}-{}",
                        queue.name,
                        self.worker_seq.fetch_add(1, Ordering::Relaxed) + 1
                    );
                    if let Some(execution) = store.claim(execution_id, worker_id) {
                        spare -= 1;
                        if queue.rate_limit.is_some() {
                            windows.entry(queue.name.clone()).or_default().push_back(now);
                        }
                        dispatched.push(Dispatched {
                            job: definition,
                            execution,
                            queue: queue.clone(),
                            token,
                        });
                    }
                }
            }
        }
        drop(windows);

        for (job, execution) in dependency_failures {
            let message = execution
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_default();
            error!(
                job_id = %job.id,
                "Job failed permanently before dispatch: {}",
                message
            );
            self.metrics
                .record_failed(&execution.queue, &job.job_type.to_string(), false, false)
                .await;
            if let Some(error) = execution.error {
                self.events.publish(JobEvent::Failed {
                    job_id: job.id,
                    execution_id: execution.id,
                    attempt: execution.attempt,
                    error,
                });
            }
        }

        let count = dispatched.len();
        for dispatched in dispatched {
            let execution = &dispatched.execution;
            let worker_id = execution.worker_id.clone().unwrap_or_default();
            debug!(
                "Dispatching job {} attempt {} from queue '{}' to worker {}",
                dispatched.job.id, execution.attempt, execution.queue, worker_id
            );
            self.metrics
                .record_started(&execution.queue, execution.metrics.queue_wait)
                .await;
            self.events.publish(JobEvent::Started {
                job_id: dispatched.job.id,
                execution_id: execution.id,
                queue: execution.queue.clone(),
                attempt: execution.attempt,
                worker_id,
            });
            self.executor.spawn(dispatched);
        }

        count
    }
}
