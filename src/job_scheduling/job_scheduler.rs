//! Job scheduler: turns delays and schedules into future enqueues
//!
//! Every armed fire owns one SCHEDULED execution record. When its timer
//! fires the record becomes PENDING and, for recurring schedules, the next
//! fire is armed with a fresh record. Retry backoff runs on the same
//! cancellable timers.

use super::cron::CronEvaluator;
use super::events::{EventBus, JobEvent};
use super::job_store::JobStore;
use super::timer;
use super::types::{JobDefinition, ScheduleKind, ScheduleSpec};
use crate::errors::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// When a once-schedule fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnceAt {
    After(Duration),
    At(DateTime<Utc>),
}

/// Parse a duration given as a humantime string (`"30s"`, `"1m 30s"`) or a
/// bare number of milliseconds
pub fn parse_duration_expression(expression: &str) -> EngineResult<Duration> {
    let expression = expression.trim();
    if let Ok(millis) = expression.parse::<u64>() {
        return Ok(Duration::from_millis(millis));
    }
    humantime::parse_duration(expression).map_err(|e| {
        EngineError::configuration(format!("Invalid duration '{expression}': {e}"))
    })
}

/// Parse a once-schedule: a relative duration or an RFC 3339 timestamp
pub fn parse_once_expression(expression: &str) -> EngineResult<OnceAt> {
    if let Ok(at) = DateTime::parse_from_rfc3339(expression.trim()) {
        return Ok(OnceAt::At(at.with_timezone(&Utc)));
    }
    parse_duration_expression(expression)
        .map(OnceAt::After)
        .map_err(|_| {
            EngineError::configuration(format!(
                "Invalid once schedule '{expression}': expected a duration or RFC 3339 timestamp"
            ))
        })
}

/// Arms schedules, delays and retry timers
#[derive(Clone)]
pub(crate) struct JobScheduler {
    store: Arc<JobStore>,
    events: EventBus,
    cron: Arc<dyn CronEvaluator>,
}

impl JobScheduler {
    pub fn new(store: Arc<JobStore>, events: EventBus, cron: Arc<dyn CronEvaluator>) -> Self {
        Self { store, events, cron }
    }

    /// Reject schedules that could never be armed
    pub fn validate(&self, job: &JobDefinition) -> EngineResult<()> {
        let Some(schedule) = &job.schedule else {
            return Ok(());
        };

        if let (Some(start), Some(end)) = (schedule.start_at, schedule.end_at) {
            if start > end {
                return Err(EngineError::configuration(
                    "schedule start_at must not be after end_at",
                ));
            }
        }

        match schedule.kind {
            ScheduleKind::Once => parse_once_expression(&schedule.expression).map(|_| ()),
            ScheduleKind::Interval => {
                let period = parse_duration_expression(&schedule.expression)?;
                if period.is_zero() {
                    return Err(EngineError::configuration(
                        "interval schedule period must be greater than zero",
                    ));
                }
                Ok(())
            }
            ScheduleKind::Cron => self
                .cron
                .validate(&schedule.expression, schedule.timezone.as_deref()),
        }
    }

    /// Arm the first fire of a deferred job and keep re-arming it until the
    /// schedule is exhausted or the job is cancelled
    pub async fn schedule(&self, job: Arc<JobDefinition>, token: CancellationToken) {
        let first = match &job.schedule {
            Some(schedule) => self.next_fire(&job, schedule, true),
            None => Ok(job.delay.map(|delay| (delay, fire_time_after(Utc::now(), delay)))),
        };

        let (delay, fire_at) = match first {
            Ok(Some(first)) => first,
            Ok(None) => {
                info!("Job {} has no fire time inside its schedule window", job.id);
                return;
            }
            Err(e) => {
                warn!("Failed to arm schedule for job {}: {}", job.id, e);
                return;
            }
        };

        let Some(execution_id) = self.arm(&job, delay, fire_at).await else {
            return;
        };

        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.run_schedule(job, token, delay, execution_id).await;
        });
    }

    async fn run_schedule(
        self,
        job: Arc<JobDefinition>,
        token: CancellationToken,
        mut delay: Duration,
        mut execution_id: Uuid,
    ) {
        loop {
            if !timer::sleep_or_cancel(&token, delay).await {
                debug!("Schedule of job {} cancelled", job.id);
                return;
            }
            if !self.fire(&job, execution_id).await {
                return;
            }

            let Some(schedule) = &job.schedule else {
                return;
            };
            let (next_delay, fire_at) = match self.next_fire(&job, schedule, false) {
                Ok(Some(next)) => next,
                Ok(None) => {
                    debug!("Schedule of job {} is exhausted", job.id);
                    return;
                }
                Err(e) => {
                    warn!("Failed to re-arm schedule for job {}: {}", job.id, e);
                    return;
                }
            };

            match self.arm(&job, next_delay, fire_at).await {
                Some(next_execution) => {
                    delay = next_delay;
                    execution_id = next_execution;
                }
                None => return,
            }
        }
    }

    /// Delay and wall-clock time of the next fire, or `None` when the
    /// schedule is exhausted
    fn next_fire(
        &self,
        job: &JobDefinition,
        schedule: &ScheduleSpec,
        first: bool,
    ) -> EngineResult<Option<(Duration, DateTime<Utc>)>> {
        let now = Utc::now();
        let not_before = schedule.start_at.filter(|start| *start > now);

        let next = match schedule.kind {
            ScheduleKind::Once if !first => None,
            ScheduleKind::Once => Some(match parse_once_expression(&schedule.expression)? {
                OnceAt::After(delay) => (delay, fire_time_after(now, delay)),
                OnceAt::At(at) => (timer::delay_until(at), at),
            }),
            ScheduleKind::Interval => {
                let period = parse_duration_expression(&schedule.expression)?;
                Some((period, fire_time_after(now, period)))
            }
            ScheduleKind::Cron => self
                .cron
                .next_fire_time(
                    &schedule.expression,
                    not_before.unwrap_or(now),
                    schedule.timezone.as_deref(),
                )?
                .map(|at| (timer::delay_until(at), at)),
        };

        let next = next.map(|(delay, fire_at)| match not_before {
            Some(start) if fire_at < start => (timer::delay_until(start), start),
            _ => (delay, fire_at),
        });

        Ok(next.filter(|(_, fire_at)| match schedule.end_at {
            Some(end) if *fire_at > end => {
                debug!("Schedule window of job {} ended at {}", job.id, end);
                false
            }
            _ => true,
        }))
    }

    /// Create the SCHEDULED record of the next fire
    async fn arm(
        &self,
        job: &JobDefinition,
        delay: Duration,
        fire_at: DateTime<Utc>,
    ) -> Option<Uuid> {
        let execution = self
            .store
            .write()
            .await
            .create_scheduled(job.id, Uuid::new_v4(), fire_at);
        let Some(execution) = execution else {
            debug!("Job {} was cancelled before its next fire could be armed", job.id);
            return None;
        };

        debug!(
            "Armed job {} to fire at {} (in {:?})",
            job.id,
            fire_at.format("%Y-%m-%d %H:%M:%S%.3f UTC"),
            delay
        );
        self.events.publish(JobEvent::Scheduled {
            job_id: job.id,
            execution_id: execution.id,
            fire_at,
        });
        Some(execution.id)
    }

    /// Promote a fired SCHEDULED record. Returns `false` once the job has
    /// been cancelled.
    async fn fire(&self, job: &JobDefinition, execution_id: Uuid) -> bool {
        let promoted = self.store.write().await.promote_scheduled(execution_id);
        let Some(execution) = promoted else {
            debug!("Skipping fire of cancelled job {}", job.id);
            return false;
        };

        info!("Job {} fired into queue '{}'", job.id, execution.queue);
        self.events.publish(JobEvent::Enqueued {
            job_id: job.id,
            execution_id,
            queue: execution.queue,
            attempt: execution.attempt,
        });
        true
    }

    /// Re-enqueue attempt `next_attempt` of a run after `delay`
    pub fn schedule_retry(
        &self,
        job_id: Uuid,
        run_id: Uuid,
        next_attempt: u32,
        delay: Duration,
        token: &CancellationToken,
    ) {
        let store = self.store.clone();
        let events = self.events.clone();
        timer::arm_after(token, delay, move || async move {
            let execution = {
                let mut store = store.write().await;
                match store.take_retry(&run_id) {
                    Some(_) => store.create_pending(job_id, run_id, next_attempt),
                    None => None,
                }
            };

            match execution {
                Some(execution) => {
                    debug!(
                        "Re-enqueued job {} for attempt {} in queue '{}'",
                        job_id, next_attempt, execution.queue
                    );
                    events.publish(JobEvent::Enqueued {
                        job_id,
                        execution_id: execution.id,
                        queue: execution.queue,
                        attempt: next_attempt,
                    });
                }
                None => debug!("Retry of job {} dropped after cancellation", job_id),
            }
        });
    }
}

fn fire_time_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
