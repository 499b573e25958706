//! In-memory job and execution store
//!
//! Holds immutable job definitions and mutable execution records. All status
//! changes go through [`StoreState`] methods called by the scheduler,
//! dispatcher and runner while they hold the store's write lock; the public
//! engine API only ever receives clones.

use super::types::{ExecutionStatus, JobDefinition, JobExecution};
use crate::errors::ExecutionError;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// A submitted job and its bookkeeping
#[derive(Debug)]
pub(crate) struct StoredJob {
    pub definition: Arc<JobDefinition>,
    pub queue: String,
    /// Cancels every timer armed for this job
    pub token: CancellationToken,
    pub cancelled: bool,
    pub completed_runs: u64,
    pub last_terminal: Option<ExecutionStatus>,
}

/// Readiness of a job's declared dependencies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DependencyState {
    Satisfied,
    Waiting,
    /// The named dependency ended failed or cancelled
    Failed(Uuid),
}

/// Per-queue execution counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct QueueCounts {
    pub pending: usize,
    pub running: usize,
    pub scheduled: usize,
    pub retrying: usize,
}

#[derive(Debug, Default)]
pub(crate) struct StoreState {
    jobs: HashMap<Uuid, StoredJob>,
    executions: HashMap<Uuid, JobExecution>,
    /// Execution ids per job in creation order
    history: HashMap<Uuid, Vec<Uuid>>,
    /// FIFO of pending execution ids per queue
    pending: HashMap<String, VecDeque<Uuid>>,
    running_by_queue: HashMap<String, usize>,
    running_by_job: HashMap<Uuid, usize>,
    running_total: usize,
    /// Attempts dispatched per run
    attempts: HashMap<Uuid, u32>,
    /// Runs whose latest attempt failed and wait for a retry timer,
    /// mapped to that attempt's execution id
    awaiting_retry: HashMap<Uuid, Uuid>,
}

impl StoreState {
    pub fn insert_job(
        &mut self,
        definition: JobDefinition,
        queue: String,
        token: CancellationToken,
    ) -> Arc<JobDefinition> {
        let definition = Arc::new(definition);
        self.jobs.insert(
            definition.id,
            StoredJob {
                definition: definition.clone(),
                queue,
                token,
                cancelled: false,
                completed_runs: 0,
                last_terminal: None,
            },
        );
        definition
    }

    pub fn job(&self, job_id: &Uuid) -> Option<&StoredJob> {
        self.jobs.get(job_id)
    }

    pub fn contains_job(&self, job_id: &Uuid) -> bool {
        self.jobs.contains_key(job_id)
    }

    fn is_active(&self, job_id: &Uuid) -> bool {
        self.jobs.get(job_id).is_some_and(|job| !job.cancelled)
    }

    fn insert_execution(&mut self, execution: JobExecution) -> JobExecution {
        self.history
            .entry(execution.job_id)
            .or_default()
            .push(execution.id);
        if execution.status == ExecutionStatus::Pending {
            self.pending
                .entry(execution.queue.clone())
                .or_default()
                .push_back(execution.id);
        }
        self.executions.insert(execution.id, execution.clone());
        execution
    }

    /// Create a PENDING record and append it to its queue
    pub fn create_pending(
        &mut self,
        job_id: Uuid,
        run_id: Uuid,
        attempt: u32,
    ) -> Option<JobExecution> {
        if !self.is_active(&job_id) {
            return None;
        }
        let queue = self.jobs.get(&job_id)?.queue.clone();

        let mut execution = JobExecution::new(job_id, run_id, &queue, attempt);
        let now = Utc::now();
        execution.scheduled_for = Some(now);
        execution.enqueued_at = Some(now);
        Some(self.insert_execution(execution))
    }

    /// Create the SCHEDULED record of an armed fire
    pub fn create_scheduled(
        &mut self,
        job_id: Uuid,
        run_id: Uuid,
        fire_at: DateTime<Utc>,
    ) -> Option<JobExecution> {
        if !self.is_active(&job_id) {
            return None;
        }
        let queue = self.jobs.get(&job_id)?.queue.clone();

        let mut execution = JobExecution::new(job_id, run_id, &queue, 1);
        execution.status = ExecutionStatus::Scheduled;
        execution.scheduled_for = Some(fire_at);
        Some(self.insert_execution(execution))
    }

    /// Turn a fired SCHEDULED record into a PENDING one
    pub fn promote_scheduled(&mut self, execution_id: Uuid) -> Option<JobExecution> {
        let execution = self.executions.get(&execution_id)?;
        if execution.status != ExecutionStatus::Scheduled || !self.is_active(&execution.job_id) {
            return None;
        }

        let execution = self.executions.get_mut(&execution_id)?;
        execution.status = ExecutionStatus::Pending;
        execution.enqueued_at = Some(Utc::now());
        self.pending
            .entry(execution.queue.clone())
            .or_default()
            .push_back(execution_id);
        Some(execution.clone())
    }

    /// Pending execution ids of a queue in FIFO order
    pub fn pending_ids(&self, queue: &str) -> Vec<Uuid> {
        self.pending
            .get(queue)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn execution(&self, execution_id: &Uuid) -> Option<&JobExecution> {
        self.executions.get(execution_id)
    }

    pub fn running_in_queue(&self, queue: &str) -> usize {
        self.running_by_queue.get(queue).copied().unwrap_or(0)
    }

    pub fn running_for_job(&self, job_id: &Uuid) -> usize {
        self.running_by_job.get(job_id).copied().unwrap_or(0)
    }

    pub fn running_total(&self) -> usize {
        self.running_total
    }

    pub fn dependency_state(&self, job: &JobDefinition) -> DependencyState {
        let mut waiting = false;
        for dependency in &job.depends_on {
            let Some(stored) = self.jobs.get(dependency) else {
                return DependencyState::Failed(*dependency);
            };
            if stored.completed_runs > 0 {
                continue;
            }
            if stored.cancelled
                || matches!(
                    stored.last_terminal,
                    Some(ExecutionStatus::Failed | ExecutionStatus::Cancelled)
                )
            {
                return DependencyState::Failed(*dependency);
            }
            waiting = true;
        }

        if waiting {
            DependencyState::Waiting
        } else {
            DependencyState::Satisfied
        }
    }

    /// Move a PENDING execution to RUNNING and count the attempt
    pub fn claim(&mut self, execution_id: Uuid, worker_id: String) -> Option<JobExecution> {
        let execution = self.executions.get_mut(&execution_id)?;
        if execution.status != ExecutionStatus::Pending {
            return None;
        }

        if let Some(queue) = self.pending.get_mut(&execution.queue) {
            queue.retain(|id| *id != execution_id);
        }

        let attempt = self.attempts.entry(execution.run_id).or_insert(0);
        *attempt += 1;

        let now = Utc::now();
        execution.attempt = *attempt;
        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(now);
        execution.worker_id = Some(worker_id);
        execution.metrics.queue_wait = execution
            .enqueued_at
            .and_then(|enqueued| (now - enqueued).to_std().ok());

        *self
            .running_by_queue
            .entry(execution.queue.clone())
            .or_insert(0) += 1;
        *self.running_by_job.entry(execution.job_id).or_insert(0) += 1;
        self.running_total += 1;

        Some(execution.clone())
    }

    /// Record the end of an execution
    ///
    /// Releases its concurrency slot if it was running, or its place in the
    /// queue if it was pending, then applies `update`.
    pub fn settle(
        &mut self,
        execution_id: Uuid,
        status: ExecutionStatus,
        update: impl FnOnce(&mut JobExecution),
    ) -> Option<JobExecution> {
        let execution = self.executions.get_mut(&execution_id)?;

        match execution.status {
            ExecutionStatus::Running => {
                if let Some(count) = self.running_by_queue.get_mut(&execution.queue) {
                    *count = count.saturating_sub(1);
                }
                if let Some(count) = self.running_by_job.get_mut(&execution.job_id) {
                    *count = count.saturating_sub(1);
                }
                self.running_total = self.running_total.saturating_sub(1);
            }
            ExecutionStatus::Pending => {
                if let Some(queue) = self.pending.get_mut(&execution.queue) {
                    queue.retain(|id| *id != execution_id);
                }
            }
            _ => {}
        }

        execution.status = status;
        execution.completed_at = Some(Utc::now());
        update(execution);

        if status.is_terminal() {
            if let Some(job) = self.jobs.get_mut(&execution.job_id) {
                if status == ExecutionStatus::Completed {
                    job.completed_runs += 1;
                }
                job.last_terminal = Some(status);
            }
        }

        Some(execution.clone())
    }

    /// Mark a failed attempt as waiting for its retry timer
    pub fn await_retry(&mut self, run_id: Uuid, execution_id: Uuid) {
        self.awaiting_retry.insert(run_id, execution_id);
    }

    /// Consume the retry marker of a run when its timer fires. Returns
    /// `None` if the run was cancelled in the meantime.
    pub fn take_retry(&mut self, run_id: &Uuid) -> Option<Uuid> {
        let execution_id = self.awaiting_retry.remove(run_id)?;
        let job_id = self.executions.get(&execution_id)?.job_id;
        self.is_active(&job_id).then_some(execution_id)
    }

    /// Flag a job cancelled, cancel its timers and every execution that has
    /// not started. Returns `None` for unknown jobs.
    pub fn cancel_job(&mut self, job_id: &Uuid) -> Option<Vec<JobExecution>> {
        let job = self.jobs.get_mut(job_id)?;
        job.cancelled = true;
        job.token.cancel();

        let retry_waiting: Vec<Uuid> = self
            .awaiting_retry
            .iter()
            .filter(|(_, id)| {
                self.executions
                    .get(*id)
                    .is_some_and(|execution| execution.job_id == *job_id)
            })
            .map(|(run_id, _)| *run_id)
            .collect();
        let mut to_cancel: Vec<Uuid> = retry_waiting
            .iter()
            .filter_map(|run_id| self.awaiting_retry.remove(run_id))
            .collect();

        to_cancel.extend(
            self.history
                .get(job_id)
                .into_iter()
                .flatten()
                .filter(|id| {
                    self.executions.get(*id).is_some_and(|execution| {
                        matches!(
                            execution.status,
                            ExecutionStatus::Pending | ExecutionStatus::Scheduled
                        )
                    })
                })
                .copied(),
        );

        let cancelled = to_cancel
            .into_iter()
            .filter_map(|id| self.settle(id, ExecutionStatus::Cancelled, |_| {}))
            .collect();
        Some(cancelled)
    }

    /// Executions of a job, most recent first
    pub fn history(&self, job_id: &Uuid) -> Vec<JobExecution> {
        self.history
            .get(job_id)
            .into_iter()
            .flatten()
            .rev()
            .filter_map(|id| self.executions.get(id).cloned())
            .collect()
    }

    pub fn queue_counts(&self, queue: &str) -> QueueCounts {
        let mut counts = QueueCounts {
            pending: self.pending.get(queue).map_or(0, VecDeque::len),
            running: self.running_in_queue(queue),
            ..Default::default()
        };
        for execution in self.executions.values().filter(|e| e.queue == queue) {
            if execution.status == ExecutionStatus::Scheduled {
                counts.scheduled += 1;
            }
        }
        counts.retrying = self
            .awaiting_retry
            .values()
            .filter_map(|id| self.executions.get(id))
            .filter(|execution| execution.queue == queue)
            .count();
        counts
    }

    /// Definitions behind the pending executions of a queue
    pub fn pending_jobs(&self, queue: &str) -> Vec<Arc<JobDefinition>> {
        self.pending
            .get(queue)
            .into_iter()
            .flatten()
            .filter_map(|id| self.executions.get(id))
            .filter_map(|execution| self.jobs.get(&execution.job_id))
            .map(|job| job.definition.clone())
            .collect()
    }

    /// Drop settled execution records that ended before `cutoff`
    ///
    /// Terminal records and retried attempts are eligible; pending, running,
    /// scheduled and retry-waiting records are kept. Job definitions stay so
    /// dependency checks keep working.
    pub fn cleanup(&mut self, cutoff: DateTime<Utc>) -> usize {
        let waiting: Vec<Uuid> = self.awaiting_retry.values().copied().collect();
        let expired: Vec<Uuid> = self
            .executions
            .values()
            .filter(|execution| {
                let settled = execution.status.is_terminal()
                    || (execution.status == ExecutionStatus::Retrying
                        && !waiting.contains(&execution.id));
                settled && execution.completed_at.is_some_and(|at| at < cutoff)
            })
            .map(|execution| execution.id)
            .collect();

        for id in &expired {
            if let Some(execution) = self.executions.remove(id) {
                if let Some(ids) = self.history.get_mut(&execution.job_id) {
                    ids.retain(|other| other != id);
                }
            }
        }
        self.history.retain(|_, ids| !ids.is_empty());

        let live_runs: HashSet<Uuid> =
            self.executions.values().map(|e| e.run_id).collect();
        self.attempts.retain(|run_id, _| live_runs.contains(run_id));

        if !expired.is_empty() {
            debug!("Removed {} expired execution records", expired.len());
        }
        expired.len()
    }
}

/// Lock-guarded store shared by the engine components
#[derive(Debug, Default)]
pub(crate) struct JobStore {
    state: RwLock<StoreState>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().await
    }
}

/// Error recorded when a dependency ends without completing
pub(crate) fn dependency_error(dependency: Uuid) -> ExecutionError {
    ExecutionError::dependency(format!(
        "dependency {dependency} did not complete successfully"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_scheduling::types::JobType;

    fn store_with_job() -> (StoreState, Uuid) {
        let mut state = StoreState::default();
        let job = JobDefinition::new(JobType::MonitorCheck);
        let id = job.id;
        state.insert_job(job, "normal".to_string(), CancellationToken::new());
        (state, id)
    }

    #[test]
    fn test_pending_fifo_and_claim_counts_attempts() {
        let (mut state, job_id) = store_with_job();
        let run = Uuid::new_v4();

        let first = state.create_pending(job_id, run, 1).unwrap();
        let second = state.create_pending(job_id, Uuid::new_v4(), 1).unwrap();
        assert_eq!(state.pending_ids("normal"), vec![first.id, second.id]);

        let claimed = state.claim(first.id, "normal-1".into()).unwrap();
        assert_eq!(claimed.status, ExecutionStatus::Running);
        assert_eq!(claimed.attempt, 1);
        assert_eq!(state.running_in_queue("normal"), 1);
        assert_eq!(state.running_for_job(&job_id), 1);
        assert_eq!(state.pending_ids("normal"), vec![second.id]);

        // a claimed record cannot be claimed twice
        assert!(state.claim(first.id, "normal-2".into()).is_none());

        state.settle(first.id, ExecutionStatus::Retrying, |_| {});
        assert_eq!(state.running_total(), 0);

        let retry = state.create_pending(job_id, run, 2).unwrap();
        let claimed = state.claim(retry.id, "normal-3".into()).unwrap();
        assert_eq!(claimed.attempt, 2);
    }

    #[test]
    fn test_history_most_recent_first() {
        let (mut state, job_id) = store_with_job();
        let a = state.create_pending(job_id, Uuid::new_v4(), 1).unwrap();
        let b = state.create_pending(job_id, Uuid::new_v4(), 1).unwrap();

        let ids: Vec<_> = state.history(&job_id).into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![b.id, a.id]);
    }

    #[test]
    fn test_cancel_marks_unstarted_records() {
        let (mut state, job_id) = store_with_job();
        let token = state.job(&job_id).unwrap().token.clone();

        let pending = state.create_pending(job_id, Uuid::new_v4(), 1).unwrap();
        let scheduled = state
            .create_scheduled(job_id, Uuid::new_v4(), Utc::now())
            .unwrap();
        let running = state.create_pending(job_id, Uuid::new_v4(), 1).unwrap();
        state.claim(running.id, "normal-1".into()).unwrap();

        let cancelled = state.cancel_job(&job_id).unwrap();
        assert_eq!(cancelled.len(), 2);
        assert!(token.is_cancelled());

        assert_eq!(
            state.execution(&pending.id).unwrap().status,
            ExecutionStatus::Cancelled
        );
        assert_eq!(
            state.execution(&scheduled.id).unwrap().status,
            ExecutionStatus::Cancelled
        );
        assert_eq!(
            state.execution(&running.id).unwrap().status,
            ExecutionStatus::Running
        );
        assert!(state.pending_ids("normal").is_empty());

        // no new work for a cancelled job
        assert!(state.create_pending(job_id, Uuid::new_v4(), 1).is_none());
        assert!(state.cancel_job(&Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_cancel_stops_waiting_retry() {
        let (mut state, job_id) = store_with_job();
        let run = Uuid::new_v4();
        let attempt = state.create_pending(job_id, run, 1).unwrap();
        state.claim(attempt.id, "normal-1".into()).unwrap();
        state.settle(attempt.id, ExecutionStatus::Retrying, |_| {});
        state.await_retry(run, attempt.id);
        assert_eq!(state.queue_counts("normal").retrying, 1);

        state.cancel_job(&job_id).unwrap();
        assert_eq!(
            state.execution(&attempt.id).unwrap().status,
            ExecutionStatus::Cancelled
        );
        assert!(state.take_retry(&run).is_none());
    }

    #[test]
    fn test_dependency_state() {
        let (mut state, dependency) = store_with_job();
        let dependent = JobDefinition::new(JobType::Report).with_dependency(dependency);

        assert_eq!(state.dependency_state(&dependent), DependencyState::Waiting);

        let execution = state.create_pending(dependency, Uuid::new_v4(), 1).unwrap();
        state.claim(execution.id, "normal-1".into()).unwrap();
        state.settle(execution.id, ExecutionStatus::Failed, |_| {});
        assert_eq!(
            state.dependency_state(&dependent),
            DependencyState::Failed(dependency)
        );

        let execution = state.create_pending(dependency, Uuid::new_v4(), 1).unwrap();
        state.claim(execution.id, "normal-2".into()).unwrap();
        state.settle(execution.id, ExecutionStatus::Completed, |_| {});
        assert_eq!(state.dependency_state(&dependent), DependencyState::Satisfied);
    }

    #[test]
    fn test_cleanup_keeps_live_records() {
        let (mut state, job_id) = store_with_job();
        let done = state.create_pending(job_id, Uuid::new_v4(), 1).unwrap();
        state.claim(done.id, "normal-1".into()).unwrap();
        state.settle(done.id, ExecutionStatus::Completed, |_| {});
        let waiting = state.create_pending(job_id, Uuid::new_v4(), 1).unwrap();

        let removed = state.cleanup(Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(removed, 1);

        let remaining: Vec<_> = state.history(&job_id).into_iter().map(|e| e.id).collect();
        assert_eq!(remaining, vec![waiting.id]);
        assert!(state.contains_job(&job_id));
    }
}
