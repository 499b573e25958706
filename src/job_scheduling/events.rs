//! Execution lifecycle events
//!
//! Observers (alerting, escalation, dashboards) subscribe to a broadcast
//! channel. Slow subscribers lag and lose the oldest events; the engine never
//! waits for them.

use crate::config::duration_serde::duration;
use crate::errors::ExecutionError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Submitted {
        job_id: Uuid,
        queue: String,
    },
    Scheduled {
        job_id: Uuid,
        execution_id: Uuid,
        fire_at: DateTime<Utc>,
    },
    Enqueued {
        job_id: Uuid,
        execution_id: Uuid,
        queue: String,
        attempt: u32,
    },
    Started {
        job_id: Uuid,
        execution_id: Uuid,
        queue: String,
        attempt: u32,
        worker_id: String,
    },
    Completed {
        job_id: Uuid,
        execution_id: Uuid,
        attempt: u32,
        #[serde(with = "duration")]
        duration: Duration,
    },
    Retrying {
        job_id: Uuid,
        execution_id: Uuid,
        attempt: u32,
        #[serde(with = "duration")]
        delay: Duration,
        error: ExecutionError,
    },
    /// Terminal failure; escalation hooks should watch for this
    Failed {
        job_id: Uuid,
        execution_id: Uuid,
        attempt: u32,
        error: ExecutionError,
    },
    Cancelled {
        job_id: Uuid,
        executions: usize,
    },
    QueuePaused {
        queue: String,
    },
    QueueResumed {
        queue: String,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            JobEvent::Submitted { job_id, .. }
            | JobEvent::Scheduled { job_id, .. }
            | JobEvent::Enqueued { job_id, .. }
            | JobEvent::Started { job_id, .. }
            | JobEvent::Completed { job_id, .. }
            | JobEvent::Retrying { job_id, .. }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Cancelled { job_id, .. } => Some(*job_id),
            JobEvent::QueuePaused { .. } | JobEvent::QueueResumed { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: JobEvent) {
        // No subscribers is fine
        if self.sender.send(event).is_err() {
            trace!("Dropped job event without subscribers");
        }
    }
}
