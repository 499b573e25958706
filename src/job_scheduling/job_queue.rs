//! Queue registry: named queues with concurrency, retry and timeout defaults

use super::types::{JobDefinition, JobPriority};
use crate::config::duration_serde::duration;
use crate::errors::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub const CRITICAL_QUEUE: &str = "critical";
pub const HIGH_QUEUE: &str = "high";
pub const NORMAL_QUEUE: &str = "normal";
pub const LOW_QUEUE: &str = "low";
pub const BULK_QUEUE: &str = "bulk";

/// Built-in queues in dispatch order
pub const BUILTIN_QUEUES: [&str; 5] =
    [CRITICAL_QUEUE, HIGH_QUEUE, NORMAL_QUEUE, LOW_QUEUE, BULK_QUEUE];

/// Map a priority onto its built-in queue. Total over all priorities.
pub fn resolve_queue_for_priority(priority: JobPriority) -> &'static str {
    match priority {
        JobPriority::Critical => CRITICAL_QUEUE,
        JobPriority::High => HIGH_QUEUE,
        JobPriority::Normal => NORMAL_QUEUE,
        JobPriority::Low => LOW_QUEUE,
        JobPriority::Bulk => BULK_QUEUE,
    }
}

/// Queue a job is routed to: its explicit resource class, else its priority
pub fn queue_for_job(job: &JobDefinition) -> &str {
    job.queue
        .as_deref()
        .unwrap_or_else(|| resolve_queue_for_priority(job.priority))
}

/// Dispatch budget within a sliding window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_jobs: u32,
    #[serde(with = "duration")]
    pub per: Duration,
}

/// Queue definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    /// Ceiling on concurrently running executions
    pub max_concurrency: usize,
    /// Retries after the first attempt for jobs without their own retry config
    pub max_retries: u32,
    #[serde(with = "duration")]
    pub default_timeout: Duration,
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
    #[serde(default)]
    pub paused: bool,
}

impl QueueConfig {
    pub fn new(
        name: impl Into<String>,
        max_concurrency: usize,
        max_retries: u32,
        default_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            max_concurrency,
            max_retries,
            default_timeout,
            rate_limit: None,
            paused: false,
        }
    }

    pub fn with_rate_limit(mut self, max_jobs: u32, per: Duration) -> Self {
        self.rate_limit = Some(RateLimit { max_jobs, per });
        self
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::configuration("queue name must not be empty"));
        }
        if self.max_concurrency == 0 {
            return Err(EngineError::configuration(format!(
                "queue '{}' must allow at least one concurrent execution",
                self.name
            )));
        }
        if self.default_timeout.is_zero() {
            return Err(EngineError::configuration(format!(
                "queue '{}' default timeout must be greater than zero",
                self.name
            )));
        }
        if let Some(limit) = &self.rate_limit {
            if limit.max_jobs == 0 || limit.per.is_zero() {
                return Err(EngineError::configuration(format!(
                    "queue '{}' rate limit must allow at least one job per non-zero window",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Point-in-time view of a queue
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub name: String,
    pub paused: bool,
    pub max_concurrency: usize,
    pub max_retries: u32,
    #[serde(with = "duration")]
    pub default_timeout: Duration,
    pub rate_limit: Option<RateLimit>,
    pub pending: usize,
    pub running: usize,
    pub scheduled: usize,
    pub retrying: usize,
    /// Sum of processor estimates over pending executions
    #[serde(with = "duration")]
    pub estimated_backlog: Duration,
}

#[derive(Debug, Default)]
struct RegistryState {
    queues: HashMap<String, QueueConfig>,
    /// Dispatch order: built-ins first, then registration order
    order: Vec<String>,
}

/// Thread-safe registry of named queues
#[derive(Debug)]
pub struct QueueRegistry {
    state: RwLock<RegistryState>,
}

impl QueueRegistry {
    /// Create a registry from an ordered list of queue definitions
    pub fn new(configs: Vec<QueueConfig>) -> EngineResult<Self> {
        let mut state = RegistryState::default();

        for config in configs {
            config.validate()?;
            if state.queues.contains_key(&config.name) {
                return Err(EngineError::configuration(format!(
                    "queue '{}' is already registered",
                    config.name
                )));
            }
            state.order.push(config.name.clone());
            state.queues.insert(config.name.clone(), config);
        }

        for name in BUILTIN_QUEUES {
            if !state.queues.contains_key(name) {
                return Err(EngineError::configuration(format!(
                    "built-in queue '{name}' is missing"
                )));
            }
        }

        Ok(Self {
            state: RwLock::new(state),
        })
    }

    /// Register an additional queue
    pub async fn register(&self, config: QueueConfig) -> EngineResult<()> {
        config.validate()?;

        let mut state = self.state.write().await;
        if state.queues.contains_key(&config.name) {
            return Err(EngineError::configuration(format!(
                "queue '{}' is already registered",
                config.name
            )));
        }

        info!(
            "Registered queue '{}' (max concurrency: {}, max retries: {}, timeout: {:?})",
            config.name, config.max_concurrency, config.max_retries, config.default_timeout
        );
        state.order.push(config.name.clone());
        state.queues.insert(config.name.clone(), config);
        Ok(())
    }

    /// Pause dispatch for a queue. Returns whether the queue exists.
    pub async fn pause(&self, name: &str) -> bool {
        self.set_paused(name, true).await
    }

    /// Resume dispatch for a queue. Returns whether the queue exists.
    pub async fn resume(&self, name: &str) -> bool {
        self.set_paused(name, false).await
    }

    async fn set_paused(&self, name: &str, paused: bool) -> bool {
        let mut state = self.state.write().await;
        match state.queues.get_mut(name) {
            Some(queue) => {
                if queue.paused != paused {
                    queue.paused = paused;
                    info!(
                        "Queue '{}' {}",
                        name,
                        if paused { "paused" } else { "resumed" }
                    );
                } else {
                    debug!(
                        "Queue '{}' already {}",
                        name,
                        if paused { "paused" } else { "running" }
                    );
                }
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, name: &str) -> Option<QueueConfig> {
        self.state.read().await.queues.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.state.read().await.queues.contains_key(name)
    }

    pub async fn is_paused(&self, name: &str) -> Option<bool> {
        self.state.read().await.queues.get(name).map(|q| q.paused)
    }

    /// Snapshot of every queue in dispatch order
    pub async fn dispatch_order(&self) -> Vec<QueueConfig> {
        let state = self.state.read().await;
        state
            .order
            .iter()
            .filter_map(|name| state.queues.get(name).cloned())
            .collect()
    }
}
