//! Processor contract and registry
//!
//! A processor performs the actual work for one [`JobType`]. Uptime
//! checks, notification senders and backup routines all plug in here.

use super::types::{JobDefinition, JobExecution, JobType};
use crate::errors::{EngineError, EngineResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

/// Trait for job processors
///
/// Returning an error marks the attempt failed. Errors whose message chain
/// mentions validation, invalid input, authorization, not found or forbidden
/// are never retried, and neither is a
/// [`PermanentFailure`](crate::errors::PermanentFailure).
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(
        &self,
        job: &JobDefinition,
        execution: &JobExecution,
    ) -> anyhow::Result<serde_json::Value>;

    fn can_process(&self, job_type: &JobType) -> bool;

    /// Expected run time, used for backlog estimates
    fn estimated_duration(&self, _job: &JobDefinition) -> Duration {
        Duration::from_secs(1)
    }
}

/// One processor per job type
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: RwLock<HashMap<JobType, Arc<dyn JobProcessor>>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        job_type: JobType,
        processor: Arc<dyn JobProcessor>,
    ) -> EngineResult<()> {
        if !processor.can_process(&job_type) {
            return Err(EngineError::configuration(format!(
                "processor does not accept job type '{job_type}'"
            )));
        }

        let mut processors = self.processors.write().await;
        if processors.contains_key(&job_type) {
            return Err(EngineError::configuration(format!(
                "a processor is already registered for job type '{job_type}'"
            )));
        }

        info!("Registered processor for job type '{}'", job_type);
        processors.insert(job_type, processor);
        Ok(())
    }

    pub async fn get(&self, job_type: &JobType) -> Option<Arc<dyn JobProcessor>> {
        self.processors.read().await.get(job_type).cloned()
    }

    pub async fn contains(&self, job_type: &JobType) -> bool {
        self.processors.read().await.contains_key(job_type)
    }
}
