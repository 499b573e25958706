use crate::errors::{EngineError, EngineResult};
use crate::job_scheduling::job_queue::{
    QueueConfig, RateLimit, BULK_QUEUE, CRITICAL_QUEUE, HIGH_QUEUE, LOW_QUEUE, NORMAL_QUEUE,
};
use crate::job_scheduling::types::{BackoffKind, RetryConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

pub mod defaults;
pub mod duration_serde;

use defaults::*;
use duration_serde::{duration, option_duration};

/// Engine configuration
///
/// ```toml
/// tick_interval = "500ms"
/// global_max_concurrency = 64
///
/// [retry]
/// backoff = "exponential"
/// base_delay = "2s"
///
/// [[queues]]
/// name = "bulk"
/// max_concurrency = 2
///
/// [[queues]]
/// name = "backups"
/// max_concurrency = 1
/// default_timeout = "2h"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Dispatcher cadence
    #[serde(default = "default_tick_interval", with = "duration")]
    pub tick_interval: Duration,
    /// How long shutdown waits for in-flight executions
    #[serde(default = "default_shutdown_grace_period", with = "duration")]
    pub shutdown_grace_period: Duration,
    /// Engine-wide ceiling on running executions across all queues
    #[serde(default)]
    pub global_max_concurrency: Option<usize>,
    /// Capacity of the lifecycle event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    #[serde(default)]
    pub retry: RetryDefaults,
    /// Overrides for built-in queues and additional queues
    #[serde(default)]
    pub queues: Vec<QueueSettings>,
}

/// Backoff applied to retry configs inherited from a queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryDefaults {
    #[serde(default = "default_backoff")]
    pub backoff: BackoffKind,
    #[serde(default = "default_retry_base_delay", with = "duration")]
    pub base_delay: Duration,
    #[serde(default = "default_retry_max_delay", with = "duration")]
    pub max_delay: Duration,
    #[serde(default = "default_retry_jitter")]
    pub jitter: bool,
}

fn default_backoff() -> BackoffKind {
    BackoffKind::Exponential
}

/// Partial queue definition; unset fields keep the built-in value, or the
/// normal queue's value for queues that are not built in
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueSettings {
    pub name: String,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default, with = "option_duration")]
    pub default_timeout: Option<Duration>,
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
    #[serde(default)]
    pub paused: bool,
}

impl RetryDefaults {
    /// Retry config for jobs that carry none of their own
    pub fn for_queue(&self, queue: &QueueConfig) -> RetryConfig {
        RetryConfig {
            max_attempts: queue.max_retries.saturating_add(1),
            backoff: self.backoff,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            jitter: self.jitter,
        }
    }
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            backoff: default_backoff(),
            base_delay: default_retry_base_delay(),
            max_delay: default_retry_max_delay(),
            jitter: default_retry_jitter(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            shutdown_grace_period: default_shutdown_grace_period(),
            global_max_concurrency: None,
            event_buffer: default_event_buffer(),
            retry: RetryDefaults::default(),
            queues: Vec::new(),
        }
    }
}

fn builtin_queue(
    name: &str,
    (concurrency, retries, timeout): (usize, u32, Duration),
) -> QueueConfig {
    QueueConfig::new(name, concurrency, retries, timeout)
}

impl QueueSettings {
    fn apply(&self, mut base: QueueConfig) -> QueueConfig {
        base.name = self.name.clone();
        if let Some(max_concurrency) = self.max_concurrency {
            base.max_concurrency = max_concurrency;
        }
        if let Some(max_retries) = self.max_retries {
            base.max_retries = max_retries;
        }
        if let Some(timeout) = self.default_timeout {
            base.default_timeout = timeout;
        }
        if self.rate_limit.is_some() {
            base.rate_limit = self.rate_limit.clone();
        }
        base.paused = self.paused;
        base
    }
}

impl EngineConfig {
    /// Load from the file named by `JOB_ENGINE_CONFIG`, or `job-engine.toml`
    pub fn load() -> EngineResult<Self> {
        let config_file =
            std::env::var(CONFIG_FILE_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from_file(config_file)
    }

    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load_from_file(config_file: impl AsRef<Path>) -> EngineResult<Self> {
        let path = config_file.as_ref();
        let config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&contents)?;
            info!("Loaded engine configuration from {}", path.display());
            config
        } else {
            info!(
                "Engine configuration file {} not found, using defaults",
                path.display()
            );
            Self::default()
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.tick_interval.is_zero() {
            return Err(EngineError::configuration("tick_interval must be greater than zero"));
        }
        if self.event_buffer == 0 {
            return Err(EngineError::configuration("event_buffer must be greater than zero"));
        }
        if self.global_max_concurrency == Some(0) {
            return Err(EngineError::configuration(
                "global_max_concurrency must be greater than zero when set",
            ));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(EngineError::configuration(
                "retry.base_delay must not exceed retry.max_delay",
            ));
        }

        let mut seen = HashSet::new();
        for queue in &self.queues {
            if !seen.insert(queue.name.as_str()) {
                return Err(EngineError::configuration(format!(
                    "queue '{}' is configured more than once",
                    queue.name
                )));
            }
        }

        for queue in self.queue_configs() {
            queue.validate()?;
        }
        Ok(())
    }

    /// Resolved queue definitions: the five built-ins in priority order with
    /// overrides applied, followed by additional queues in file order
    pub fn queue_configs(&self) -> Vec<QueueConfig> {
        let mut queues = vec![
            builtin_queue(CRITICAL_QUEUE, CRITICAL_QUEUE_DEFAULTS),
            builtin_queue(HIGH_QUEUE, HIGH_QUEUE_DEFAULTS),
            builtin_queue(NORMAL_QUEUE, NORMAL_QUEUE_DEFAULTS),
            builtin_queue(LOW_QUEUE, LOW_QUEUE_DEFAULTS),
            builtin_queue(BULK_QUEUE, BULK_QUEUE_DEFAULTS),
        ];

        for settings in &self.queues {
            match queues.iter_mut().find(|q| q.name == settings.name) {
                Some(existing) => {
                    debug!("Applying configured overrides to queue '{}'", settings.name);
                    *existing = settings.apply(existing.clone());
                }
                None => {
                    queues.push(settings.apply(builtin_queue(NORMAL_QUEUE, NORMAL_QUEUE_DEFAULTS)))
                }
            }
        }

        queues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::default();
        config.validate().unwrap();

        let queues = config.queue_configs();
        let names: Vec<_> = queues.iter().map(|q| q.name.as_str()).collect();
        assert_eq!(names, vec!["critical", "high", "normal", "low", "bulk"]);
        assert_eq!(queues[0].max_concurrency, 10);
        assert_eq!(queues[4].default_timeout, Duration::from_secs(1800));
    }

    #[test]
    fn test_load_from_file_applies_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
tick_interval = "250ms"
global_max_concurrency = 8

[retry]
backoff = "linear"
base_delay = 500
jitter = false

[[queues]]
name = "bulk"
max_concurrency = 2

[[queues]]
name = "backups"
max_concurrency = 1
default_timeout = "2h"
rate_limit = {{ max_jobs = 3, per = "1m" }}
"#
        )
        .unwrap();

        let config = EngineConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.tick_interval, Duration::from_millis(250));
        assert_eq!(config.global_max_concurrency, Some(8));
        assert_eq!(config.retry.backoff, BackoffKind::Linear);
        assert_eq!(config.retry.base_delay, Duration::from_millis(500));

        let queues = config.queue_configs();
        assert_eq!(queues.len(), 6);
        let bulk = queues.iter().find(|q| q.name == "bulk").unwrap();
        assert_eq!(bulk.max_concurrency, 2);
        assert_eq!(bulk.max_retries, 1);

        let backups = queues.last().unwrap();
        assert_eq!(backups.name, "backups");
        assert_eq!(backups.default_timeout, Duration::from_secs(7200));
        assert_eq!(backups.max_retries, 3);
        assert_eq!(
            backups.rate_limit,
            Some(RateLimit {
                max_jobs: 3,
                per: Duration::from_secs(60)
            })
        );
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load_from_file(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.tick_interval, DEFAULT_TICK_INTERVAL);
        assert!(!dir.path().join("absent.toml").exists());
    }

    #[test]
    fn test_invalid_toml_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "tick_interval = [").unwrap();

        let result = EngineConfig::load_from_file(file.path());
        assert!(matches!(result, Err(EngineError::ConfigParse(_))));
    }

    #[test]
    fn test_validate_rejects_duplicates_and_zero_limits() {
        let mut config = EngineConfig::default();
        config.queues = vec![
            QueueSettings {
                name: "reports".into(),
                ..Default::default()
            },
            QueueSettings {
                name: "reports".into(),
                ..Default::default()
            },
        ];
        assert!(matches!(config.validate(), Err(EngineError::Configuration { .. })));

        let mut config = EngineConfig::default();
        config.queues = vec![QueueSettings {
            name: "normal".into(),
            max_concurrency: Some(0),
            ..Default::default()
        }];
        assert!(matches!(config.validate(), Err(EngineError::Configuration { .. })));

        let config = EngineConfig {
            global_max_concurrency: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_queue_retry_inherits_engine_backoff() {
        let config = EngineConfig::default();
        let queue = QueueConfig::new("normal", 5, 3, Duration::from_secs(1));
        let retry = config.retry.for_queue(&queue);

        assert_eq!(retry.max_attempts, 4);
        assert_eq!(retry.backoff, BackoffKind::Exponential);
        assert!(retry.jitter);
    }
}
