//! Configuration default values
//!
//! All default values for engine options live here so they can be changed in
//! one place.

use std::time::Duration;

// Engine loop defaults
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);
pub const DEFAULT_EVENT_BUFFER: usize = 1024;
pub const DEFAULT_CONFIG_FILE: &str = "job-engine.toml";
pub const CONFIG_FILE_ENV: &str = "JOB_ENGINE_CONFIG";

// Retry defaults for queue-inherited retry configs
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(300);
pub const DEFAULT_RETRY_JITTER: bool = true;

// Built-in queues: (max concurrency, max retries, default timeout)
pub const CRITICAL_QUEUE_DEFAULTS: (usize, u32, Duration) = (10, 5, Duration::from_secs(30));
pub const HIGH_QUEUE_DEFAULTS: (usize, u32, Duration) = (20, 3, Duration::from_secs(60));
pub const NORMAL_QUEUE_DEFAULTS: (usize, u32, Duration) = (50, 3, Duration::from_secs(300));
pub const LOW_QUEUE_DEFAULTS: (usize, u32, Duration) = (20, 2, Duration::from_secs(600));
pub const BULK_QUEUE_DEFAULTS: (usize, u32, Duration) = (5, 1, Duration::from_secs(1800));

pub fn default_tick_interval() -> Duration {
    DEFAULT_TICK_INTERVAL
}

pub fn default_shutdown_grace_period() -> Duration {
    DEFAULT_SHUTDOWN_GRACE_PERIOD
}

pub fn default_event_buffer() -> usize {
    DEFAULT_EVENT_BUFFER
}

pub fn default_retry_base_delay() -> Duration {
    DEFAULT_RETRY_BASE_DELAY
}

pub fn default_retry_max_delay() -> Duration {
    DEFAULT_RETRY_MAX_DELAY
}

pub fn default_retry_jitter() -> bool {
    DEFAULT_RETRY_JITTER
}
