//! Retry policy engine
//!
//! Pure functions deciding whether a failed attempt is retried and how long
//! to wait first. Nothing here touches engine state; the only impurity is the
//! jitter sample, which [`decide`] draws and [`decide_with_jitter`] takes as
//! an argument.

use super::types::{BackoffKind, RetryConfig};
use rand::Rng;
use std::time::Duration;

/// Lower bound of the jitter multiplier; the upper bound is 1.0
pub const JITTER_MIN_FACTOR: f64 = 0.5;

/// Outcome of a retry decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Arm another attempt after `delay`
    Retry { delay: Duration, next_attempt: u32 },
    /// Stop; the execution is terminal
    GiveUp(GiveUpReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    NonRecoverable,
    AttemptsExhausted,
    /// The job was cancelled while the attempt was running
    Cancelled,
    /// The engine is shutting down and no retry timer can be armed
    ShuttingDown,
}

/// Backoff delay before the attempt following `attempt` (1-based), without
/// jitter
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let attempt = attempt.max(1);

    match config.backoff {
        BackoffKind::Fixed => config.base_delay,
        BackoffKind::Linear => config
            .base_delay
            .saturating_mul(attempt)
            .min(config.max_delay),
        BackoffKind::Exponential => {
            let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
            config.base_delay.saturating_mul(factor).min(config.max_delay)
        }
    }
}

/// Scale a delay by a jitter factor clamped to `[0.5, 1.0]`
pub fn apply_jitter(delay: Duration, factor: f64) -> Duration {
    delay.mul_f64(factor.clamp(JITTER_MIN_FACTOR, 1.0))
}

/// Draw a uniform jitter factor in `[0.5, 1.0]`
pub fn sample_jitter_factor() -> f64 {
    rand::rng().random_range(JITTER_MIN_FACTOR..=1.0)
}

/// Decide what happens after `attempt` failed, drawing jitter if enabled
pub fn decide(config: &RetryConfig, attempt: u32, recoverable: bool) -> RetryDecision {
    let factor = if config.jitter {
        sample_jitter_factor()
    } else {
        1.0
    };
    decide_with_jitter(config, attempt, recoverable, factor)
}

/// Deterministic variant of [`decide`]
pub fn decide_with_jitter(
    config: &RetryConfig,
    attempt: u32,
    recoverable: bool,
    jitter_factor: f64,
) -> RetryDecision {
    if !recoverable {
        return RetryDecision::GiveUp(GiveUpReason::NonRecoverable);
    }

    if attempt >= config.max_attempts {
        return RetryDecision::GiveUp(GiveUpReason::AttemptsExhausted);
    }

    let delay = backoff_delay(config, attempt);
    let delay = if config.jitter {
        apply_jitter(delay, jitter_factor)
    } else {
        delay
    };

    RetryDecision::Retry {
        delay,
        next_attempt: attempt + 1,
    }
}
