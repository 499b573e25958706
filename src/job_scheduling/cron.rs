//! Cron evaluation for scheduled jobs
//!
//! The scheduler only owns the arm/fire/re-arm loop; computing the next fire
//! time is delegated to a [`CronEvaluator`] so hosts can plug in their own
//! calendar logic.

use crate::errors::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use ::cron::Schedule;
use std::str::FromStr;

/// Computes fire times for cron expressions
pub trait CronEvaluator: Send + Sync {
    /// Next fire time strictly after `after`, or `None` when the expression
    /// has no future occurrences
    fn next_fire_time(
        &self,
        expression: &str,
        after: DateTime<Utc>,
        timezone: Option<&str>,
    ) -> EngineResult<Option<DateTime<Utc>>>;

    /// Check an expression at submit time
    fn validate(&self, expression: &str, timezone: Option<&str>) -> EngineResult<()> {
        self.next_fire_time(expression, Utc::now(), timezone).map(|_| ())
    }
}

/// Default evaluator backed by the `cron` crate
///
/// Expressions use seconds resolution (`sec min hour day month weekday
/// [year]`), e.g. `"0 */5 * * * *"` for every five minutes.
#[derive(Debug, Clone, Copy, Default)]
pub struct CronScheduleEvaluator;

fn parse_timezone(timezone: Option<&str>) -> EngineResult<Tz> {
    match timezone {
        None => Ok(Tz::UTC),
        Some(name) => Tz::from_str(name).map_err(|e| {
            EngineError::configuration(format!("Invalid timezone '{name}': {e}"))
        }),
    }
}

impl CronEvaluator for CronScheduleEvaluator {
    fn next_fire_time(
        &self,
        expression: &str,
        after: DateTime<Utc>,
        timezone: Option<&str>,
    ) -> EngineResult<Option<DateTime<Utc>>> {
        let schedule = Schedule::from_str(expression).map_err(|e| {
            EngineError::configuration(format!("Invalid cron expression '{expression}': {e}"))
        })?;
        let tz = parse_timezone(timezone)?;

        Ok(schedule
            .after(&after.with_timezone(&tz))
            .next()
            .map(|next| next.with_timezone(&Utc)))
    }
}
