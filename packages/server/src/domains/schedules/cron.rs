//! Cron expression handling.
//!
//! Accepts the 5-field standard form and the 6-field leading-seconds
//! variant; evaluation always happens in the entry's IANA timezone.
//! Spring-forward gaps skip the firing entirely; fall-back overlaps fire
//! once, on the first occurrence.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use thiserror::Error;

/// Default schedule for new websites: the 1st and 15th at midnight.
pub const DEFAULT_CRON: &str = "0 0 1,15 * *";

#[derive(Debug, Error)]
pub enum CronError {
    #[error("invalid cron expression '{expression}': {message}")]
    InvalidExpression { expression: String, message: String },

    #[error("unknown timezone '{0}'")]
    InvalidTimezone(String),
}

/// Parse a 5- or 6-field cron expression.
pub fn parse(expression: &str) -> Result<Schedule, CronError> {
    let fields = expression.split_whitespace().count();
    let normalized = if fields == 5 {
        // Standard cron lacks the seconds field; pin it to zero.
        format!("0 {expression}")
    } else {
        expression.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| CronError::InvalidExpression {
        expression: expression.to_string(),
        message: e.to_string(),
    })
}

/// Resolve an IANA timezone name, defaulting to UTC for empty input.
pub fn parse_timezone(name: &str) -> Result<Tz, CronError> {
    if name.trim().is_empty() {
        return Ok(chrono_tz::UTC);
    }
    name.parse::<Tz>()
        .map_err(|_| CronError::InvalidTimezone(name.to_string()))
}

/// Next firing strictly after `after`, evaluated in `tz`.
pub fn next_after(schedule: &Schedule, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|local| local.with_timezone(&Utc))
}
