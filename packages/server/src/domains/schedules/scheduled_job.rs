//! Scheduled crawl entries: cron expression + timezone + per-entry
//! overrides, materialized into jobs by the scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;

use seed_crawler::types::{ScheduleId, WebsiteId};

use super::cron;
use crate::jobs::service::ServiceError;

/// One scheduled entry. Eligible to fire when
/// `is_active && next_run_time <= now`; pausing clears eligibility
/// without losing `last_run_time`.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct ScheduledJob {
    #[builder(default = ScheduleId::new())]
    pub id: ScheduleId,
    pub website_id: WebsiteId,
    pub cron_expression: String,
    #[builder(default = "UTC".to_string())]
    pub timezone: String,
    /// Seed override; the website's base URL applies when absent.
    #[builder(default, setter(strip_option))]
    pub seed_url: Option<String>,
    #[builder(default, setter(strip_option))]
    pub next_run_time: Option<DateTime<Utc>>,
    #[builder(default)]
    pub last_run_time: Option<DateTime<Utc>>,
    #[builder(default = true)]
    pub is_active: bool,
    #[builder(default = serde_json::Value::Null)]
    pub overrides: serde_json::Value,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl ScheduledJob {
    pub fn validate(&self) -> Result<(), ServiceError> {
        cron::parse(&self.cron_expression)
            .map_err(|e| ServiceError::InvalidCron(e.to_string()))?;
        cron::parse_timezone(&self.timezone)
            .map_err(|e| ServiceError::InvalidCron(e.to_string()))?;
        Ok(())
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && self
                .next_run_time
                .map(|next| next <= now)
                .unwrap_or(false)
    }

    /// Compute the firing after `after` in this entry's timezone.
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ServiceError> {
        let schedule = cron::parse(&self.cron_expression)
            .map_err(|e| ServiceError::InvalidCron(e.to_string()))?;
        let tz = cron::parse_timezone(&self.timezone)
            .map_err(|e| ServiceError::InvalidCron(e.to_string()))?;
        Ok(cron::next_after(&schedule, after, tz))
    }
}
