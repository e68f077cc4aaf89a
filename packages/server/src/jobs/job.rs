//! Crawl job model and its lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use url::Url;

use seed_crawler::retry::ErrorCategory;
use seed_crawler::types::{JobId, ScheduleId, WebsiteId};

use crate::jobs::service::ServiceError;

pub const MIN_PRIORITY: i16 = 1;
pub const MAX_PRIORITY: i16 = 10;
pub const DEFAULT_PRIORITY: i16 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Cancelling,
    Cancelled,
    Completed,
    Failed,
    /// Reserved; no transitions in or out yet.
    Paused,
}

impl JobStatus {
    /// Terminal states are absorbing: no transition leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Cancelled | JobStatus::Completed | JobStatus::Failed
        )
    }

    /// The lifecycle transition table. Everything not listed is rejected.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Cancelling)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Pending)
                | (Cancelling, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Cancelling => "cancelling",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Paused => "paused",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    #[default]
    OneTime,
    Scheduled,
    Recurring,
}

/// A crawl job row. Exactly one of `website_id` / `inline_config` is set;
/// the database enforces the same XOR as a check constraint.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct CrawlJob {
    #[builder(default = JobId::new())]
    pub id: JobId,

    #[builder(default, setter(strip_option))]
    pub website_id: Option<WebsiteId>,
    #[builder(default, setter(strip_option))]
    pub inline_config: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub schedule_id: Option<ScheduleId>,

    #[builder(default)]
    pub job_type: JobType,
    pub seed_url: String,

    #[builder(default)]
    pub status: JobStatus,
    #[builder(default = DEFAULT_PRIORITY)]
    pub priority: i16,
    #[builder(default = 0)]
    pub retry_count: i32,

    #[builder(default, setter(strip_option))]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub cancelled_by: Option<String>,
    #[builder(default, setter(strip_option))]
    pub cancellation_reason: Option<String>,

    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,
    #[builder(default, setter(strip_option))]
    pub error_category: Option<ErrorCategory>,

    #[builder(default = serde_json::Value::Null)]
    pub metadata: serde_json::Value,
    #[builder(default = serde_json::Value::Null)]
    pub variables: serde_json::Value,
    #[builder(default = serde_json::Value::Null)]
    pub progress: serde_json::Value,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl CrawlJob {
    /// Enforce the write-time invariants: config-source XOR, parseable
    /// seed URL, priority in range.
    pub fn validate(&self) -> Result<(), ServiceError> {
        match (&self.website_id, &self.inline_config) {
            (Some(_), Some(_)) => {
                return Err(ServiceError::InvalidConfig(
                    "website_id and inline_config are mutually exclusive".to_string(),
                ))
            }
            (None, None) => {
                return Err(ServiceError::InvalidConfig(
                    "one of website_id or inline_config is required".to_string(),
                ))
            }
            _ => {}
        }
        Url::parse(&self.seed_url).map_err(|e| {
            ServiceError::InvalidConfig(format!("seed_url is not a valid url: {e}"))
        })?;
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(ServiceError::InvalidConfig(format!(
                "priority must be within {MIN_PRIORITY}..={MAX_PRIORITY}"
            )));
        }
        Ok(())
    }
}

/// Fields a status transition may update alongside the status itself.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancelled_by: Option<String>,
    pub cancellation_reason: Option<String>,
    pub error_message: Option<String>,
    pub error_category: Option<ErrorCategory>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub progress: Option<serde_json::Value>,
    pub increment_retry: bool,
}
