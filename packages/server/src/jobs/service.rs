//! Job orchestration: submission, cancellation, and every status
//! transition. No other component writes job status.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use seed_crawler::config::CrawlConfig;
use seed_crawler::retry::ErrorCategory;
use seed_crawler::traits::KvCache;
use seed_crawler::types::{CrawlResult, JobId, ScheduleId, WebsiteId};
use uuid::Uuid;

use crate::common::Clock;
use crate::domains::retries::{DeadLetterJob, DlqStore};
use crate::domains::schedules::{cron, ScheduleStore, ScheduledJob};
use crate::jobs::job::{CrawlJob, JobPatch, JobStatus, JobType};
use crate::jobs::store::{JobFilter, JobStore};
use crate::kernel::log_stream::{LogEvent, LogHub};
use crate::kernel::queue::{TaskPayload, WorkQueue};

const CANCEL_FLAG_TTL: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("not found")]
    NotFound,

    #[error("job is already terminal ({0:?})")]
    AlreadyTerminal(JobStatus),

    #[error("invalid state transition {from:?} -> {to:?}")]
    InvalidStateTransition { from: JobStatus, to: JobStatus },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid cron: {0}")]
    InvalidCron(String),

    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Submission request: template mode carries `website_id`, ad-hoc mode
/// carries `inline_config`. Exactly one must be set.
#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    pub website_id: Option<WebsiteId>,
    pub inline_config: Option<serde_json::Value>,
    pub seed_url: String,
    pub variables: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
    pub priority: Option<i16>,
    pub schedule: Option<SubmitSchedule>,
}

#[derive(Debug, Clone)]
pub enum SubmitSchedule {
    /// Run once at a future time.
    At(DateTime<Utc>),
    /// Create a recurring entry; the first run happens immediately.
    Recurring { cron: String },
}

pub struct JobService {
    jobs: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    cache: Arc<dyn KvCache>,
    schedules: Arc<dyn ScheduleStore>,
    dlq: Arc<dyn DlqStore>,
    clock: Arc<dyn Clock>,
    hub: Arc<LogHub>,
}

impl JobService {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        queue: Arc<dyn WorkQueue>,
        cache: Arc<dyn KvCache>,
        schedules: Arc<dyn ScheduleStore>,
        dlq: Arc<dyn DlqStore>,
        clock: Arc<dyn Clock>,
        hub: Arc<LogHub>,
    ) -> Self {
        Self {
            jobs,
            queue,
            cache,
            schedules,
            dlq,
            clock,
            hub,
        }
    }

    fn cancel_key(job_id: JobId) -> String {
        format!("cancel:job:{job_id}")
    }

    async fn announce(&self, job_id: JobId, from: Option<JobStatus>, to: JobStatus) {
        self.hub
            .publish(
                job_id,
                LogEvent::StatusChange {
                    job_id,
                    from,
                    to,
                    at: self.clock.now(),
                },
            )
            .await;
    }

    /// Validate and persist a new job, then publish it to the queue.
    /// Publish failure rolls the row back: a failed submit leaves nothing
    /// visible.
    pub async fn submit(&self, request: SubmitRequest) -> Result<CrawlJob, ServiceError> {
        if let Some(config) = &request.inline_config {
            CrawlConfig::resolve(config, None)
                .map_err(|e| ServiceError::InvalidConfig(e.to_string()))?;
        }

        let now = self.clock.now();
        let (job_type, scheduled_at, recurring_cron) = match &request.schedule {
            None => (JobType::OneTime, None, None),
            Some(SubmitSchedule::At(at)) => (JobType::Scheduled, Some(*at), None),
            Some(SubmitSchedule::Recurring { cron: expr }) => {
                cron::parse(expr).map_err(|e| ServiceError::InvalidCron(e.to_string()))?;
                (JobType::Recurring, None, Some(expr.clone()))
            }
        };

        let base = CrawlJob::builder()
            .seed_url(request.seed_url.clone())
            .job_type(job_type)
            .metadata(request.metadata.clone().unwrap_or(serde_json::Value::Null))
            .variables(request.variables.clone().unwrap_or(serde_json::Value::Null))
            .priority(request.priority.unwrap_or(super::job::DEFAULT_PRIORITY));
        let mut job = match (request.website_id, request.inline_config.clone(), scheduled_at) {
            (Some(website_id), Some(config), Some(at)) => base
                .website_id(website_id)
                .inline_config(config)
                .scheduled_at(at)
                .build(),
            (Some(website_id), Some(config), None) => {
                base.website_id(website_id).inline_config(config).build()
            }
            (Some(website_id), None, Some(at)) => {
                base.website_id(website_id).scheduled_at(at).build()
            }
            (Some(website_id), None, None) => base.website_id(website_id).build(),
            (None, Some(config), Some(at)) => base.inline_config(config).scheduled_at(at).build(),
            (None, Some(config), None) => base.inline_config(config).build(),
            (None, None, Some(at)) => base.scheduled_at(at).build(),
            (None, None, None) => base.build(),
        };

        // A recurring submit also creates the scheduled entry driving
        // future firings; the job built here is the first run.
        if let Some(expr) = recurring_cron {
            let website_id = request.website_id.ok_or_else(|| {
                ServiceError::InvalidConfig(
                    "recurring submissions require a website template".to_string(),
                )
            })?;
            let entry = ScheduledJob::builder()
                .website_id(website_id)
                .cron_expression(expr)
                .seed_url(request.seed_url.clone())
                .build();
            let next = entry.next_fire_after(now)?;
            let mut entry = entry;
            entry.next_run_time = next;
            let entry = self.schedules.insert(&entry).await?;
            job.schedule_id = Some(entry.id);
        }

        job.validate()?;
        let job = self.jobs.insert(&job).await?;

        // Deferred jobs are dispatched by the scheduler when due.
        if job.scheduled_at.map(|at| at <= now).unwrap_or(true) {
            if let Err(e) = self.publish_job(&job).await {
                self.jobs.delete(job.id).await?;
                return Err(e);
            }
        }

        info!(job_id = %job.id, job_type = ?job.job_type, "job submitted");
        self.announce(job.id, None, JobStatus::Pending).await;
        Ok(job)
    }

    async fn publish_job(&self, job: &CrawlJob) -> Result<(), ServiceError> {
        let payload = TaskPayload {
            job_id: job.id,
            website_id: job.website_id,
            priority: job.priority,
        };
        let dedup_key = if job.retry_count > 0 {
            format!("{}:{}", job.id, job.retry_count)
        } else {
            job.id.to_string()
        };
        self.queue
            .publish(&payload, &dedup_key)
            .await
            .map_err(|e| ServiceError::QueueUnavailable(e.to_string()))
    }

    /// Cancel a job. Pending jobs are pulled out of the queue; running
    /// jobs get the shared cancellation flag and move to `cancelling`
    /// until the worker finishes cleanup.
    pub async fn cancel(
        &self,
        job_id: JobId,
        by: &str,
        reason: &str,
    ) -> Result<CrawlJob, ServiceError> {
        let job = self.jobs.get(job_id).await?.ok_or(ServiceError::NotFound)?;
        if job.status.is_terminal() {
            return Err(ServiceError::AlreadyTerminal(job.status));
        }

        let now = self.clock.now();
        if job.status == JobStatus::Pending {
            let deleted = self
                .queue
                .delete(job_id)
                .await
                .map_err(|e| ServiceError::QueueUnavailable(e.to_string()))?;
            let deferred = job.scheduled_at.map(|at| at > now).unwrap_or(false);
            if deleted || deferred {
                let cancelled = self
                    .jobs
                    .transition(
                        job_id,
                        &[JobStatus::Pending],
                        JobStatus::Cancelled,
                        JobPatch {
                            cancelled_at: Some(now),
                            cancelled_by: Some(by.to_string()),
                            cancellation_reason: Some(reason.to_string()),
                            ..Default::default()
                        },
                    )
                    .await?;
                if let Some(cancelled) = cancelled {
                    self.announce(job_id, Some(JobStatus::Pending), JobStatus::Cancelled)
                        .await;
                    return Ok(cancelled);
                }
                // A worker leased the entry between our read and the
                // transition; fall through to the running path.
            }
        }

        // Running (or already leased): raise the shared flag and move to
        // cancelling. The worker observes the flag, cleans up, and writes
        // the terminal status.
        self.cache
            .set(&Self::cancel_key(job_id), json!(true), CANCEL_FLAG_TTL)
            .await
            .map_err(|e| ServiceError::QueueUnavailable(e.to_string()))?;

        let cancelling = self
            .jobs
            .transition(
                job_id,
                &[JobStatus::Running, JobStatus::Cancelling],
                JobStatus::Cancelling,
                JobPatch {
                    cancelled_by: Some(by.to_string()),
                    cancellation_reason: Some(reason.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        if let Some(job) = cancelling {
            self.announce(job_id, Some(JobStatus::Running), JobStatus::Cancelling)
                .await;
            return Ok(job);
        }

        // Still pending: the queue entry was not deleted but no worker has
        // started either. Cancel the row directly; a later delivery loses
        // the pending → running compare-and-set and gets acked away.
        let cancelled = self
            .jobs
            .transition(
                job_id,
                &[JobStatus::Pending],
                JobStatus::Cancelled,
                JobPatch {
                    cancelled_at: Some(now),
                    cancelled_by: Some(by.to_string()),
                    cancellation_reason: Some(reason.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        if let Some(job) = cancelled {
            if let Err(e) = self.cache.delete(&Self::cancel_key(job_id)).await {
                warn!(job_id = %job_id, error = %e, "failed to clear cancellation flag");
            }
            self.announce(job_id, Some(JobStatus::Pending), JobStatus::Cancelled)
                .await;
            return Ok(job);
        }

        // Raced with a terminal write.
        let job = self.jobs.get(job_id).await?.ok_or(ServiceError::NotFound)?;
        Err(ServiceError::AlreadyTerminal(job.status))
    }

    pub async fn get(&self, job_id: JobId) -> Result<CrawlJob, ServiceError> {
        self.jobs.get(job_id).await?.ok_or(ServiceError::NotFound)
    }

    pub async fn list(
        &self,
        filter: &JobFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<CrawlJob>, ServiceError> {
        Ok(self.jobs.list(filter, limit, offset).await?)
    }

    // ------------------------------------------------------------------
    // Worker-facing transitions
    // ------------------------------------------------------------------

    /// Compare-and-set `pending → running`. None means the job was not
    /// pending (duplicate delivery, cancellation, terminal state).
    pub async fn mark_running(&self, job_id: JobId) -> Result<Option<CrawlJob>, ServiceError> {
        let job = self
            .jobs
            .transition(
                job_id,
                &[JobStatus::Pending],
                JobStatus::Running,
                JobPatch {
                    started_at: Some(self.clock.now()),
                    ..Default::default()
                },
            )
            .await?;
        if job.is_some() {
            self.announce(job_id, Some(JobStatus::Pending), JobStatus::Running)
                .await;
        }
        Ok(job)
    }

    /// Successful pipeline return (including partial and
    /// pagination-stopped outcomes).
    pub async fn complete(
        &self,
        job_id: JobId,
        result: &CrawlResult,
    ) -> Result<Option<CrawlJob>, ServiceError> {
        let job = self
            .jobs
            .transition(
                job_id,
                &[JobStatus::Running],
                JobStatus::Completed,
                JobPatch {
                    completed_at: Some(self.clock.now()),
                    progress: Some(json!({
                        "outcome": result.outcome.as_str(),
                        "counters": result.progress,
                        "warnings": result.warnings,
                    })),
                    ..Default::default()
                },
            )
            .await?;
        if job.is_some() {
            self.announce(job_id, Some(JobStatus::Running), JobStatus::Completed)
                .await;
            self.hub
                .publish(
                    job_id,
                    LogEvent::Progress {
                        job_id,
                        progress: json!(result.progress),
                    },
                )
                .await;
        }
        Ok(job)
    }

    /// Terminal failure: write `failed` and the dead-letter row.
    pub async fn fail_terminal(
        &self,
        job: &CrawlJob,
        error: &str,
        category: ErrorCategory,
        progress: Option<serde_json::Value>,
    ) -> Result<(), ServiceError> {
        let updated = self
            .jobs
            .transition(
                job.id,
                &[JobStatus::Running],
                JobStatus::Failed,
                JobPatch {
                    completed_at: Some(self.clock.now()),
                    error_message: Some(error.to_string()),
                    error_category: Some(category),
                    progress,
                    ..Default::default()
                },
            )
            .await?;
        if updated.is_none() {
            return Ok(());
        }
        self.dlq
            .insert(&DeadLetterJob::new(
                job.id,
                job.website_id,
                category,
                job.retry_count + 1,
                error.to_string(),
            ))
            .await?;
        self.announce(job.id, Some(JobStatus::Running), JobStatus::Failed)
            .await;
        Ok(())
    }

    /// Retryable failure: back to `pending` with the backoff timestamp.
    /// The scheduler republishes once the delay elapses.
    pub async fn requeue_retry(
        &self,
        job_id: JobId,
        delay: Duration,
        error: &str,
        category: ErrorCategory,
    ) -> Result<Option<CrawlJob>, ServiceError> {
        let scheduled_at = self.clock.now() + chrono::Duration::from_std(delay).unwrap_or_default();
        let job = self
            .jobs
            .transition(
                job_id,
                &[JobStatus::Running],
                JobStatus::Pending,
                JobPatch {
                    scheduled_at: Some(scheduled_at),
                    error_message: Some(error.to_string()),
                    error_category: Some(category),
                    increment_retry: true,
                    ..Default::default()
                },
            )
            .await?;
        if job.is_some() {
            self.announce(job_id, Some(JobStatus::Running), JobStatus::Pending)
                .await;
        }
        Ok(job)
    }

    /// Worker finished cleanup after a cancel. Clears the shared flag
    /// only after the terminal status is written.
    pub async fn mark_cancelled(
        &self,
        job_id: JobId,
        progress: Option<serde_json::Value>,
    ) -> Result<Option<CrawlJob>, ServiceError> {
        let job = self
            .jobs
            .transition(
                job_id,
                &[JobStatus::Cancelling, JobStatus::Running],
                JobStatus::Cancelled,
                JobPatch {
                    cancelled_at: Some(self.clock.now()),
                    progress,
                    ..Default::default()
                },
            )
            .await?;
        if job.is_some() {
            if let Err(e) = self.cache.delete(&Self::cancel_key(job_id)).await {
                warn!(job_id = %job_id, error = %e, "failed to clear cancellation flag");
            }
            self.announce(job_id, Some(JobStatus::Cancelling), JobStatus::Cancelled)
                .await;
        }
        Ok(job)
    }

    // ------------------------------------------------------------------
    // Scheduler-facing entry points
    // ------------------------------------------------------------------

    /// Whether the most recent job for a scheduled entry is still live.
    pub async fn schedule_has_live_job(
        &self,
        schedule_id: ScheduleId,
    ) -> Result<bool, ServiceError> {
        Ok(self
            .jobs
            .latest_for_schedule(schedule_id)
            .await?
            .map(|job| !job.status.is_terminal())
            .unwrap_or(false))
    }

    /// Materialize one firing of a scheduled entry.
    pub async fn submit_scheduled(
        &self,
        entry: &ScheduledJob,
        seed_url: &str,
        fire_time: DateTime<Utc>,
    ) -> Result<CrawlJob, ServiceError> {
        let job = CrawlJob::builder()
            .website_id(entry.website_id)
            .schedule_id(entry.id)
            .job_type(JobType::Scheduled)
            .seed_url(seed_url.to_string())
            .metadata(json!({"schedule_id": entry.id}))
            .build();
        job.validate()?;
        let job = self.jobs.insert(&job).await?;

        let payload = TaskPayload {
            job_id: job.id,
            website_id: Some(entry.website_id),
            priority: job.priority,
        };
        // Keyed on the firing, not the job: a racing second scheduler
        // instance publishing the same firing dedups away.
        let dedup_key = format!("{}:{}", entry.id, fire_time.timestamp());
        if let Err(e) = self.queue.publish(&payload, &dedup_key).await {
            self.jobs.delete(job.id).await?;
            return Err(ServiceError::QueueUnavailable(e.to_string()));
        }

        self.announce(job.id, None, JobStatus::Pending).await;
        Ok(job)
    }

    /// Publish pending jobs whose backoff/schedule time has come due.
    pub async fn dispatch_due(&self, now: DateTime<Utc>, limit: i64) -> Result<usize, ServiceError> {
        let due = self.jobs.due_pending(now, limit).await?;
        let mut dispatched = 0;
        for job in due {
            match self.publish_job(&job).await {
                Ok(()) => dispatched += 1,
                Err(e) => warn!(job_id = %job.id, error = %e, "failed to dispatch due job"),
            }
        }
        Ok(dispatched)
    }

    // ------------------------------------------------------------------
    // Dead-letter re-entry
    // ------------------------------------------------------------------

    /// Manual DLQ retry: a fresh job with the original config source and
    /// `job_type`, `retry_count` reset, linked to the dead-letter row.
    pub async fn retry_dead_letter(&self, dlq_id: Uuid) -> Result<CrawlJob, ServiceError> {
        let row = self.dlq.get(dlq_id).await?.ok_or(ServiceError::NotFound)?;
        let original = self
            .jobs
            .get(row.job_id)
            .await?
            .ok_or(ServiceError::NotFound)?;

        let base = CrawlJob::builder()
            .job_type(original.job_type)
            .seed_url(original.seed_url.clone())
            .variables(original.variables.clone())
            .metadata(json!({"dead_letter_id": dlq_id, "original_job_id": original.id}))
            .priority(original.priority);
        let job = match (original.website_id, original.inline_config.clone()) {
            (Some(website_id), Some(config)) => {
                base.website_id(website_id).inline_config(config).build()
            }
            (Some(website_id), None) => base.website_id(website_id).build(),
            (None, Some(config)) => base.inline_config(config).build(),
            (None, None) => base.build(),
        };
        job.validate()?;
        let job = self.jobs.insert(&job).await?;

        if let Err(e) = self.publish_job(&job).await {
            self.jobs.delete(job.id).await?;
            return Err(e);
        }
        self.dlq.mark_retried(dlq_id, job.id).await?;
        self.announce(job.id, None, JobStatus::Pending).await;
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ManualClock;
    use crate::domains::retries::MemoryDlqStore;
    use crate::domains::schedules::MemoryScheduleStore;
    use crate::jobs::testing::MemoryJobStore;
    use crate::kernel::queue::{Delivery, MemoryWorkQueue, QueueError};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use seed_crawler::cache::MemoryKvCache;
    use seed_crawler::types::{CrawlOutcome, Progress};

    struct FailingQueue;

    #[async_trait]
    impl WorkQueue for FailingQueue {
        async fn publish(&self, _payload: &TaskPayload, _key: &str) -> Result<(), QueueError> {
            Err(QueueError::Unavailable("nats is down".to_string()))
        }
        async fn pull(&self, _max: usize, _wait: Duration) -> Result<Vec<Delivery>, QueueError> {
            Ok(Vec::new())
        }
        async fn ack(&self, _delivery: Delivery) -> Result<(), QueueError> {
            Ok(())
        }
        async fn nak(
            &self,
            _delivery: Delivery,
            _retry_after: Option<Duration>,
        ) -> Result<(), QueueError> {
            Ok(())
        }
        async fn touch(&self, _delivery: &Delivery) -> Result<(), QueueError> {
            Ok(())
        }
        async fn delete(&self, _job_id: JobId) -> Result<bool, QueueError> {
            Ok(false)
        }
    }

    struct Fixture {
        service: JobService,
        jobs: Arc<MemoryJobStore>,
        queue: Arc<MemoryWorkQueue>,
        cache: Arc<MemoryKvCache>,
        schedules: Arc<MemoryScheduleStore>,
        dlq: Arc<MemoryDlqStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        fixture_with_queue(Arc::new(MemoryWorkQueue::new()))
    }

    fn fixture_with_queue(queue: Arc<MemoryWorkQueue>) -> Fixture {
        let jobs = Arc::new(MemoryJobStore::new());
        let cache = Arc::new(MemoryKvCache::new());
        let schedules = Arc::new(MemoryScheduleStore::new());
        let dlq = Arc::new(MemoryDlqStore::new());
        let clock = Arc::new(ManualClock::at(
            Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap(),
        ));
        let service = JobService::new(
            jobs.clone(),
            queue.clone(),
            cache.clone(),
            schedules.clone(),
            dlq.clone(),
            clock.clone(),
            Arc::new(LogHub::new()),
        );
        Fixture {
            service,
            jobs,
            queue,
            cache,
            schedules,
            dlq,
            clock,
        }
    }

    fn template_request() -> SubmitRequest {
        SubmitRequest {
            website_id: Some(WebsiteId::new()),
            seed_url: "https://example.test/?q=alpha".to_string(),
            ..Default::default()
        }
    }

    fn inline_request() -> SubmitRequest {
        SubmitRequest {
            inline_config: Some(serde_json::json!({
                "steps": [{"kind": "crawl_list", "selectors": {"link": "a"}}]
            })),
            seed_url: "https://example.test/".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn submit_inserts_pending_and_publishes() {
        let f = fixture();
        let job = f.service.submit(template_request()).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.job_type, JobType::OneTime);
        assert_eq!(f.queue.pending_len(), 1);
        assert_eq!(f.jobs.len(), 1);
    }

    #[tokio::test]
    async fn submit_rejects_both_config_sources() {
        let f = fixture();
        let mut request = template_request();
        request.inline_config = inline_request().inline_config;
        let err = f.service.submit(request).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidConfig(_)));
        assert!(f.jobs.is_empty());
    }

    #[tokio::test]
    async fn submit_rejects_bad_inline_config() {
        let f = fixture();
        let mut request = inline_request();
        request.inline_config = Some(serde_json::json!({"steps": [{"kind": "warp"}]}));
        let err = f.service.submit(request).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn submit_rejects_bad_cron() {
        let f = fixture();
        let mut request = template_request();
        request.schedule = Some(SubmitSchedule::Recurring {
            cron: "whenever".to_string(),
        });
        let err = f.service.submit(request).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidCron(_)));
    }

    #[tokio::test]
    async fn publish_failure_rolls_back_the_row() {
        let jobs = Arc::new(MemoryJobStore::new());
        let service = JobService::new(
            jobs.clone(),
            Arc::new(FailingQueue),
            Arc::new(MemoryKvCache::new()),
            Arc::new(MemoryScheduleStore::new()),
            Arc::new(MemoryDlqStore::new()),
            Arc::new(ManualClock::at(Utc::now())),
            Arc::new(LogHub::new()),
        );

        let err = service.submit(template_request()).await.unwrap_err();
        assert!(matches!(err, ServiceError::QueueUnavailable(_)));
        // No job row survives a failed submit.
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn deferred_submit_is_not_published_until_due() {
        let f = fixture();
        let mut request = template_request();
        request.schedule = Some(SubmitSchedule::At(f.clock.now() + chrono::Duration::hours(2)));
        let job = f.service.submit(request).await.unwrap();
        assert_eq!(job.job_type, JobType::Scheduled);
        assert_eq!(f.queue.pending_len(), 0);

        f.clock.advance(chrono::Duration::hours(3));
        let dispatched = f.service.dispatch_due(f.clock.now(), 10).await.unwrap();
        assert_eq!(dispatched, 1);
        assert_eq!(f.queue.pending_len(), 1);
    }

    #[tokio::test]
    async fn recurring_submit_creates_the_scheduled_entry() {
        let f = fixture();
        let mut request = template_request();
        request.schedule = Some(SubmitSchedule::Recurring {
            cron: "0 0 1,15 * *".to_string(),
        });
        let job = f.service.submit(request).await.unwrap();
        assert_eq!(job.job_type, JobType::Recurring);
        let entry = f.schedules.get(job.schedule_id.unwrap()).await.unwrap();
        assert!(entry.unwrap().next_run_time.unwrap() > f.clock.now());
    }

    #[tokio::test]
    async fn cancel_pending_deletes_from_queue() {
        let f = fixture();
        let job = f.service.submit(template_request()).await.unwrap();
        assert_eq!(f.queue.pending_len(), 1);

        let cancelled = f.service.cancel(job.id, "operator", "not needed").await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(cancelled.cancelled_by.as_deref(), Some("operator"));
        assert_eq!(f.queue.pending_len(), 0);
        // Pre-start cancellation never raises the flag.
        assert!(!f
            .cache
            .exists(&format!("cancel:job:{}", job.id))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn cancel_running_raises_flag_and_moves_to_cancelling() {
        let f = fixture();
        let job = f.service.submit(template_request()).await.unwrap();
        let _leased = f.queue.pull(1, Duration::ZERO).await.unwrap();
        f.service.mark_running(job.id).await.unwrap().unwrap();

        let cancelling = f.service.cancel(job.id, "operator", "oops").await.unwrap();
        assert_eq!(cancelling.status, JobStatus::Cancelling);
        assert!(f
            .cache
            .exists(&format!("cancel:job:{}", job.id))
            .await
            .unwrap());

        // Worker finishes cleanup and lands the terminal state; the flag
        // clears only after that write.
        let done = f.service.mark_cancelled(job.id, None).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Cancelled);
        assert!(!f
            .cache
            .exists(&format!("cancel:job:{}", job.id))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn cancel_terminal_job_is_rejected() {
        let f = fixture();
        let job = f.service.submit(template_request()).await.unwrap();
        f.service.mark_running(job.id).await.unwrap().unwrap();
        let result = CrawlResult::new(CrawlOutcome::Success, Progress::default());
        f.service.complete(job.id, &result).await.unwrap().unwrap();

        let err = f.service.cancel(job.id, "operator", "late").await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::AlreadyTerminal(JobStatus::Completed)
        ));
    }

    #[tokio::test]
    async fn cancel_unknown_job_is_not_found() {
        let f = fixture();
        let err = f
            .service
            .cancel(JobId::new(), "operator", "ghost")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound));
    }

    #[tokio::test]
    async fn duplicate_start_loses_the_compare_and_set() {
        let f = fixture();
        let job = f.service.submit(template_request()).await.unwrap();
        assert!(f.service.mark_running(job.id).await.unwrap().is_some());
        assert!(f.service.mark_running(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn requeue_retry_backs_off_and_redispatches() {
        let f = fixture();
        let job = f.service.submit(template_request()).await.unwrap();
        f.service.mark_running(job.id).await.unwrap().unwrap();

        let retried = f
            .service
            .requeue_retry(
                job.id,
                Duration::from_secs(120),
                "http 503",
                ErrorCategory::ServerError,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(retried.retry_count, 1);
        assert!(retried.scheduled_at.unwrap() > f.clock.now());

        // Not due yet.
        assert_eq!(f.service.dispatch_due(f.clock.now(), 10).await.unwrap(), 0);
        f.clock.advance(chrono::Duration::seconds(180));
        assert_eq!(f.service.dispatch_due(f.clock.now(), 10).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn terminal_failure_writes_the_dead_letter_row() {
        let f = fixture();
        let job = f.service.submit(template_request()).await.unwrap();
        let running = f.service.mark_running(job.id).await.unwrap().unwrap();

        f.service
            .fail_terminal(
                &running,
                "seed_url_404: https://example.test/",
                ErrorCategory::NotFound,
                None,
            )
            .await
            .unwrap();

        let failed = f.service.get(job.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.error_message.unwrap().contains("seed_url_404"));

        let rows = f.dlq.all();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].error_category, ErrorCategory::NotFound);
        assert_eq!(rows[0].job_id, job.id);
    }

    #[tokio::test]
    async fn dead_letter_retry_creates_a_fresh_linked_job() {
        let f = fixture();
        let job = f.service.submit(inline_request()).await.unwrap();
        let running = f.service.mark_running(job.id).await.unwrap().unwrap();
        f.service
            .fail_terminal(&running, "boom", ErrorCategory::Unknown, None)
            .await
            .unwrap();

        let dlq_id = f.dlq.all()[0].id;
        let replay = f.service.retry_dead_letter(dlq_id).await.unwrap();

        assert_ne!(replay.id, job.id);
        assert_eq!(replay.job_type, job.job_type);
        assert_eq!(replay.retry_count, 0);
        assert_eq!(replay.status, JobStatus::Pending);
        assert_eq!(
            replay.metadata["dead_letter_id"],
            serde_json::json!(dlq_id)
        );
        assert_eq!(f.dlq.all()[0].retry_job_id, Some(replay.id));
    }

    #[tokio::test]
    async fn stack_prevention_sees_live_jobs() {
        let f = fixture();
        let entry = ScheduledJob::builder()
            .website_id(WebsiteId::new())
            .cron_expression("0 0 * * *")
            .build();
        f.schedules.insert(&entry).await.unwrap();

        assert!(!f.service.schedule_has_live_job(entry.id).await.unwrap());
        let job = f
            .service
            .submit_scheduled(&entry, "https://example.test/", f.clock.now())
            .await
            .unwrap();
        assert!(f.service.schedule_has_live_job(entry.id).await.unwrap());

        f.service.mark_running(job.id).await.unwrap().unwrap();
        let result = CrawlResult::new(CrawlOutcome::Success, Progress::default());
        f.service.complete(job.id, &result).await.unwrap().unwrap();
        assert!(!f.service.schedule_has_live_job(entry.id).await.unwrap());
    }
}
