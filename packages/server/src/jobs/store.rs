//! Job persistence.
//!
//! Status changes go through `transition`, a compare-and-set on the
//! current status. That single primitive carries the whole lifecycle:
//! duplicate worker starts lose the `pending → running` race, cancels
//! cannot resurrect terminal jobs, and retries re-enter `pending`
//! atomically with their backoff timestamp.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use seed_crawler::types::{JobId, ScheduleId, WebsiteId};

use super::job::{CrawlJob, JobPatch, JobStatus, JobType};

/// Filter for job listings.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub website_id: Option<WebsiteId>,
    pub job_type: Option<JobType>,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &CrawlJob) -> Result<CrawlJob>;

    async fn get(&self, id: JobId) -> Result<Option<CrawlJob>>;

    /// Remove a row outright. Only used to roll back a failed submit.
    async fn delete(&self, id: JobId) -> Result<()>;

    async fn list(&self, filter: &JobFilter, limit: i64, offset: i64) -> Result<Vec<CrawlJob>>;

    /// Compare-and-set status change. Returns the updated row, or None
    /// when the current status was not in `from`.
    async fn transition(
        &self,
        id: JobId,
        from: &[JobStatus],
        to: JobStatus,
        patch: JobPatch,
    ) -> Result<Option<CrawlJob>>;

    /// Most recent job derived from a scheduled entry (stack prevention).
    async fn latest_for_schedule(&self, schedule_id: ScheduleId) -> Result<Option<CrawlJob>>;

    /// Pending jobs whose backoff/schedule timestamp has come due.
    async fn due_pending(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<CrawlJob>>;
}

const JOB_COLUMNS: &str = r#"
    id, website_id, inline_config, schedule_id, job_type, seed_url, status,
    priority, retry_count, scheduled_at, started_at, completed_at,
    cancelled_at, cancelled_by, cancellation_reason, error_message,
    error_category, metadata, variables, progress, created_at, updated_at
"#;

pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert(&self, job: &CrawlJob) -> Result<CrawlJob> {
        let inserted = sqlx::query_as::<_, CrawlJob>(&format!(
            r#"
            INSERT INTO crawl_jobs (
                id, website_id, inline_config, schedule_id, job_type, seed_url, status,
                priority, retry_count, scheduled_at, started_at, completed_at,
                cancelled_at, cancelled_by, cancellation_reason, error_message,
                error_category, metadata, variables, progress, created_at, updated_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                $13, $14, $15, $16, $17, $18, $19, $20, $21, $22
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job.id)
        .bind(job.website_id)
        .bind(&job.inline_config)
        .bind(job.schedule_id)
        .bind(job.job_type)
        .bind(&job.seed_url)
        .bind(job.status)
        .bind(job.priority)
        .bind(job.retry_count)
        .bind(job.scheduled_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.cancelled_at)
        .bind(&job.cancelled_by)
        .bind(&job.cancellation_reason)
        .bind(&job.error_message)
        .bind(job.error_category)
        .bind(&job.metadata)
        .bind(&job.variables)
        .bind(&job.progress)
        .bind(job.created_at)
        .bind(job.updated_at)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert crawl job")?;

        Ok(inserted)
    }

    async fn get(&self, id: JobId) -> Result<Option<CrawlJob>> {
        let job = sqlx::query_as::<_, CrawlJob>(&format!(
            "SELECT {JOB_COLUMNS} FROM crawl_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load crawl job")?;
        Ok(job)
    }

    async fn delete(&self, id: JobId) -> Result<()> {
        sqlx::query("DELETE FROM crawl_jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to delete crawl job")?;
        Ok(())
    }

    async fn list(&self, filter: &JobFilter, limit: i64, offset: i64) -> Result<Vec<CrawlJob>> {
        let jobs = sqlx::query_as::<_, CrawlJob>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM crawl_jobs
            WHERE ($1::job_status IS NULL OR status = $1)
              AND ($2::uuid IS NULL OR website_id = $2)
              AND ($3::job_type IS NULL OR job_type = $3)
            ORDER BY created_at DESC
            LIMIT $4 OFFSET $5
            "#
        ))
        .bind(filter.status)
        .bind(filter.website_id)
        .bind(filter.job_type)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .context("failed to list crawl jobs")?;
        Ok(jobs)
    }

    async fn transition(
        &self,
        id: JobId,
        from: &[JobStatus],
        to: JobStatus,
        patch: JobPatch,
    ) -> Result<Option<CrawlJob>> {
        let job = sqlx::query_as::<_, CrawlJob>(&format!(
            r#"
            UPDATE crawl_jobs SET
                status = $2,
                started_at = COALESCE($3, started_at),
                completed_at = COALESCE($4, completed_at),
                cancelled_at = COALESCE($5, cancelled_at),
                cancelled_by = COALESCE($6, cancelled_by),
                cancellation_reason = COALESCE($7, cancellation_reason),
                error_message = COALESCE($8, error_message),
                error_category = COALESCE($9, error_category),
                scheduled_at = COALESCE($10, scheduled_at),
                progress = COALESCE($11, progress),
                retry_count = retry_count + $12,
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($13)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(to)
        .bind(patch.started_at)
        .bind(patch.completed_at)
        .bind(patch.cancelled_at)
        .bind(&patch.cancelled_by)
        .bind(&patch.cancellation_reason)
        .bind(&patch.error_message)
        .bind(patch.error_category)
        .bind(patch.scheduled_at)
        .bind(&patch.progress)
        .bind(if patch.increment_retry { 1i32 } else { 0i32 })
        .bind(from.to_vec())
        .fetch_optional(&self.pool)
        .await
        .context("failed to transition crawl job")?;

        Ok(job)
    }

    async fn latest_for_schedule(&self, schedule_id: ScheduleId) -> Result<Option<CrawlJob>> {
        let job = sqlx::query_as::<_, CrawlJob>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM crawl_jobs
            WHERE schedule_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(schedule_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load latest job for schedule")?;
        Ok(job)
    }

    async fn due_pending(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<CrawlJob>> {
        let jobs = sqlx::query_as::<_, CrawlJob>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM crawl_jobs
            WHERE status = 'pending'
              AND scheduled_at IS NOT NULL
              AND scheduled_at <= $1
            ORDER BY priority ASC, scheduled_at ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to load due pending jobs")?;
        Ok(jobs)
    }
}
