//! Scheduled-entry persistence.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use seed_crawler::types::{ScheduleId, WebsiteId};

use super::scheduled_job::ScheduledJob;

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn insert(&self, entry: &ScheduledJob) -> Result<ScheduledJob>;

    async fn get(&self, id: ScheduleId) -> Result<Option<ScheduledJob>>;

    async fn for_website(&self, website_id: WebsiteId) -> Result<Vec<ScheduledJob>>;

    /// Active entries due at `now`, oldest `next_run_time` first.
    async fn due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ScheduledJob>>;

    /// Advance an entry past a firing. Compare-and-set on the previous
    /// `next_run_time` so two scheduler instances cannot double-fire.
    async fn advance(
        &self,
        id: ScheduleId,
        expected_next: Option<DateTime<Utc>>,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    async fn set_active(&self, id: ScheduleId, active: bool) -> Result<bool>;

    async fn set_active_for_website(&self, website_id: WebsiteId, active: bool) -> Result<u64>;
}

const SCHEDULE_COLUMNS: &str = r#"
    id, website_id, cron_expression, timezone, seed_url, next_run_time,
    last_run_time, is_active, overrides, created_at, updated_at
"#;

pub struct PostgresScheduleStore {
    pool: PgPool,
}

impl PostgresScheduleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScheduleStore for PostgresScheduleStore {
    async fn insert(&self, entry: &ScheduledJob) -> Result<ScheduledJob> {
        let inserted = sqlx::query_as::<_, ScheduledJob>(&format!(
            r#"
            INSERT INTO scheduled_jobs (
                id, website_id, cron_expression, timezone, seed_url, next_run_time,
                last_run_time, is_active, overrides, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {SCHEDULE_COLUMNS}
            "#
        ))
        .bind(entry.id)
        .bind(entry.website_id)
        .bind(&entry.cron_expression)
        .bind(&entry.timezone)
        .bind(&entry.seed_url)
        .bind(entry.next_run_time)
        .bind(entry.last_run_time)
        .bind(entry.is_active)
        .bind(&entry.overrides)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert scheduled job")?;
        Ok(inserted)
    }

    async fn get(&self, id: ScheduleId) -> Result<Option<ScheduledJob>> {
        let entry = sqlx::query_as::<_, ScheduledJob>(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM scheduled_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load scheduled job")?;
        Ok(entry)
    }

    async fn for_website(&self, website_id: WebsiteId) -> Result<Vec<ScheduledJob>> {
        let entries = sqlx::query_as::<_, ScheduledJob>(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM scheduled_jobs WHERE website_id = $1 ORDER BY created_at"
        ))
        .bind(website_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list scheduled jobs for website")?;
        Ok(entries)
    }

    async fn due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ScheduledJob>> {
        let entries = sqlx::query_as::<_, ScheduledJob>(&format!(
            r#"
            SELECT {SCHEDULE_COLUMNS}
            FROM scheduled_jobs
            WHERE is_active AND next_run_time IS NOT NULL AND next_run_time <= $1
            ORDER BY next_run_time ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to load due scheduled jobs")?;
        Ok(entries)
    }

    async fn advance(
        &self,
        id: ScheduleId,
        expected_next: Option<DateTime<Utc>>,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let affected = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET last_run_time = $3, next_run_time = $4, updated_at = NOW()
            WHERE id = $1
              AND next_run_time IS NOT DISTINCT FROM $2
              AND is_active
            "#,
        )
        .bind(id)
        .bind(expected_next)
        .bind(last_run)
        .bind(next_run)
        .execute(&self.pool)
        .await
        .context("failed to advance scheduled job")?
        .rows_affected();
        Ok(affected > 0)
    }

    async fn set_active(&self, id: ScheduleId, active: bool) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE scheduled_jobs SET is_active = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(active)
        .execute(&self.pool)
        .await
        .context("failed to toggle scheduled job")?
        .rows_affected();
        Ok(affected > 0)
    }

    async fn set_active_for_website(&self, website_id: WebsiteId, active: bool) -> Result<u64> {
        let affected = sqlx::query(
            "UPDATE scheduled_jobs SET is_active = $2, updated_at = NOW() WHERE website_id = $1",
        )
        .bind(website_id)
        .bind(active)
        .execute(&self.pool)
        .await
        .context("failed to toggle scheduled jobs for website")?
        .rows_affected();
        Ok(affected)
    }
}

/// In-memory schedule store for tests.
#[derive(Default)]
pub struct MemoryScheduleStore {
    entries: RwLock<HashMap<ScheduleId, ScheduledJob>>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn insert(&self, entry: &ScheduledJob) -> Result<ScheduledJob> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(entry.id, entry.clone());
        Ok(entry.clone())
    }

    async fn get(&self, id: ScheduleId) -> Result<Option<ScheduledJob>> {
        Ok(self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned())
    }

    async fn for_website(&self, website_id: WebsiteId) -> Result<Vec<ScheduledJob>> {
        Ok(self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|e| e.website_id == website_id)
            .cloned()
            .collect())
    }

    async fn due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ScheduledJob>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut due: Vec<ScheduledJob> = entries
            .values()
            .filter(|e| e.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|e| e.next_run_time);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn advance(
        &self,
        id: ScheduleId,
        expected_next: Option<DateTime<Utc>>,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        match entries.get_mut(&id) {
            Some(entry) if entry.is_active && entry.next_run_time == expected_next => {
                entry.last_run_time = Some(last_run);
                entry.next_run_time = next_run;
                entry.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_active(&self, id: ScheduleId, active: bool) -> Result<bool> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        match entries.get_mut(&id) {
            Some(entry) => {
                entry.is_active = active;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_active_for_website(&self, website_id: WebsiteId, active: bool) -> Result<u64> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let mut affected = 0;
        for entry in entries.values_mut().filter(|e| e.website_id == website_id) {
            entry.is_active = active;
            affected += 1;
        }
        Ok(affected)
    }
}
