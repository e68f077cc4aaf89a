//! Retry-attempt history, one row per scheduled retry.

use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use seed_crawler::retry::{ErrorCategory, RetryRecord};
use seed_crawler::traits::RetrySink;
use seed_crawler::types::JobId;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct RetryHistory {
    pub id: Uuid,
    pub job_id: JobId,
    pub url: Option<String>,
    pub error_category: ErrorCategory,
    pub attempt: i32,
    pub retry_delay_seconds: f64,
    pub error_message: String,
    pub created_at: DateTime<Utc>,
}

impl From<RetryRecord> for RetryHistory {
    fn from(record: RetryRecord) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_id: record.job_id,
            url: record.url,
            error_category: record.category,
            attempt: record.attempt as i32,
            retry_delay_seconds: record.delay_seconds,
            error_message: record.error,
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait RetryStore: Send + Sync {
    async fn record(&self, row: &RetryHistory) -> Result<()>;

    async fn for_job(&self, job_id: JobId) -> Result<Vec<RetryHistory>>;
}

pub struct PostgresRetryStore {
    pool: PgPool,
}

impl PostgresRetryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RetryStore for PostgresRetryStore {
    async fn record(&self, row: &RetryHistory) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO retry_history (
                id, job_id, url, error_category, attempt, retry_delay_seconds,
                error_message, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(row.id)
        .bind(row.job_id)
        .bind(&row.url)
        .bind(row.error_category)
        .bind(row.attempt)
        .bind(row.retry_delay_seconds)
        .bind(&row.error_message)
        .bind(row.created_at)
        .execute(&self.pool)
        .await
        .context("failed to record retry history")?;
        Ok(())
    }

    async fn for_job(&self, job_id: JobId) -> Result<Vec<RetryHistory>> {
        let rows = sqlx::query_as::<_, RetryHistory>(
            r#"
            SELECT id, job_id, url, error_category, attempt, retry_delay_seconds,
                   error_message, created_at
            FROM retry_history
            WHERE job_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list retry history")?;
        Ok(rows)
    }
}

#[async_trait]
impl RetrySink for PostgresRetryStore {
    async fn record_retry(&self, record: RetryRecord) -> Result<()> {
        self.record(&RetryHistory::from(record)).await
    }
}

/// In-memory retry store for tests.
#[derive(Default)]
pub struct MemoryRetryStore {
    rows: Mutex<Vec<RetryHistory>>,
}

impl MemoryRetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<RetryHistory> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl RetryStore for MemoryRetryStore {
    async fn record(&self, row: &RetryHistory) -> Result<()> {
        self.rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(row.clone());
        Ok(())
    }

    async fn for_job(&self, job_id: JobId) -> Result<Vec<RetryHistory>> {
        Ok(self
            .rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RetrySink for MemoryRetryStore {
    async fn record_retry(&self, record: RetryRecord) -> Result<()> {
        self.record(&RetryHistory::from(record)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retry_records_convert_and_filter_by_job() {
        let store = MemoryRetryStore::new();
        let job = JobId::new();
        store
            .record_retry(RetryRecord {
                job_id: job,
                url: Some("https://example.test/item/3".to_string()),
                category: ErrorCategory::RateLimit,
                attempt: 1,
                delay_seconds: 2.1,
                error: "http 429".to_string(),
            })
            .await
            .unwrap();
        store
            .record_retry(RetryRecord {
                job_id: JobId::new(),
                url: None,
                category: ErrorCategory::Network,
                attempt: 1,
                delay_seconds: 1.0,
                error: "reset".to_string(),
            })
            .await
            .unwrap();

        let rows = store.for_job(job).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].error_category, ErrorCategory::RateLimit);
        assert!((2.0..=2.4).contains(&rows[0].retry_delay_seconds));
    }
}
