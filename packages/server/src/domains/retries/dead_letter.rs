//! Dead-letter rows for jobs that exhausted retries or hit a terminal
//! failure. Manual retry creates a fresh job linked back to the row.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use seed_crawler::retry::ErrorCategory;
use seed_crawler::types::{JobId, WebsiteId};

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterJob {
    pub id: Uuid,
    pub job_id: JobId,
    pub website_id: Option<WebsiteId>,
    pub error_category: ErrorCategory,
    pub attempts: i32,
    pub error_message: String,
    pub stack: Option<String>,
    pub created_at: DateTime<Utc>,
    pub retried_at: Option<DateTime<Utc>>,
    pub retry_job_id: Option<JobId>,
}

impl DeadLetterJob {
    pub fn new(
        job_id: JobId,
        website_id: Option<WebsiteId>,
        error_category: ErrorCategory,
        attempts: i32,
        error_message: String,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_id,
            website_id,
            error_category,
            attempts,
            error_message,
            stack: None,
            created_at: Utc::now(),
            retried_at: None,
            retry_job_id: None,
        }
    }
}

#[async_trait]
pub trait DlqStore: Send + Sync {
    async fn insert(&self, row: &DeadLetterJob) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterJob>>;

    async fn list_unretried(&self, limit: i64) -> Result<Vec<DeadLetterJob>>;

    /// Mark a row as manually retried, recording the replacement job.
    async fn mark_retried(&self, id: Uuid, retry_job_id: JobId) -> Result<bool>;
}

pub struct PostgresDlqStore {
    pool: PgPool,
}

impl PostgresDlqStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const DLQ_COLUMNS: &str = r#"
    id, job_id, website_id, error_category, attempts, error_message, stack,
    created_at, retried_at, retry_job_id
"#;

#[async_trait]
impl DlqStore for PostgresDlqStore {
    async fn insert(&self, row: &DeadLetterJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dead_letter_queue (
                id, job_id, website_id, error_category, attempts, error_message,
                stack, created_at, retried_at, retry_job_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(row.id)
        .bind(row.job_id)
        .bind(row.website_id)
        .bind(row.error_category)
        .bind(row.attempts)
        .bind(&row.error_message)
        .bind(&row.stack)
        .bind(row.created_at)
        .bind(row.retried_at)
        .bind(row.retry_job_id)
        .execute(&self.pool)
        .await
        .context("failed to insert dead-letter row")?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterJob>> {
        let row = sqlx::query_as::<_, DeadLetterJob>(&format!(
            "SELECT {DLQ_COLUMNS} FROM dead_letter_queue WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load dead-letter row")?;
        Ok(row)
    }

    async fn list_unretried(&self, limit: i64) -> Result<Vec<DeadLetterJob>> {
        let rows = sqlx::query_as::<_, DeadLetterJob>(&format!(
            r#"
            SELECT {DLQ_COLUMNS}
            FROM dead_letter_queue
            WHERE retried_at IS NULL
            ORDER BY created_at ASC
            LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to list dead-letter rows")?;
        Ok(rows)
    }

    async fn mark_retried(&self, id: Uuid, retry_job_id: JobId) -> Result<bool> {
        let affected = sqlx::query(
            r#"
            UPDATE dead_letter_queue
            SET retried_at = NOW(), retry_job_id = $2
            WHERE id = $1 AND retried_at IS NULL
            "#,
        )
        .bind(id)
        .bind(retry_job_id)
        .execute(&self.pool)
        .await
        .context("failed to mark dead-letter row retried")?
        .rows_affected();
        Ok(affected > 0)
    }
}

/// In-memory DLQ for tests.
#[derive(Default)]
pub struct MemoryDlqStore {
    rows: RwLock<HashMap<Uuid, DeadLetterJob>>,
}

impl MemoryDlqStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<DeadLetterJob> {
        self.rows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DlqStore for MemoryDlqStore {
    async fn insert(&self, row: &DeadLetterJob) -> Result<()> {
        self.rows
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(row.id, row.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterJob>> {
        Ok(self
            .rows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned())
    }

    async fn list_unretried(&self, limit: i64) -> Result<Vec<DeadLetterJob>> {
        let rows = self.rows.read().unwrap_or_else(|e| e.into_inner());
        let mut unretried: Vec<DeadLetterJob> = rows
            .values()
            .filter(|r| r.retried_at.is_none())
            .cloned()
            .collect();
        unretried.sort_by_key(|r| r.created_at);
        unretried.truncate(limit as usize);
        Ok(unretried)
    }

    async fn mark_retried(&self, id: Uuid, retry_job_id: JobId) -> Result<bool> {
        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
        match rows.get_mut(&id) {
            Some(row) if row.retried_at.is_none() => {
                row.retried_at = Some(Utc::now());
                row.retry_job_id = Some(retry_job_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
