//! Website persistence: template rows plus their config history.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use seed_crawler::types::WebsiteId;

use super::website::{Website, WebsiteConfigHistory, WebsiteStatus};

#[async_trait]
pub trait WebsiteStore: Send + Sync {
    async fn insert(&self, website: &Website) -> Result<Website>;

    /// Load by id, soft-deleted rows included (running jobs keep reading
    /// their template after deletion).
    async fn get(&self, id: WebsiteId) -> Result<Option<Website>>;

    /// Name lookup among non-soft-deleted rows.
    async fn find_by_name(&self, name: &str) -> Result<Option<Website>>;

    async fn update(&self, website: &Website) -> Result<Website>;

    async fn soft_delete(&self, id: WebsiteId, at: DateTime<Utc>) -> Result<bool>;

    async fn set_status(&self, id: WebsiteId, status: WebsiteStatus) -> Result<bool>;

    async fn add_history(&self, row: &WebsiteConfigHistory) -> Result<()>;

    async fn list_history(&self, website_id: WebsiteId) -> Result<Vec<WebsiteConfigHistory>>;

    async fn history_version(
        &self,
        website_id: WebsiteId,
        version: i32,
    ) -> Result<Option<WebsiteConfigHistory>>;

    async fn latest_version(&self, website_id: WebsiteId) -> Result<i32>;
}

const WEBSITE_COLUMNS: &str = r#"
    id, name, base_url, config, status, default_cron, deleted_at, created_at, updated_at
"#;

pub struct PostgresWebsiteStore {
    pool: PgPool,
}

impl PostgresWebsiteStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebsiteStore for PostgresWebsiteStore {
    async fn insert(&self, website: &Website) -> Result<Website> {
        let inserted = sqlx::query_as::<_, Website>(&format!(
            r#"
            INSERT INTO websites (
                id, name, base_url, config, status, default_cron, deleted_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {WEBSITE_COLUMNS}
            "#
        ))
        .bind(website.id)
        .bind(&website.name)
        .bind(&website.base_url)
        .bind(&website.config)
        .bind(website.status)
        .bind(&website.default_cron)
        .bind(website.deleted_at)
        .bind(website.created_at)
        .bind(website.updated_at)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert website")?;
        Ok(inserted)
    }

    async fn get(&self, id: WebsiteId) -> Result<Option<Website>> {
        let website = sqlx::query_as::<_, Website>(&format!(
            "SELECT {WEBSITE_COLUMNS} FROM websites WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load website")?;
        Ok(website)
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Website>> {
        let website = sqlx::query_as::<_, Website>(&format!(
            "SELECT {WEBSITE_COLUMNS} FROM websites WHERE name = $1 AND deleted_at IS NULL"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("failed to look up website by name")?;
        Ok(website)
    }

    async fn update(&self, website: &Website) -> Result<Website> {
        let updated = sqlx::query_as::<_, Website>(&format!(
            r#"
            UPDATE websites SET
                name = $2, base_url = $3, config = $4, status = $5,
                default_cron = $6, updated_at = NOW()
            WHERE id = $1
            RETURNING {WEBSITE_COLUMNS}
            "#
        ))
        .bind(website.id)
        .bind(&website.name)
        .bind(&website.base_url)
        .bind(&website.config)
        .bind(website.status)
        .bind(&website.default_cron)
        .fetch_one(&self.pool)
        .await
        .context("failed to update website")?;
        Ok(updated)
    }

    async fn soft_delete(&self, id: WebsiteId, at: DateTime<Utc>) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE websites SET deleted_at = $2, updated_at = NOW() WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await
        .context("failed to soft-delete website")?
        .rows_affected();
        Ok(affected > 0)
    }

    async fn set_status(&self, id: WebsiteId, status: WebsiteStatus) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE websites SET status = $2, updated_at = NOW() WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(status)
        .execute(&self.pool)
        .await
        .context("failed to set website status")?
        .rows_affected();
        Ok(affected > 0)
    }

    async fn add_history(&self, row: &WebsiteConfigHistory) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO website_config_history (id, website_id, version, config, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(row.id)
        .bind(row.website_id)
        .bind(row.version)
        .bind(&row.config)
        .bind(row.created_at)
        .execute(&self.pool)
        .await
        .context("failed to insert website config history")?;
        Ok(())
    }

    async fn list_history(&self, website_id: WebsiteId) -> Result<Vec<WebsiteConfigHistory>> {
        let rows = sqlx::query_as::<_, WebsiteConfigHistory>(
            r#"
            SELECT id, website_id, version, config, created_at
            FROM website_config_history
            WHERE website_id = $1
            ORDER BY version DESC
            "#,
        )
        .bind(website_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list website config history")?;
        Ok(rows)
    }

    async fn history_version(
        &self,
        website_id: WebsiteId,
        version: i32,
    ) -> Result<Option<WebsiteConfigHistory>> {
        let row = sqlx::query_as::<_, WebsiteConfigHistory>(
            r#"
            SELECT id, website_id, version, config, created_at
            FROM website_config_history
            WHERE website_id = $1 AND version = $2
            "#,
        )
        .bind(website_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load website config history version")?;
        Ok(row)
    }

    async fn latest_version(&self, website_id: WebsiteId) -> Result<i32> {
        let version: Option<i32> = sqlx::query_scalar(
            "SELECT MAX(version) FROM website_config_history WHERE website_id = $1",
        )
        .bind(website_id)
        .fetch_one(&self.pool)
        .await
        .context("failed to read latest config version")?;
        Ok(version.unwrap_or(0))
    }
}

/// In-memory website store for tests.
#[derive(Default)]
pub struct MemoryWebsiteStore {
    websites: RwLock<HashMap<WebsiteId, Website>>,
    history: RwLock<Vec<WebsiteConfigHistory>>,
}

impl MemoryWebsiteStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WebsiteStore for MemoryWebsiteStore {
    async fn insert(&self, website: &Website) -> Result<Website> {
        self.websites
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(website.id, website.clone());
        Ok(website.clone())
    }

    async fn get(&self, id: WebsiteId) -> Result<Option<Website>> {
        Ok(self
            .websites
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Website>> {
        Ok(self
            .websites
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .find(|w| w.name == name && !w.is_deleted())
            .cloned())
    }

    async fn update(&self, website: &Website) -> Result<Website> {
        let mut updated = website.clone();
        updated.updated_at = Utc::now();
        self.websites
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(website.id, updated.clone());
        Ok(updated)
    }

    async fn soft_delete(&self, id: WebsiteId, at: DateTime<Utc>) -> Result<bool> {
        let mut websites = self.websites.write().unwrap_or_else(|e| e.into_inner());
        match websites.get_mut(&id) {
            Some(w) if !w.is_deleted() => {
                w.deleted_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_status(&self, id: WebsiteId, status: WebsiteStatus) -> Result<bool> {
        let mut websites = self.websites.write().unwrap_or_else(|e| e.into_inner());
        match websites.get_mut(&id) {
            Some(w) if !w.is_deleted() => {
                w.status = status;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn add_history(&self, row: &WebsiteConfigHistory) -> Result<()> {
        self.history
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(row.clone());
        Ok(())
    }

    async fn list_history(&self, website_id: WebsiteId) -> Result<Vec<WebsiteConfigHistory>> {
        let mut rows: Vec<WebsiteConfigHistory> = self
            .history
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|h| h.website_id == website_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(rows)
    }

    async fn history_version(
        &self,
        website_id: WebsiteId,
        version: i32,
    ) -> Result<Option<WebsiteConfigHistory>> {
        Ok(self
            .history
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|h| h.website_id == website_id && h.version == version)
            .cloned())
    }

    async fn latest_version(&self, website_id: WebsiteId) -> Result<i32> {
        Ok(self
            .history
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|h| h.website_id == website_id)
            .map(|h| h.version)
            .max()
            .unwrap_or(0))
    }
}
