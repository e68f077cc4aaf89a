//! Append-only per-job crawl logs, partitioned by month.
//!
//! The parent table `crawl_logs` is range-partitioned on `created_at`;
//! monthly partitions are created on demand with their own per-job
//! indexes, and retention drops whole partitions past the cutoff.

use std::collections::HashSet;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use seed_crawler::types::{JobId, LogEntry, LogLevel, WebsiteId};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CrawlLog {
    pub id: Uuid,
    pub job_id: JobId,
    pub website_id: Option<WebsiteId>,
    pub log_level: LogLevel,
    pub event: String,
    pub message: String,
    pub detail: serde_json::Value,
    pub trace_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<LogEntry> for CrawlLog {
    fn from(entry: LogEntry) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_id: entry.job_id,
            website_id: entry.website_id,
            log_level: entry.level,
            event: entry.event,
            message: entry.message,
            detail: entry.detail,
            trace_id: entry.trace_id,
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait CrawlLogStore: Send + Sync {
    async fn append(&self, log: &CrawlLog) -> Result<()>;

    async fn replay(
        &self,
        job_id: JobId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<CrawlLog>>;
}

/// Partition name for a month, e.g. `crawl_logs_y2026m08`.
fn partition_name(at: DateTime<Utc>) -> String {
    format!("crawl_logs_y{:04}m{:02}", at.year(), at.month())
}

fn month_start(year: i32, month: u32) -> String {
    format!("{year:04}-{month:02}-01")
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

pub struct PostgresCrawlLogStore {
    pool: PgPool,
    ensured: Mutex<HashSet<String>>,
}

impl PostgresCrawlLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            ensured: Mutex::new(HashSet::new()),
        }
    }

    /// Create the month's partition and its indexes if missing.
    async fn ensure_partition(&self, at: DateTime<Utc>) -> Result<()> {
        let name = partition_name(at);
        {
            let ensured = self.ensured.lock().unwrap_or_else(|e| e.into_inner());
            if ensured.contains(&name) {
                return Ok(());
            }
        }

        let (year, month) = (at.year(), at.month());
        let (next_year, next_month) = next_month(year, month);
        let create = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {name}
            PARTITION OF crawl_logs
            FOR VALUES FROM ('{from}') TO ('{to}')
            "#,
            from = month_start(year, month),
            to = month_start(next_year, next_month),
        );
        sqlx::query(&create)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to create partition {name}"))?;

        for (suffix, columns) in [
            ("job", "(job_id)"),
            ("job_created", "(job_id, created_at)"),
            ("level", "(log_level)"),
            ("website", "(website_id)"),
            ("trace", "(trace_id)"),
        ] {
            let index = format!(
                "CREATE INDEX IF NOT EXISTS {name}_{suffix}_idx ON {name} {columns}"
            );
            sqlx::query(&index)
                .execute(&self.pool)
                .await
                .with_context(|| format!("failed to index partition {name}"))?;
        }

        self.ensured
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name);
        Ok(())
    }

    /// Drop partitions wholly older than `retention_days`.
    pub async fn drop_expired_partitions(&self, retention_days: i64) -> Result<Vec<String>> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days);

        let partitions: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT c.relname
            FROM pg_inherits i
            JOIN pg_class c ON c.oid = i.inhrelid
            JOIN pg_class p ON p.oid = i.inhparent
            WHERE p.relname = 'crawl_logs'
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list crawl_logs partitions")?;

        let mut dropped = Vec::new();
        for name in partitions {
            let Some((year, month)) = parse_partition_name(&name) else {
                continue;
            };
            // A partition is droppable once the following month is past
            // the cutoff.
            let (next_year, next_month) = next_month(year, month);
            let end = chrono::NaiveDate::from_ymd_opt(next_year, next_month, 1)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc());
            let Some(end) = end else { continue };
            if end <= cutoff {
                sqlx::query(&format!("DROP TABLE IF EXISTS {name}"))
                    .execute(&self.pool)
                    .await
                    .with_context(|| format!("failed to drop partition {name}"))?;
                self.ensured
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&name);
                dropped.push(name);
            }
        }
        Ok(dropped)
    }
}

fn parse_partition_name(name: &str) -> Option<(i32, u32)> {
    let rest = name.strip_prefix("crawl_logs_y")?;
    let (year, month) = rest.split_once('m')?;
    Some((year.parse().ok()?, month.parse().ok()?))
}

#[async_trait]
impl CrawlLogStore for PostgresCrawlLogStore {
    async fn append(&self, log: &CrawlLog) -> Result<()> {
        self.ensure_partition(log.created_at).await?;
        sqlx::query(
            r#"
            INSERT INTO crawl_logs (
                id, job_id, website_id, log_level, event, message, detail, trace_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(log.id)
        .bind(log.job_id)
        .bind(log.website_id)
        .bind(log.log_level)
        .bind(&log.event)
        .bind(&log.message)
        .bind(&log.detail)
        .bind(&log.trace_id)
        .bind(log.created_at)
        .execute(&self.pool)
        .await
        .context("failed to append crawl log")?;
        Ok(())
    }

    async fn replay(
        &self,
        job_id: JobId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<CrawlLog>> {
        let logs = sqlx::query_as::<_, CrawlLog>(
            r#"
            SELECT id, job_id, website_id, log_level, event, message, detail, trace_id, created_at
            FROM crawl_logs
            WHERE job_id = $1
              AND ($2::timestamptz IS NULL OR created_at > $2)
            ORDER BY created_at ASC
            "#,
        )
        .bind(job_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("failed to replay crawl logs")?;
        Ok(logs)
    }
}

/// In-memory log store for tests.
#[derive(Default)]
pub struct MemoryCrawlLogStore {
    logs: Mutex<Vec<CrawlLog>>,
}

impl MemoryCrawlLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<CrawlLog> {
        self.logs.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl CrawlLogStore for MemoryCrawlLogStore {
    async fn append(&self, log: &CrawlLog) -> Result<()> {
        self.logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(log.clone());
        Ok(())
    }

    async fn replay(
        &self,
        job_id: JobId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<CrawlLog>> {
        Ok(self
            .logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|l| l.job_id == job_id)
            .filter(|l| since.map(|s| l.created_at > s).unwrap_or(true))
            .cloned()
            .collect())
    }
}
