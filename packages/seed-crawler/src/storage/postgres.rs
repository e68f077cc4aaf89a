//! PostgreSQL-backed crawl store.
//!
//! `crawled_pages` carries a partial unique index on
//! `(website_id, url_hash) WHERE NOT is_duplicate`; losers of the insert
//! race are reported so callers can degrade to the url-duplicate branch.
//! `content_hashes` stores the Simhash fingerprint plus its four 16-bit
//! bands so candidate lookup stays indexed.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;

use crate::simhash;
use crate::traits::{ContentHashStore, PageInsert, PageStore};
use crate::types::{ContentHashRecord, CrawledPage, PageId, WebsiteId};

pub struct PostgresCrawlStore {
    pool: PgPool,
}

impl PostgresCrawlStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PageStore for PostgresCrawlStore {
    async fn insert_page(&self, page: &CrawledPage) -> Result<PageInsert> {
        let result = sqlx::query(
            r#"
            INSERT INTO crawled_pages (
                id, website_id, job_id, url, url_hash, content_hash, title,
                extracted_text, metadata, html_path, is_duplicate, duplicate_of,
                similarity_score, crawled_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (website_id, url_hash) WHERE NOT is_duplicate DO NOTHING
            "#,
        )
        .bind(page.id)
        .bind(page.website_id)
        .bind(page.job_id)
        .bind(&page.url)
        .bind(&page.url_hash)
        .bind(&page.content_hash)
        .bind(&page.title)
        .bind(&page.extracted_text)
        .bind(&page.metadata)
        .bind(&page.html_path)
        .bind(page.is_duplicate)
        .bind(page.duplicate_of)
        .bind(page.similarity_score)
        .bind(page.crawled_at)
        .execute(&self.pool)
        .await
        .context("failed to insert crawled page")?;

        if result.rows_affected() > 0 {
            return Ok(PageInsert::Inserted);
        }

        // Lost the race: surface the surviving row.
        let existing = self
            .find_by_url_hash(page.website_id, &page.url_hash)
            .await?
            .map(|p| p.id)
            .unwrap_or(page.id);
        Ok(PageInsert::DuplicateUrl { existing })
    }

    async fn find_by_url_hash(
        &self,
        website_id: Option<WebsiteId>,
        url_hash: &str,
    ) -> Result<Option<CrawledPage>> {
        let page = sqlx::query_as::<_, CrawledPage>(
            r#"
            SELECT id, website_id, job_id, url, url_hash, content_hash, title,
                   extracted_text, metadata, html_path, is_duplicate, duplicate_of,
                   similarity_score, crawled_at
            FROM crawled_pages
            WHERE website_id IS NOT DISTINCT FROM $1
              AND url_hash = $2
              AND NOT is_duplicate
            LIMIT 1
            "#,
        )
        .bind(website_id)
        .bind(url_hash)
        .fetch_optional(&self.pool)
        .await
        .context("failed to look up page by url hash")?;

        Ok(page)
    }
}

#[async_trait]
impl ContentHashStore for PostgresCrawlStore {
    async fn find_exact(&self, content_hash: &str) -> Result<Option<ContentHashRecord>> {
        let record = sqlx::query_as::<_, ContentHashRecord>(
            r#"
            SELECT content_hash, first_seen_page_id, occurrence_count, simhash, last_seen_at
            FROM content_hashes
            WHERE content_hash = $1
            "#,
        )
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await
        .context("failed to look up content hash")?;

        Ok(record)
    }

    async fn upsert(&self, record: &ContentHashRecord) -> Result<ContentHashRecord> {
        let bands = record
            .fingerprint()
            .map(simhash::bands)
            .unwrap_or([0, 0, 0, 0]);

        let updated = sqlx::query_as::<_, ContentHashRecord>(
            r#"
            INSERT INTO content_hashes (
                content_hash, first_seen_page_id, occurrence_count, simhash,
                band1, band2, band3, band4, last_seen_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            ON CONFLICT (content_hash) DO UPDATE SET
                occurrence_count = content_hashes.occurrence_count + 1,
                last_seen_at = NOW()
            RETURNING content_hash, first_seen_page_id, occurrence_count, simhash, last_seen_at
            "#,
        )
        .bind(&record.content_hash)
        .bind(record.first_seen_page_id)
        .bind(record.occurrence_count)
        .bind(record.simhash)
        .bind(bands[0])
        .bind(bands[1])
        .bind(bands[2])
        .bind(bands[3])
        .fetch_one(&self.pool)
        .await
        .context("failed to upsert content hash")?;

        Ok(updated)
    }

    async fn find_simhash_candidates(&self, fingerprint: u64) -> Result<Vec<ContentHashRecord>> {
        let bands = simhash::bands(fingerprint);
        let candidates = sqlx::query_as::<_, ContentHashRecord>(
            r#"
            SELECT content_hash, first_seen_page_id, occurrence_count, simhash, last_seen_at
            FROM content_hashes
            WHERE simhash IS NOT NULL
              AND (band1 = $1 OR band2 = $2 OR band3 = $3 OR band4 = $4)
            "#,
        )
        .bind(bands[0])
        .bind(bands[1])
        .bind(bands[2])
        .bind(bands[3])
        .fetch_all(&self.pool)
        .await
        .context("failed to query simhash candidates")?;

        Ok(candidates)
    }
}

/// Clear a page's content-hash back reference when the page is deleted.
/// `first_seen_page_id` is a weak reference; the hash row survives.
pub async fn detach_first_seen_page(pool: &PgPool, page_id: PageId) -> Result<u64> {
    let affected = sqlx::query(
        "UPDATE content_hashes SET first_seen_page_id = NULL WHERE first_seen_page_id = $1",
    )
    .bind(page_id)
    .execute(pool)
    .await
    .context("failed to detach first-seen page")?
    .rows_affected();

    Ok(affected)
}
