//! Service seams for the crawl runtime.
//!
//! Production wiring provides Postgres/NATS/filesystem implementations;
//! tests swap in the in-memory ones. Everything the pipeline touches goes
//! through one of these traits.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::retry::RetryRecord;
use crate::types::{ContentHashRecord, CrawledPage, LogEntry, PageId, WebsiteId};

/// TTL'd key-value + counter store.
///
/// Backs deduplication marks, rate-limit windows, cancellation flags, and
/// progress snapshots. Keys are opaque strings; values are JSON.
#[async_trait]
pub trait KvCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Increment a counter, creating it with the given TTL when absent.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64>;

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }
}

/// Opaque blob storage for raw HTML and attached documents.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes under a key; returns the storage path.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String>;
}

/// Outcome of a page insert under the `(website_id, url_hash)` uniqueness
/// invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageInsert {
    Inserted,
    /// Lost the insert race; the existing non-duplicate row is returned so
    /// the caller can degrade to the url-duplicate branch.
    DuplicateUrl { existing: PageId },
}

/// Persistence for crawled pages.
#[async_trait]
pub trait PageStore: Send + Sync {
    async fn insert_page(&self, page: &CrawledPage) -> Result<PageInsert>;

    async fn find_by_url_hash(
        &self,
        website_id: Option<WebsiteId>,
        url_hash: &str,
    ) -> Result<Option<CrawledPage>>;
}

/// Persistence for content-hash rows (exact + Simhash lookup).
#[async_trait]
pub trait ContentHashStore: Send + Sync {
    async fn find_exact(&self, content_hash: &str) -> Result<Option<ContentHashRecord>>;

    /// Insert, or bump `occurrence_count` and `last_seen_at` when the hash
    /// already exists. Returns the row after the write.
    async fn upsert(&self, record: &ContentHashRecord) -> Result<ContentHashRecord>;

    /// Rows whose fingerprint shares at least one 16-bit band with the
    /// given fingerprint. Callers re-check the exact Hamming distance.
    async fn find_simhash_candidates(&self, fingerprint: u64) -> Result<Vec<ContentHashRecord>>;
}

/// Per-job structured log sink (persisted row + live fan-out).
#[async_trait]
pub trait JobLogger: Send + Sync {
    async fn log(&self, entry: LogEntry) -> Result<()>;
}

/// Records retry attempts for the retry-history repository.
#[async_trait]
pub trait RetrySink: Send + Sync {
    async fn record_retry(&self, record: RetryRecord) -> Result<()>;
}

/// No-op logger for contexts that do not persist logs.
pub struct NullLogger;

#[async_trait]
impl JobLogger for NullLogger {
    async fn log(&self, _entry: LogEntry) -> Result<()> {
        Ok(())
    }
}

/// No-op retry sink.
pub struct NullRetrySink;

#[async_trait]
impl RetrySink for NullRetrySink {
    async fn record_retry(&self, _record: RetryRecord) -> Result<()> {
        Ok(())
    }
}
