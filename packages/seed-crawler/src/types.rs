use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a crawl job
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, PartialOrd, Ord,
)]
#[sqlx(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Unique identifier for a website template
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, PartialOrd, Ord,
)]
#[sqlx(transparent)]
pub struct WebsiteId(pub Uuid);

impl WebsiteId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for WebsiteId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WebsiteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Unique identifier for a crawled page
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, PartialOrd, Ord,
)]
#[sqlx(transparent)]
pub struct PageId(pub Uuid);

impl PageId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for PageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Unique identifier for a scheduled crawl entry
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, PartialOrd, Ord,
)]
#[sqlx(transparent)]
pub struct ScheduleId(pub Uuid);

impl ScheduleId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ScheduleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A page stored by the crawl pipeline.
///
/// `(website_id, url_hash)` is unique per template; duplicate inserts lose
/// the race and degrade to a url-duplicate row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CrawledPage {
    pub id: PageId,
    pub website_id: Option<WebsiteId>,
    pub job_id: JobId,
    pub url: String,
    pub url_hash: String,
    pub content_hash: Option<String>,
    pub title: Option<String>,
    pub extracted_text: Option<String>,
    pub metadata: serde_json::Value,
    pub html_path: Option<String>,
    pub is_duplicate: bool,
    pub duplicate_of: Option<PageId>,
    pub similarity_score: Option<i16>,
    pub crawled_at: DateTime<Utc>,
}

impl CrawledPage {
    pub fn new(job_id: JobId, website_id: Option<WebsiteId>, url: String, url_hash: String) -> Self {
        Self {
            id: PageId::new(),
            website_id,
            job_id,
            url,
            url_hash,
            content_hash: None,
            title: None,
            extracted_text: None,
            metadata: serde_json::Value::Null,
            html_path: None,
            is_duplicate: false,
            duplicate_of: None,
            similarity_score: None,
            crawled_at: Utc::now(),
        }
    }
}

/// One row per distinct content hash seen across all crawls.
///
/// `simhash` is the 64-bit fingerprint stored bit-for-bit as a signed
/// integer; `first_seen_page_id` is a weak reference nullable on page
/// deletion.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ContentHashRecord {
    pub content_hash: String,
    pub first_seen_page_id: Option<PageId>,
    pub occurrence_count: i64,
    pub simhash: Option<i64>,
    pub last_seen_at: DateTime<Utc>,
}

impl ContentHashRecord {
    pub fn new(content_hash: String, page_id: PageId, simhash: u64) -> Self {
        Self {
            content_hash,
            first_seen_page_id: Some(page_id),
            occurrence_count: 1,
            simhash: Some(simhash as i64),
            last_seen_at: Utc::now(),
        }
    }

    pub fn fingerprint(&self) -> Option<u64> {
        self.simhash.map(|s| s as u64)
    }
}

/// Terminal outcome of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlOutcome {
    Success,
    SuccessNoUrls,
    SeedUrl404,
    SeedUrlError,
    InvalidConfig,
    PaginationStopped,
    CircularPagination,
    EmptyPages,
    PartialSuccess,
    Cancelled,
    Failed,
}

impl CrawlOutcome {
    /// Outcomes that end the job in `completed` rather than `failed`.
    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            CrawlOutcome::Success
                | CrawlOutcome::SuccessNoUrls
                | CrawlOutcome::PaginationStopped
                | CrawlOutcome::CircularPagination
                | CrawlOutcome::EmptyPages
                | CrawlOutcome::PartialSuccess
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlOutcome::Success => "success",
            CrawlOutcome::SuccessNoUrls => "success_no_urls",
            CrawlOutcome::SeedUrl404 => "seed_url_404",
            CrawlOutcome::SeedUrlError => "seed_url_error",
            CrawlOutcome::InvalidConfig => "invalid_config",
            CrawlOutcome::PaginationStopped => "pagination_stopped",
            CrawlOutcome::CircularPagination => "circular_pagination",
            CrawlOutcome::EmptyPages => "empty_pages",
            CrawlOutcome::PartialSuccess => "partial_success",
            CrawlOutcome::Cancelled => "cancelled",
            CrawlOutcome::Failed => "failed",
        }
    }
}

/// Per-step counters mirrored into the `progress:job:{id}` cache entry and
/// onto the job row at terminal write.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Progress {
    pub current_step: String,
    pub pages_crawled: u32,
    pub urls_discovered: u32,
    pub urls_processed: u32,
    pub urls_failed: u32,
    pub duplicates: u32,
}

/// Result of `SeedUrlCrawler::crawl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlResult {
    pub outcome: CrawlOutcome,
    pub progress: Progress,
    pub warnings: Vec<String>,
    pub error: Option<String>,
    /// Classification of the error that ended the run, when one did.
    pub error_category: Option<crate::retry::ErrorCategory>,
}

impl CrawlResult {
    pub fn new(outcome: CrawlOutcome, progress: Progress) -> Self {
        Self {
            outcome,
            progress,
            warnings: Vec::new(),
            error: None,
            error_category: None,
        }
    }
}

/// Everything the pipeline needs to run one job.
///
/// The worker resolves the template row (or takes the inline document) and
/// hands the raw config here; parsing and validation happen at pipeline
/// entry.
#[derive(Debug, Clone)]
pub struct CrawlRequest {
    pub job_id: JobId,
    pub website_id: Option<WebsiteId>,
    pub seed_url: String,
    pub config: serde_json::Value,
    pub overrides: Option<serde_json::Value>,
    pub variables: serde_json::Value,
    pub metadata: serde_json::Value,
}

/// Verdict from the two-phase deduplicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupDecision {
    Fresh,
    UrlDuplicate {
        original: Option<PageId>,
    },
    ContentDuplicate {
        original: Option<PageId>,
        similarity_score: i16,
    },
}

/// Log severity for per-job crawl logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "log_level", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One structured log line emitted by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub job_id: JobId,
    pub website_id: Option<WebsiteId>,
    pub level: LogLevel,
    pub event: String,
    pub message: String,
    pub detail: serde_json::Value,
    pub trace_id: Option<String>,
}

impl LogEntry {
    pub fn info(job_id: JobId, event: &str, message: impl Into<String>) -> Self {
        Self {
            job_id,
            website_id: None,
            level: LogLevel::Info,
            event: event.to_string(),
            message: message.into(),
            detail: serde_json::Value::Null,
            trace_id: None,
        }
    }

    pub fn warn(job_id: JobId, event: &str, message: impl Into<String>) -> Self {
        Self {
            level: LogLevel::Warn,
            ..Self::info(job_id, event, message)
        }
    }

    pub fn error(job_id: JobId, event: &str, message: impl Into<String>) -> Self {
        Self {
            level: LogLevel::Error,
            ..Self::info(job_id, event, message)
        }
    }

    pub fn with_website(mut self, website_id: Option<WebsiteId>) -> Self {
        self.website_id = website_id;
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_are_time_ordered() {
        let a = JobId::new();
        let b = JobId::new();
        assert!(a.0 != b.0);
        assert!(a <= b);
    }

    #[test]
    fn completed_outcomes_include_partial_and_pagination_stops() {
        assert!(CrawlOutcome::Success.is_completed());
        assert!(CrawlOutcome::CircularPagination.is_completed());
        assert!(CrawlOutcome::PartialSuccess.is_completed());
        assert!(!CrawlOutcome::SeedUrl404.is_completed());
        assert!(!CrawlOutcome::Cancelled.is_completed());
        assert!(!CrawlOutcome::Failed.is_completed());
    }

    #[test]
    fn simhash_round_trips_through_signed_storage() {
        let record = ContentHashRecord::new("abc".to_string(), PageId::new(), u64::MAX);
        assert_eq!(record.fingerprint(), Some(u64::MAX));
    }
}
