//! The per-job crawl pipeline.
//!
//! `SeedUrlCrawler::crawl` runs config resolution → variable substitution
//! → seed fetch → pagination detection → pagination walk → per-URL scrape,
//! re-reading the cancellation signal at every suspension point. The
//! worker owns the job row; this pipeline owns pages, logs, retry records,
//! and the progress snapshot.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cleanup::{CleanupCoordinator, DEFAULT_CLEANUP_DEADLINE};
use crate::config::{CrawlConfig, FetchMethod, FieldSelector, ListSelectors};
use crate::dedup::{self, Deduplicator};
use crate::extract::{self, DiscoveredUrl};
use crate::fetch::Fetcher;
use crate::pagination::{self, PaginationWalk, WalkStop};
use crate::retry::{ErrorCategory, RetryClassifier, RetryRecord};
use crate::traits::{BlobStore, ContentHashStore, JobLogger, KvCache, PageStore, RetrySink};
use crate::types::{
    CrawlOutcome, CrawlRequest, CrawlResult, CrawledPage, DedupDecision, JobId, LogEntry, Progress,
    WebsiteId,
};
use crate::urlnorm;
use crate::variables::{VariableContext, VariableResolver};

#[derive(Debug, Clone)]
pub struct CrawlerSettings {
    pub cleanup_deadline: Duration,
    /// Cancellation is re-checked at least once per this many scraped URLs.
    pub scrape_batch_size: usize,
    pub progress_ttl: Duration,
}

impl Default for CrawlerSettings {
    fn default() -> Self {
        Self {
            cleanup_deadline: DEFAULT_CLEANUP_DEADLINE,
            scrape_batch_size: 100,
            progress_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

pub struct SeedUrlCrawler {
    fetcher: Arc<dyn Fetcher>,
    pages: Arc<dyn PageStore>,
    hashes: Arc<dyn ContentHashStore>,
    cache: Arc<dyn KvCache>,
    blobs: Arc<dyn BlobStore>,
    logger: Arc<dyn JobLogger>,
    retries: Arc<dyn RetrySink>,
    settings: CrawlerSettings,
}

impl SeedUrlCrawler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        pages: Arc<dyn PageStore>,
        hashes: Arc<dyn ContentHashStore>,
        cache: Arc<dyn KvCache>,
        blobs: Arc<dyn BlobStore>,
        logger: Arc<dyn JobLogger>,
        retries: Arc<dyn RetrySink>,
    ) -> Self {
        Self {
            fetcher,
            pages,
            hashes,
            cache,
            blobs,
            logger,
            retries,
            settings: CrawlerSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: CrawlerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Run the pipeline for one job.
    pub async fn crawl(&self, request: CrawlRequest, cancel: CancellationToken) -> CrawlResult {
        let job_id = request.job_id;
        let website_id = request.website_id;
        let cleanup = CleanupCoordinator::new();
        let mut progress = Progress::default();
        let mut warnings: Vec<String> = Vec::new();

        // Step 1: config resolution.
        progress.current_step = "config_resolution".to_string();
        self.push_progress(job_id, &progress).await;
        let config = match CrawlConfig::resolve(&request.config, request.overrides.as_ref()) {
            Ok(config) => config,
            Err(e) => {
                self.log(
                    LogEntry::error(job_id, "config_invalid", e.to_string())
                        .with_website(website_id),
                )
                .await;
                let mut result = CrawlResult::new(CrawlOutcome::InvalidConfig, progress);
                result.error = Some(e.to_string());
                result.error_category = Some(ErrorCategory::ValidationError);
                return result;
            }
        };
        let classifier = RetryClassifier::new().with_overrides(config.retry_overrides());
        let deduplicator = Deduplicator::new(
            Arc::clone(&self.cache),
            Arc::clone(&self.hashes),
            config.dedup.clone(),
        );

        // Step 2: variable context assembly.
        progress.current_step = "variable_context".to_string();
        let mut ctx = VariableContext::new(
            request.variables.clone(),
            config.variables.clone(),
            request.metadata.clone(),
        )
        .with_process_env();
        let resolver = VariableResolver::new(config.resolve_mode());
        let seed_url = match resolver.resolve(&ctx, &request.seed_url) {
            Ok((resolved, mut notes)) => {
                warnings.append(&mut notes);
                resolved
            }
            Err(e) => {
                self.log(
                    LogEntry::error(job_id, "variable_error", e.to_string())
                        .with_website(website_id),
                )
                .await;
                let mut result = CrawlResult::new(CrawlOutcome::InvalidConfig, progress);
                result.error = Some(e.to_string());
                result.error_category = Some(ErrorCategory::ValidationError);
                return result;
            }
        };

        if self.is_cancelled(job_id, &cancel).await {
            return self
                .cancelled_result(job_id, progress, warnings, &cleanup)
                .await;
        }

        // Step 3: seed fetch.
        progress.current_step = "seed_fetch".to_string();
        self.push_progress(job_id, &progress).await;
        let (list_method, list_selectors) = match config.list_step() {
            Some((method, selectors)) => (*method, selectors.clone()),
            None => (FetchMethod::Http, ListSelectors::default()),
        };
        let seed_page = match self.fetcher.fetch(&seed_url, list_method).await {
            Ok(page) => page,
            Err(e) => {
                let category = classifier.classify(&e);
                self.log(
                    LogEntry::error(job_id, "seed_url_error", e.to_string())
                        .with_website(website_id),
                )
                .await;
                let mut result = CrawlResult::new(CrawlOutcome::SeedUrlError, progress);
                result.error = Some(format!("seed_url_error: {e}"));
                result.error_category = Some(category);
                result.warnings = warnings;
                return result;
            }
        };
        if seed_page.status == 404 {
            self.log(
                LogEntry::error(
                    job_id,
                    "seed_url_404",
                    format!("seed url returned 404: {seed_url}"),
                )
                .with_website(website_id),
            )
            .await;
            let mut result = CrawlResult::new(CrawlOutcome::SeedUrl404, progress);
            result.error = Some(format!("seed_url_404: {seed_url}"));
            result.error_category = Some(ErrorCategory::NotFound);
            result.warnings = warnings;
            return result;
        }
        if !seed_page.ok() {
            let err = seed_page.error_for_status().unwrap_err();
            let category = classifier.classify(&err);
            self.log(
                LogEntry::error(job_id, "seed_url_error", err.to_string())
                    .with_website(website_id),
            )
            .await;
            let mut result = CrawlResult::new(CrawlOutcome::SeedUrlError, progress);
            result.error = Some(format!("seed_url_error: {err}"));
            result.error_category = Some(category);
            result.warnings = warnings;
            return result;
        }
        self.log(
            LogEntry::info(job_id, "seed_url_fetched", seed_page.final_url.clone())
                .with_website(website_id),
        )
        .await;

        // Step 4: pagination detection.
        progress.current_step = "pagination_detection".to_string();
        let detection = match pagination::detect(
            config.pagination.as_ref(),
            &seed_page.final_url,
            &seed_page.body,
            &list_selectors,
        ) {
            Ok(detection) => detection,
            Err(e) => {
                let mut result = CrawlResult::new(CrawlOutcome::InvalidConfig, progress);
                result.error = Some(e.to_string());
                result.error_category = Some(ErrorCategory::ValidationError);
                result.warnings = warnings;
                return result;
            }
        };
        for note in &detection.warnings {
            self.log(LogEntry::warn(job_id, "pagination_warning", note.clone())).await;
        }
        warnings.extend(detection.warnings.clone());
        let mut walk = PaginationWalk::new(
            detection.strategy,
            config.max_pages(),
            config.max_empty_responses(),
        );

        // Step 5: pagination walk.
        progress.current_step = "pagination_walk".to_string();
        self.push_progress(job_id, &progress).await;
        let mut discovered: Vec<DiscoveredUrl> = Vec::new();
        let mut seen_in_job: HashSet<String> = HashSet::new();
        let mut walk_outcome: Option<CrawlOutcome> = None;

        let mut current = seed_page;
        let mut page_number: u64 = 1;
        loop {
            let page_text = extract::visible_text(&current.body, &config.boilerplate_selectors);
            let page_hash = dedup::content_hash(&dedup::normalize_content(&page_text));
            if walk.check_hash(&page_hash) {
                self.log(
                    LogEntry::warn(
                        job_id,
                        "circular_pagination_detected",
                        format!("page {page_number} repeats earlier content, stopping"),
                    )
                    .with_website(website_id),
                )
                .await;
                walk_outcome = Some(CrawlOutcome::CircularPagination);
                break;
            }

            let urls = match extract::extract_detail_urls(
                &current.body,
                &current.final_url,
                &list_selectors,
            ) {
                Ok(urls) => urls,
                Err(e) => {
                    let mut result = CrawlResult::new(CrawlOutcome::InvalidConfig, progress);
                    result.error = Some(e.to_string());
                    result.error_category = Some(ErrorCategory::ValidationError);
                    result.warnings = warnings;
                    return result;
                }
            };
            let mut fresh = 0usize;
            for item in urls {
                let normalized = match urlnorm::normalize_url(&item.url, &config.tracking_params) {
                    Ok(n) => n,
                    Err(_) => continue,
                };
                if seen_in_job.insert(normalized.clone()) {
                    fresh += 1;
                    discovered.push(DiscoveredUrl {
                        url: normalized,
                        metadata: item.metadata,
                    });
                }
            }
            progress.urls_discovered = discovered.len() as u32;
            self.log(
                LogEntry::info(
                    job_id,
                    "pagination_page_processed",
                    format!("page {page_number}: {fresh} new urls"),
                )
                .with_website(website_id)
                .with_detail(json!({"page": page_number, "new_urls": fresh})),
            )
            .await;

            match walk.record_urls(fresh) {
                Some(WalkStop::EmptyPages) => {
                    walk_outcome = Some(CrawlOutcome::EmptyPages);
                    break;
                }
                Some(WalkStop::MaxPages) => break,
                Some(WalkStop::Circular) => {
                    walk_outcome = Some(CrawlOutcome::CircularPagination);
                    break;
                }
                None => {}
            }

            let next = match walk.next_url(
                page_number + 1,
                discovered.len() as u64,
                &current.final_url,
                &current.body,
                &resolver,
                &mut ctx,
            ) {
                Ok(next) => next,
                Err(e) => {
                    warnings.push(format!("pagination url generation failed: {e}"));
                    walk_outcome = Some(CrawlOutcome::PaginationStopped);
                    break;
                }
            };
            let Some(next_url) = next else {
                break;
            };

            if self.is_cancelled(job_id, &cancel).await {
                return self
                    .cancelled_result(job_id, progress, warnings, &cleanup)
                    .await;
            }

            current = match self.fetcher.fetch(&next_url, list_method).await {
                Ok(page) if page.ok() => page,
                Ok(page) => {
                    warnings.push(format!(
                        "pagination stopped: {next_url} returned {}",
                        page.status
                    ));
                    walk_outcome = Some(CrawlOutcome::PaginationStopped);
                    break;
                }
                Err(e) => {
                    warnings.push(format!("pagination stopped: {e}"));
                    walk_outcome = Some(CrawlOutcome::PaginationStopped);
                    break;
                }
            };
            page_number += 1;
        }

        // Step 6: per-URL scrape.
        progress.current_step = "scrape_detail".to_string();
        self.push_progress(job_id, &progress).await;
        let (detail_method, detail_fields) = match config.detail_step() {
            Some((method, fields)) => (*method, fields.clone()),
            None => (FetchMethod::Http, Default::default()),
        };
        let interval = Duration::from_secs_f64(1.0 / config.rate_limit.requests_per_second);
        let mut last_fetch: Option<Instant> = None;

        for (index, item) in discovered.iter().enumerate() {
            let flag_check_due = index % self.settings.scrape_batch_size == 0;
            let cancelled = if flag_check_due {
                self.is_cancelled(job_id, &cancel).await
            } else {
                cancel.is_cancelled()
            };
            if cancelled {
                return self
                    .cancelled_result(job_id, progress, warnings, &cleanup)
                    .await;
            }

            let outcome = self
                .scrape_one(
                    job_id,
                    website_id,
                    item,
                    detail_method,
                    &detail_fields,
                    &config,
                    &classifier,
                    &deduplicator,
                    &mut last_fetch,
                    interval,
                    &cancel,
                )
                .await;
            match outcome {
                ScrapeOutcome::Fresh => {
                    progress.urls_processed += 1;
                    progress.pages_crawled += 1;
                }
                ScrapeOutcome::Duplicate => {
                    progress.urls_processed += 1;
                    progress.duplicates += 1;
                }
                ScrapeOutcome::Failed(reason) => {
                    progress.urls_processed += 1;
                    progress.urls_failed += 1;
                    warnings.push(reason);
                }
                ScrapeOutcome::Cancelled => {
                    return self
                        .cancelled_result(job_id, progress, warnings, &cleanup)
                        .await;
                }
            }
            self.push_progress(job_id, &progress).await;
        }

        self.log(
            LogEntry::info(
                job_id,
                "scrape_completed",
                format!(
                    "{} processed, {} fresh, {} duplicates, {} failed",
                    progress.urls_processed,
                    progress.pages_crawled,
                    progress.duplicates,
                    progress.urls_failed
                ),
            )
            .with_website(website_id),
        )
        .await;

        // Step 7: outcome. The worker writes the job row and acks.
        let successes = progress.urls_processed - progress.urls_failed;
        let outcome = if discovered.is_empty() {
            walk_outcome.unwrap_or(CrawlOutcome::SuccessNoUrls)
        } else if successes == 0 && progress.urls_failed > 0 {
            CrawlOutcome::Failed
        } else if progress.urls_failed > 0 {
            CrawlOutcome::PartialSuccess
        } else {
            walk_outcome.unwrap_or(CrawlOutcome::Success)
        };

        let mut result = CrawlResult::new(outcome, progress.clone());
        result.warnings = warnings;
        if outcome == CrawlOutcome::Failed {
            result.error = Some("all detail fetches failed".to_string());
            result.error_category = Some(ErrorCategory::Unknown);
        }
        self.push_progress(job_id, &progress).await;
        info!(
            job_id = %job_id,
            outcome = outcome.as_str(),
            pages = progress.pages_crawled,
            duplicates = progress.duplicates,
            failed = progress.urls_failed,
            "crawl finished"
        );
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn scrape_one(
        &self,
        job_id: JobId,
        website_id: Option<WebsiteId>,
        item: &DiscoveredUrl,
        method: FetchMethod,
        fields: &std::collections::HashMap<String, FieldSelector>,
        config: &CrawlConfig,
        classifier: &RetryClassifier,
        deduplicator: &Deduplicator,
        last_fetch: &mut Option<Instant>,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> ScrapeOutcome {
        let url_hash = urlnorm::url_hash(&item.url);

        // Phase 1: URL dedup, no fetch on a hit.
        match deduplicator.check_url(website_id, &url_hash).await {
            Ok(Some(DedupDecision::UrlDuplicate { original })) => {
                let mut page = CrawledPage::new(job_id, website_id, item.url.clone(), url_hash);
                page.is_duplicate = true;
                page.duplicate_of = original;
                page.metadata = item.metadata.clone();
                if let Err(e) = self.pages.insert_page(&page).await {
                    warn!(job_id = %job_id, error = %e, "failed to record url duplicate");
                }
                self.log(
                    LogEntry::info(job_id, "url_duplicate", item.url.clone())
                        .with_website(website_id),
                )
                .await;
                return ScrapeOutcome::Duplicate;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "url dedup check failed, continuing");
            }
        }

        // Rate limit, with the shared window counter for observability.
        if let Some(last) = last_fetch {
            let elapsed = last.elapsed();
            if elapsed < interval && sleep_cancellable(interval - elapsed, cancel).await {
                return ScrapeOutcome::Cancelled;
            }
        }
        *last_fetch = Some(Instant::now());
        let window = chrono::Utc::now().timestamp();
        let ratelimit_key = match website_id {
            Some(id) => format!("ratelimit:{id}:{window}"),
            None => format!("ratelimit:adhoc:{window}"),
        };
        let _ = self.cache.incr(&ratelimit_key, Duration::from_secs(1)).await;

        // Fetch with per-URL retries.
        let mut attempt: u32 = 0;
        let fetched = loop {
            let error = match self.fetcher.fetch(&item.url, method).await {
                Ok(page) if page.ok() => break page,
                Ok(page) => page.error_for_status().unwrap_err(),
                Err(e) => e,
            };
            let category = classifier.classify(&error);
            if classifier.should_retry(category, attempt) {
                let policy = classifier.policy(category);
                let delay = policy.delay(attempt, error.retry_after());
                let record = RetryRecord {
                    job_id,
                    url: Some(item.url.clone()),
                    category,
                    attempt: attempt + 1,
                    delay_seconds: delay.as_secs_f64(),
                    error: error.to_string(),
                };
                if let Err(e) = self.retries.record_retry(record).await {
                    warn!(job_id = %job_id, error = %e, "failed to record retry");
                }
                self.log(
                    LogEntry::warn(
                        job_id,
                        "scrape_retry",
                        format!(
                            "{} attempt {} in {:.1}s: {}",
                            item.url,
                            attempt + 1,
                            delay.as_secs_f64(),
                            error
                        ),
                    )
                    .with_website(website_id),
                )
                .await;
                if sleep_cancellable(delay, cancel).await {
                    return ScrapeOutcome::Cancelled;
                }
                attempt += 1;
                continue;
            }
            self.log(
                LogEntry::warn(job_id, "scrape_failed", format!("{}: {error}", item.url))
                    .with_website(website_id),
            )
            .await;
            return ScrapeOutcome::Failed(format!("{}: {error}", item.url));
        };

        // Phase 2: content dedup on the normalized page text.
        let text = extract::visible_text(&fetched.body, &config.boilerplate_selectors);
        let normalized = dedup::normalize_content(&text);
        let check = match deduplicator.check_content(&normalized).await {
            Ok(check) => check,
            Err(e) => {
                return ScrapeOutcome::Failed(format!("{}: dedup store failed: {e}", item.url));
            }
        };

        let mut page = CrawledPage::new(job_id, website_id, item.url.clone(), url_hash.clone());
        page.metadata = item.metadata.clone();
        page.title = extract::page_title(&fetched.body);

        match check.decision {
            DedupDecision::ContentDuplicate {
                original,
                similarity_score,
            } => {
                page.is_duplicate = true;
                page.duplicate_of = original;
                page.content_hash = Some(check.content_hash.clone());
                page.similarity_score = Some(similarity_score);
                if let Err(e) = self.pages.insert_page(&page).await {
                    warn!(job_id = %job_id, error = %e, "failed to record content duplicate");
                }
                if let Err(e) = deduplicator
                    .register_content(check.content_hash.clone(), check.fingerprint, page.id)
                    .await
                {
                    warn!(job_id = %job_id, error = %e, "failed to bump content hash");
                }
                if let Err(e) = deduplicator
                    .mark_url(website_id, &url_hash, job_id, &check.content_hash, page.id)
                    .await
                {
                    warn!(job_id = %job_id, error = %e, "failed to mark url as crawled");
                }
                self.log(
                    LogEntry::info(
                        job_id,
                        "content_duplicate",
                        format!("{} similarity {similarity_score}", item.url),
                    )
                    .with_website(website_id),
                )
                .await;
                ScrapeOutcome::Duplicate
            }
            DedupDecision::UrlDuplicate { .. } | DedupDecision::Fresh => {
                let extracted = if fields.is_empty() {
                    serde_json::Value::Null
                } else {
                    match extract::extract_fields(&fetched.body, fields) {
                        Ok(v) => v,
                        Err(e) => {
                            return ScrapeOutcome::Failed(format!("{}: {e}", item.url));
                        }
                    }
                };
                page.content_hash = Some(check.content_hash.clone());
                page.extracted_text = Some(text);
                if !extracted.is_null() {
                    let mut merged = match page.metadata.clone() {
                        serde_json::Value::Object(m) => m,
                        _ => serde_json::Map::new(),
                    };
                    if let serde_json::Value::Object(ext) = extracted {
                        merged.extend(ext);
                    }
                    page.metadata = serde_json::Value::Object(merged);
                }

                let blob_key = format!("jobs/{}/pages/{}.html", job_id, page.id);
                match self.blobs.put(&blob_key, fetched.body.as_bytes()).await {
                    Ok(path) => page.html_path = Some(path),
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "failed to store raw html");
                    }
                }

                match self.pages.insert_page(&page).await {
                    Ok(crate::traits::PageInsert::Inserted) => {}
                    Ok(crate::traits::PageInsert::DuplicateUrl { existing }) => {
                        // Lost the unique-index race: degrade to a
                        // url-duplicate marker row.
                        let mut marker =
                            CrawledPage::new(job_id, website_id, item.url.clone(), url_hash.clone());
                        marker.is_duplicate = true;
                        marker.duplicate_of = Some(existing);
                        if let Err(e) = self.pages.insert_page(&marker).await {
                            warn!(job_id = %job_id, error = %e, "failed to record race loser");
                        }
                        return ScrapeOutcome::Duplicate;
                    }
                    Err(e) => {
                        return ScrapeOutcome::Failed(format!("{}: store failed: {e}", item.url));
                    }
                }
                if let Err(e) = deduplicator
                    .register_content(check.content_hash.clone(), check.fingerprint, page.id)
                    .await
                {
                    warn!(job_id = %job_id, error = %e, "failed to register content hash");
                }
                if let Err(e) = deduplicator
                    .mark_url(website_id, &url_hash, job_id, &check.content_hash, page.id)
                    .await
                {
                    warn!(job_id = %job_id, error = %e, "failed to mark url as crawled");
                }
                debug!(job_id = %job_id, url = %item.url, "url scraped");
                self.log(
                    LogEntry::info(job_id, "url_scraped", item.url.clone())
                        .with_website(website_id),
                )
                .await;
                ScrapeOutcome::Fresh
            }
        }
    }

    async fn is_cancelled(&self, job_id: JobId, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return true;
        }
        self.cache
            .exists(&format!("cancel:job:{job_id}"))
            .await
            .unwrap_or(false)
    }

    async fn cancelled_result(
        &self,
        job_id: JobId,
        progress: Progress,
        warnings: Vec<String>,
        cleanup: &CleanupCoordinator,
    ) -> CrawlResult {
        let report = cleanup.cleanup(self.settings.cleanup_deadline).await;
        self.log(
            LogEntry::info(
                job_id,
                "crawl_cancelled",
                format!(
                    "cancelled after {} urls ({} graceful, {} forced closes)",
                    progress.urls_processed,
                    report.graceful.len(),
                    report.forced.len()
                ),
            ),
        )
        .await;
        self.push_progress(job_id, &progress).await;
        let mut result = CrawlResult::new(CrawlOutcome::Cancelled, progress);
        result.warnings = warnings;
        result
    }

    async fn push_progress(&self, job_id: JobId, progress: &Progress) {
        let key = format!("progress:job:{job_id}");
        if let Err(e) = self
            .cache
            .set(&key, json!(progress), self.settings.progress_ttl)
            .await
        {
            warn!(job_id = %job_id, error = %e, "failed to push progress snapshot");
        }
    }

    async fn log(&self, entry: LogEntry) {
        if let Err(e) = self.logger.log(entry).await {
            warn!(error = %e, "failed to persist crawl log");
        }
    }
}

enum ScrapeOutcome {
    Fresh,
    Duplicate,
    Failed(String),
    Cancelled,
}

/// Sleep unless cancelled first. Returns true when cancelled.
async fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryKvCache;
    use crate::error::CrawlError;
    use crate::storage::{MemoryBlobStore, MemoryCrawlStore};
    use crate::traits::RetrySink;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Clone)]
    enum Route {
        Page { status: u16, body: String },
        PageWithRetryAfter { status: u16, retry_after: u64 },
        NetworkError,
    }

    /// Fixture fetcher: per-URL response queues, last entry repeats.
    struct FixtureFetcher {
        routes: Mutex<HashMap<String, Vec<Route>>>,
        delay: Duration,
    }

    impl FixtureFetcher {
        fn new() -> Self {
            Self {
                routes: Mutex::new(HashMap::new()),
                delay: Duration::ZERO,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn serve(&self, url: &str, body: &str) {
            self.push(url, Route::Page {
                status: 200,
                body: body.to_string(),
            });
        }

        fn push(&self, url: &str, route: Route) {
            self.routes
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_default()
                .push(route);
        }
    }

    #[async_trait]
    impl Fetcher for FixtureFetcher {
        async fn fetch(&self, url: &str, _method: FetchMethod) -> Result<crate::fetch::FetchedPage, CrawlError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let route = {
                let mut routes = self.routes.lock().unwrap();
                let queue = routes
                    .get_mut(url)
                    .ok_or_else(|| CrawlError::Network {
                        url: url.to_string(),
                        message: "no fixture route".to_string(),
                    })?;
                if queue.len() > 1 {
                    queue.remove(0)
                } else {
                    queue[0].clone()
                }
            };
            match route {
                Route::Page { status, body } => Ok(crate::fetch::FetchedPage {
                    status,
                    final_url: url.to_string(),
                    body,
                    retry_after: None,
                }),
                Route::PageWithRetryAfter { status, retry_after } => {
                    Ok(crate::fetch::FetchedPage {
                        status,
                        final_url: url.to_string(),
                        body: String::new(),
                        retry_after: Some(retry_after),
                    })
                }
                Route::NetworkError => Err(CrawlError::Network {
                    url: url.to_string(),
                    message: "connection reset".to_string(),
                }),
            }
        }
    }

    #[derive(Default)]
    struct MemoryLogger {
        entries: Mutex<Vec<LogEntry>>,
    }

    impl MemoryLogger {
        fn events(&self) -> Vec<String> {
            self.entries
                .lock()
                .unwrap()
                .iter()
                .map(|e| e.event.clone())
                .collect()
        }

        fn count(&self, event: &str) -> usize {
            self.events().iter().filter(|e| e == &event).count()
        }
    }

    #[async_trait]
    impl JobLogger for MemoryLogger {
        async fn log(&self, entry: LogEntry) -> anyhow::Result<()> {
            self.entries.lock().unwrap().push(entry);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemoryRetrySink {
        records: Mutex<Vec<RetryRecord>>,
    }

    impl MemoryRetrySink {
        fn records(&self) -> Vec<RetryRecord> {
            self.records.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RetrySink for MemoryRetrySink {
        async fn record_retry(&self, record: RetryRecord) -> anyhow::Result<()> {
            self.records.lock().unwrap().push(record);
            Ok(())
        }
    }

    struct Harness {
        crawler: SeedUrlCrawler,
        store: Arc<MemoryCrawlStore>,
        cache: Arc<MemoryKvCache>,
        logger: Arc<MemoryLogger>,
        retries: Arc<MemoryRetrySink>,
    }

    fn harness(fetcher: Arc<FixtureFetcher>) -> Harness {
        let store = Arc::new(MemoryCrawlStore::new());
        let cache = Arc::new(MemoryKvCache::new());
        let logger = Arc::new(MemoryLogger::default());
        let retries = Arc::new(MemoryRetrySink::default());
        let crawler = SeedUrlCrawler::new(
            fetcher,
            store.clone(),
            store.clone(),
            cache.clone(),
            Arc::new(MemoryBlobStore::new()),
            logger.clone(),
            retries.clone(),
        );
        Harness {
            crawler,
            store,
            cache,
            logger,
            retries,
        }
    }

    fn template_config() -> serde_json::Value {
        json!({
            "steps": [
                {"kind": "crawl_list", "method": "http", "selectors": {"link": "a.result-link"}},
                {"kind": "scrape_detail", "method": "http", "selectors": {"title": "h1", "body": "div.content"}}
            ],
            "pagination": {"next_selector": "a.next-page", "max_pages": 3},
            "rate_limit": {"requests_per_second": 1000.0}
        })
    }

    fn request(seed: &str, config: serde_json::Value) -> CrawlRequest {
        CrawlRequest {
            job_id: JobId::new(),
            website_id: Some(WebsiteId::new()),
            seed_url: seed.to_string(),
            config,
            overrides: None,
            variables: json!({}),
            metadata: json!({}),
        }
    }

    fn list_page(items: &[&str], next: Option<&str>) -> String {
        let mut body = String::from("<html><body><ul>");
        for item in items {
            body.push_str(&format!(
                r#"<li><a class="result-link" href="{item}">item</a></li>"#
            ));
        }
        body.push_str("</ul>");
        if let Some(next) = next {
            body.push_str(&format!(r#"<a class="next-page" href="{next}">next</a>"#));
        }
        body.push_str("</body></html>");
        body
    }

    fn detail_page(title: &str, content: &str) -> String {
        format!(
            r#"<html><head><title>{title}</title></head>
               <body><h1>{title}</h1><div class="content">{content}</div></body></html>"#
        )
    }

    /// Serve 3 list pages with 4 detail URLs each (12 unique).
    fn serve_happy_path(fetcher: &FixtureFetcher) {
        for page in 1..=3u32 {
            let items: Vec<String> = (1..=4u32)
                .map(|i| format!("/item/{}", (page - 1) * 4 + i))
                .collect();
            let item_refs: Vec<&str> = items.iter().map(String::as_str).collect();
            let next = if page < 3 {
                Some(format!("/list?page={}", page + 1))
            } else {
                None
            };
            let url = if page == 1 {
                "https://example.test/?q=alpha".to_string()
            } else {
                format!("https://example.test/list?page={page}")
            };
            fetcher.serve(&url, &list_page(&item_refs, next.as_deref()));
        }
        for i in 1..=12u32 {
            fetcher.serve(
                &format!("https://example.test/item/{i}"),
                &detail_page(&format!("Item {i}"), &format!("Body of item {i}")),
            );
        }
    }

    #[tokio::test]
    async fn happy_path_template_mode_stores_twelve_pages() {
        let fetcher = Arc::new(FixtureFetcher::new());
        serve_happy_path(&fetcher);
        let h = harness(fetcher);

        let mut req = request("https://example.test/?q=${variables.q}", template_config());
        req.variables = json!({"q": "alpha"});

        let result = h.crawler.crawl(req, CancellationToken::new()).await;

        assert_eq!(result.outcome, CrawlOutcome::Success);
        assert_eq!(result.progress.urls_discovered, 12);
        assert_eq!(result.progress.pages_crawled, 12);
        assert_eq!(result.progress.duplicates, 0);
        assert_eq!(result.progress.urls_failed, 0);
        assert_eq!(result.progress.current_step, "scrape_detail");

        let pages = h.store.pages();
        assert_eq!(pages.len(), 12);
        assert!(pages.iter().all(|p| !p.is_duplicate));
        assert!(pages.iter().all(|p| p.content_hash.is_some()));
        assert!(pages.iter().all(|p| p.html_path.is_some()));

        assert_eq!(h.logger.count("seed_url_fetched"), 1);
        assert_eq!(h.logger.count("pagination_page_processed"), 3);
        assert_eq!(h.logger.count("scrape_completed"), 1);
    }

    #[tokio::test]
    async fn seed_404_is_fatal_without_retry() {
        let fetcher = Arc::new(FixtureFetcher::new());
        fetcher.push(
            "https://example.test/?q=alpha",
            Route::Page {
                status: 404,
                body: String::new(),
            },
        );
        let h = harness(fetcher);

        let result = h
            .crawler
            .crawl(
                request("https://example.test/?q=alpha", template_config()),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(result.outcome, CrawlOutcome::SeedUrl404);
        assert_eq!(result.error_category, Some(ErrorCategory::NotFound));
        assert!(result.error.as_deref().unwrap().contains("seed_url_404"));
        assert!(h.store.pages().is_empty());
        assert!(h.retries.records().is_empty());
    }

    #[tokio::test]
    async fn circular_pagination_keeps_earlier_pages() {
        let fetcher = Arc::new(FixtureFetcher::new());
        let seed = "https://example.test/list";
        // Pages 1..3 each with one unique URL; page 4 repeats page 2's body
        // (including its item link), so the walk must stop without
        // processing it.
        let page2_body = list_page(&["/item/b"], Some("/list?page=3"));
        fetcher.serve(seed, &list_page(&["/item/a"], Some("/list?page=2")));
        fetcher.serve("https://example.test/list?page=2", &page2_body);
        fetcher.serve(
            "https://example.test/list?page=3",
            &list_page(&["/item/c"], Some("/list?page=4")),
        );
        fetcher.serve("https://example.test/list?page=4", &page2_body);
        for item in ["a", "b", "c"] {
            fetcher.serve(
                &format!("https://example.test/item/{item}"),
                &detail_page(item, &format!("unique body {item}")),
            );
        }
        let h = harness(fetcher);

        let config = json!({
            "steps": [
                {"kind": "crawl_list", "selectors": {"link": "a.result-link"}},
                {"kind": "scrape_detail", "selectors": {"title": "h1"}}
            ],
            "pagination": {"next_selector": "a.next-page", "max_pages": 50},
            "rate_limit": {"requests_per_second": 1000.0}
        });
        let result = h
            .crawler
            .crawl(request(seed, config), CancellationToken::new())
            .await;

        assert_eq!(result.outcome, CrawlOutcome::CircularPagination);
        assert_eq!(result.progress.pages_crawled, 3);
        assert_eq!(h.store.pages().len(), 3);
        assert_eq!(h.logger.count("circular_pagination_detected"), 1);
    }

    #[tokio::test]
    async fn cancellation_mid_scrape_preserves_partial_results() {
        let fetcher = Arc::new(FixtureFetcher::new().with_delay(Duration::from_millis(10)));
        let seed = "https://example.test/list";
        let items: Vec<String> = (1..=50u32).map(|i| format!("/item/{i}")).collect();
        let item_refs: Vec<&str> = items.iter().map(String::as_str).collect();
        fetcher.serve(seed, &list_page(&item_refs, None));
        for i in 1..=50u32 {
            fetcher.serve(
                &format!("https://example.test/item/{i}"),
                &detail_page(&format!("Item {i}"), &format!("body {i}")),
            );
        }
        let h = harness(fetcher);

        let config = json!({
            "steps": [
                {"kind": "crawl_list", "selectors": {"link": "a.result-link"}},
                {"kind": "scrape_detail", "selectors": {"title": "h1"}}
            ],
            "rate_limit": {"requests_per_second": 1000.0}
        });
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            canceller.cancel();
        });

        let result = h.crawler.crawl(request(seed, config), cancel).await;

        assert_eq!(result.outcome, CrawlOutcome::Cancelled);
        let stored = h.store.pages().len();
        assert!(stored >= 1, "expected partial results, got {stored}");
        assert!(stored < 50, "expected cancellation before completion");
        assert_eq!(stored as u32, result.progress.pages_crawled);
        assert_eq!(h.logger.count("crawl_cancelled"), 1);
    }

    #[tokio::test]
    async fn cancellation_flag_in_cache_is_observed() {
        let fetcher = Arc::new(FixtureFetcher::new());
        let seed = "https://example.test/list";
        fetcher.serve(seed, &list_page(&["/item/1"], None));
        fetcher.serve(
            "https://example.test/item/1",
            &detail_page("Item", "body"),
        );
        let h = harness(fetcher);

        let req = request(seed, template_config());
        h.cache
            .set(
                &format!("cancel:job:{}", req.job_id),
                json!(true),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let result = h.crawler.crawl(req, CancellationToken::new()).await;
        assert_eq!(result.outcome, CrawlOutcome::Cancelled);
        assert!(h.store.pages().is_empty());
    }

    #[tokio::test]
    async fn rate_limited_url_retries_after_hint_then_succeeds() {
        let fetcher = Arc::new(FixtureFetcher::new());
        let seed = "https://example.test/list";
        fetcher.serve(seed, &list_page(&["/item/1", "/item/2", "/item/3"], None));
        fetcher.serve("https://example.test/item/1", &detail_page("One", "b1"));
        fetcher.serve("https://example.test/item/2", &detail_page("Two", "b2"));
        fetcher.push(
            "https://example.test/item/3",
            Route::PageWithRetryAfter {
                status: 429,
                retry_after: 1,
            },
        );
        fetcher.serve("https://example.test/item/3", &detail_page("Three", "b3"));
        let h = harness(fetcher);

        let config = json!({
            "steps": [
                {"kind": "crawl_list", "selectors": {"link": "a.result-link"}},
                {"kind": "scrape_detail", "selectors": {"title": "h1"}}
            ],
            "rate_limit": {"requests_per_second": 1000.0}
        });
        let result = h
            .crawler
            .crawl(request(seed, config), CancellationToken::new())
            .await;

        assert_eq!(result.outcome, CrawlOutcome::Success);
        assert_eq!(result.progress.pages_crawled, 3);

        let records = h.retries.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].category, ErrorCategory::RateLimit);
        assert_eq!(records[0].attempt, 1);
        assert!(
            (1.0..=1.2).contains(&records[0].delay_seconds),
            "delay {} outside the jittered retry-after window",
            records[0].delay_seconds
        );
    }

    #[tokio::test]
    async fn identical_content_on_two_urls_is_deduplicated() {
        let fetcher = Arc::new(FixtureFetcher::new());
        let seed = "https://example.test/list";
        fetcher.serve(seed, &list_page(&["/item/a", "/item/b"], None));
        let body = detail_page("Same", "identical content body");
        fetcher.serve("https://example.test/item/a", &body);
        fetcher.serve("https://example.test/item/b", &body);
        let h = harness(fetcher);

        let config = json!({
            "steps": [
                {"kind": "crawl_list", "selectors": {"link": "a.result-link"}},
                {"kind": "scrape_detail", "selectors": {"title": "h1"}}
            ],
            "rate_limit": {"requests_per_second": 1000.0}
        });
        let result = h
            .crawler
            .crawl(request(seed, config), CancellationToken::new())
            .await;

        assert_eq!(result.outcome, CrawlOutcome::Success);
        assert_eq!(result.progress.pages_crawled, 1);
        assert_eq!(result.progress.duplicates, 1);

        let pages = h.store.pages();
        assert_eq!(pages.len(), 2);
        let original = pages.iter().find(|p| !p.is_duplicate).unwrap();
        let duplicate = pages.iter().find(|p| p.is_duplicate).unwrap();
        assert_eq!(duplicate.duplicate_of, Some(original.id));
        assert_eq!(duplicate.similarity_score, Some(100));

        let hashes = h.store.content_hashes();
        assert_eq!(hashes.len(), 1);
        assert_eq!(hashes[0].occurrence_count, 2);
    }

    #[tokio::test]
    async fn url_seen_in_earlier_job_is_skipped_without_fetch() {
        let fetcher = Arc::new(FixtureFetcher::new());
        let seed = "https://example.test/list";
        fetcher.serve(seed, &list_page(&["/item/1"], None));
        fetcher.serve("https://example.test/item/1", &detail_page("One", "body"));
        let first = harness(fetcher);

        let website = WebsiteId::new();
        let mut req = request(seed, template_config());
        req.website_id = Some(website);
        let result = first.crawler.crawl(req, CancellationToken::new()).await;
        assert_eq!(result.progress.pages_crawled, 1);

        // Second job over the same template: the detail route is gone, so a
        // fetch attempt would fail. The cache mark must prevent it.
        let fetcher = Arc::new(FixtureFetcher::new());
        fetcher.serve(seed, &list_page(&["/item/1"], None));
        let second = Harness {
            crawler: SeedUrlCrawler::new(
                fetcher,
                first.store.clone(),
                first.store.clone(),
                first.cache.clone(),
                Arc::new(MemoryBlobStore::new()),
                first.logger.clone(),
                first.retries.clone(),
            ),
            store: first.store.clone(),
            cache: first.cache.clone(),
            logger: first.logger.clone(),
            retries: first.retries.clone(),
        };
        let mut req = request(seed, template_config());
        req.website_id = Some(website);
        let result = second.crawler.crawl(req, CancellationToken::new()).await;

        assert_eq!(result.outcome, CrawlOutcome::Success);
        assert_eq!(result.progress.duplicates, 1);
        assert_eq!(result.progress.pages_crawled, 0);
    }

    #[tokio::test]
    async fn mixed_failures_yield_partial_success() {
        let fetcher = Arc::new(FixtureFetcher::new());
        let seed = "https://example.test/list";
        fetcher.serve(seed, &list_page(&["/item/1", "/item/2"], None));
        fetcher.serve("https://example.test/item/1", &detail_page("One", "body"));
        // 403 is auth_error: terminal, no retry.
        fetcher.push(
            "https://example.test/item/2",
            Route::Page {
                status: 403,
                body: String::new(),
            },
        );
        let h = harness(fetcher);

        let config = json!({
            "steps": [
                {"kind": "crawl_list", "selectors": {"link": "a.result-link"}},
                {"kind": "scrape_detail", "selectors": {"title": "h1"}}
            ],
            "rate_limit": {"requests_per_second": 1000.0}
        });
        let result = h
            .crawler
            .crawl(request(seed, config), CancellationToken::new())
            .await;

        assert_eq!(result.outcome, CrawlOutcome::PartialSuccess);
        assert_eq!(result.progress.pages_crawled, 1);
        assert_eq!(result.progress.urls_failed, 1);
        assert_eq!(result.warnings.len(), 1);
        assert!(h.retries.records().is_empty());
    }

    #[tokio::test]
    async fn invalid_config_is_terminal() {
        let fetcher = Arc::new(FixtureFetcher::new());
        let h = harness(fetcher);
        let result = h
            .crawler
            .crawl(
                request(
                    "https://example.test/",
                    json!({"steps": [{"kind": "teleport"}]}),
                ),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(result.outcome, CrawlOutcome::InvalidConfig);
        assert_eq!(result.error_category, Some(ErrorCategory::ValidationError));
    }

    #[tokio::test]
    async fn empty_list_pages_end_with_empty_pages_outcome() {
        let fetcher = Arc::new(FixtureFetcher::new());
        let seed = "https://example.test/list?page=1";
        // Pages keep linking forward but never yield a detail URL. Bodies
        // must differ or the circular detector fires first.
        for page in 1..=4u32 {
            let body = format!(
                r#"<html><body><p>filler {page}</p>
                   <a class="next-page" href="/list?page={}">next</a></body></html>"#,
                page + 1
            );
            fetcher.serve(&format!("https://example.test/list?page={page}"), &body);
        }
        let h = harness(fetcher);

        let config = json!({
            "steps": [{"kind": "crawl_list", "selectors": {"link": "a.result-link"}}],
            "pagination": {"next_selector": "a.next-page", "max_empty_responses": 3},
            "rate_limit": {"requests_per_second": 1000.0}
        });
        let result = h
            .crawler
            .crawl(request(seed, config), CancellationToken::new())
            .await;

        assert_eq!(result.outcome, CrawlOutcome::EmptyPages);
        assert!(h.store.pages().is_empty());
    }

    #[tokio::test]
    async fn progress_snapshot_lands_in_the_cache() {
        let fetcher = Arc::new(FixtureFetcher::new());
        serve_happy_path(&fetcher);
        let h = harness(fetcher);

        let mut req = request("https://example.test/?q=alpha", template_config());
        req.variables = json!({});
        let job_id = req.job_id;
        let result = h.crawler.crawl(req, CancellationToken::new()).await;
        assert_eq!(result.outcome, CrawlOutcome::Success);

        let snapshot = h
            .cache
            .get(&format!("progress:job:{job_id}"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot["urls_processed"], 12);
        assert_eq!(snapshot["current_step"], "scrape_detail");
    }
}
