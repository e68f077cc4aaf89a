//! Two-phase deduplication: cheap URL-hash cache check, then content
//! SHA-256 + Simhash against the relational store.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::config::DedupConfig;
use crate::simhash;
use crate::traits::{ContentHashStore, KvCache};
use crate::types::{ContentHashRecord, DedupDecision, JobId, PageId, WebsiteId};

/// Normalize text for content hashing: lowercase, alphanumeric + spaces
/// only, whitespace collapsed. Robust against formatting-only changes
/// while still catching meaningful edits.
pub fn normalize_content(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// SHA-256 of normalized content, hex-encoded.
pub fn content_hash(normalized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

/// Outcome of the content phase for one page.
#[derive(Debug, Clone)]
pub struct ContentCheck {
    pub content_hash: String,
    pub fingerprint: u64,
    pub decision: DedupDecision,
}

pub struct Deduplicator {
    cache: Arc<dyn KvCache>,
    hashes: Arc<dyn ContentHashStore>,
    config: DedupConfig,
}

impl Deduplicator {
    pub fn new(cache: Arc<dyn KvCache>, hashes: Arc<dyn ContentHashStore>, config: DedupConfig) -> Self {
        Self {
            cache,
            hashes,
            config,
        }
    }

    fn url_key(website_id: Option<WebsiteId>, url_hash: &str) -> String {
        match website_id {
            Some(id) => format!("crawled:{id}:{url_hash}"),
            None => format!("crawled:adhoc:{url_hash}"),
        }
    }

    /// URL phase. A fresh cache mark means the URL was crawled within the
    /// TTL window; no fetch happens.
    pub async fn check_url(
        &self,
        website_id: Option<WebsiteId>,
        url_hash: &str,
    ) -> Result<Option<DedupDecision>> {
        let key = Self::url_key(website_id, url_hash);
        match self.cache.get(&key).await? {
            Some(value) => {
                let original = value
                    .get("page_id")
                    .and_then(|v| serde_json::from_value::<PageId>(v.clone()).ok());
                Ok(Some(DedupDecision::UrlDuplicate { original }))
            }
            None => Ok(None),
        }
    }

    /// Mark a URL as crawled for the TTL window.
    pub async fn mark_url(
        &self,
        website_id: Option<WebsiteId>,
        url_hash: &str,
        job_id: JobId,
        content_hash: &str,
        page_id: PageId,
    ) -> Result<()> {
        let key = Self::url_key(website_id, url_hash);
        let ttl = Duration::from_secs(u64::from(self.config.url_ttl_days) * 24 * 3600);
        self.cache
            .set(
                &key,
                json!({
                    "job_id": job_id,
                    "crawled_at": chrono::Utc::now(),
                    "content_hash": content_hash,
                    "page_id": page_id,
                }),
                ttl,
            )
            .await
    }

    /// Content phase. Hashes the normalized text, then checks exact
    /// SHA-256 and near-duplicate Simhash matches.
    pub async fn check_content(&self, normalized: &str) -> Result<ContentCheck> {
        let hash = content_hash(normalized);
        let fingerprint = simhash::simhash64(normalized);

        if let Some(existing) = self.hashes.find_exact(&hash).await? {
            return Ok(ContentCheck {
                content_hash: hash,
                fingerprint,
                decision: DedupDecision::ContentDuplicate {
                    original: existing.first_seen_page_id,
                    similarity_score: 100,
                },
            });
        }

        let candidates = self.hashes.find_simhash_candidates(fingerprint).await?;
        let mut best: Option<(f64, ContentHashRecord)> = None;
        for candidate in candidates {
            let Some(fp) = candidate.fingerprint() else {
                continue;
            };
            if simhash::hamming(fingerprint, fp) > self.config.simhash_max_distance {
                continue;
            }
            let score = simhash::similarity(fingerprint, fp);
            if best.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
                best = Some((score, candidate));
            }
        }

        if let Some((score, record)) = best {
            if score >= self.config.similarity_threshold {
                return Ok(ContentCheck {
                    content_hash: hash,
                    fingerprint,
                    decision: DedupDecision::ContentDuplicate {
                        original: record.first_seen_page_id,
                        similarity_score: (score * 100.0).round() as i16,
                    },
                });
            }
        }

        Ok(ContentCheck {
            content_hash: hash,
            fingerprint,
            decision: DedupDecision::Fresh,
        })
    }

    /// Register a page's content hash. For exact duplicates this bumps the
    /// occurrence count; for fresh content it creates the row.
    pub async fn register_content(
        &self,
        content_hash: String,
        fingerprint: u64,
        page_id: PageId,
    ) -> Result<ContentHashRecord> {
        let record = ContentHashRecord::new(content_hash, page_id, fingerprint);
        self.hashes.upsert(&record).await
    }
}
