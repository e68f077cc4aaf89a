//! In-memory crawl store for tests and single-process runs.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use crate::simhash;
use crate::traits::{ContentHashStore, PageInsert, PageStore};
use crate::types::{ContentHashRecord, CrawledPage, WebsiteId};

/// In-memory [`PageStore`] + [`ContentHashStore`].
///
/// Mirrors the production uniqueness rules: at most one non-duplicate page
/// per `(website_id, url_hash)`; content hashes keyed by the exact hash.
#[derive(Default)]
pub struct MemoryCrawlStore {
    pages: Mutex<Vec<CrawledPage>>,
    hashes: Mutex<HashMap<String, ContentHashRecord>>,
}

impl MemoryCrawlStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pages(&self) -> Vec<CrawledPage> {
        self.pages.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn content_hashes(&self) -> Vec<ContentHashRecord> {
        self.hashes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl PageStore for MemoryCrawlStore {
    async fn insert_page(&self, page: &CrawledPage) -> Result<PageInsert> {
        let mut pages = self.pages.lock().unwrap_or_else(|e| e.into_inner());
        if !page.is_duplicate {
            if let Some(existing) = pages
                .iter()
                .find(|p| {
                    !p.is_duplicate
                        && p.website_id == page.website_id
                        && p.url_hash == page.url_hash
                })
                .map(|p| p.id)
            {
                return Ok(PageInsert::DuplicateUrl { existing });
            }
        }
        pages.push(page.clone());
        Ok(PageInsert::Inserted)
    }

    async fn find_by_url_hash(
        &self,
        website_id: Option<WebsiteId>,
        url_hash: &str,
    ) -> Result<Option<CrawledPage>> {
        let pages = self.pages.lock().unwrap_or_else(|e| e.into_inner());
        Ok(pages
            .iter()
            .find(|p| !p.is_duplicate && p.website_id == website_id && p.url_hash == url_hash)
            .cloned())
    }
}

#[async_trait]
impl ContentHashStore for MemoryCrawlStore {
    async fn find_exact(&self, content_hash: &str) -> Result<Option<ContentHashRecord>> {
        let hashes = self.hashes.lock().unwrap_or_else(|e| e.into_inner());
        Ok(hashes.get(content_hash).cloned())
    }

    async fn upsert(&self, record: &ContentHashRecord) -> Result<ContentHashRecord> {
        let mut hashes = self.hashes.lock().unwrap_or_else(|e| e.into_inner());
        let updated = match hashes.get(&record.content_hash) {
            Some(existing) => {
                let mut bumped = existing.clone();
                bumped.occurrence_count += 1;
                bumped.last_seen_at = Utc::now();
                bumped
            }
            None => record.clone(),
        };
        hashes.insert(record.content_hash.clone(), updated.clone());
        Ok(updated)
    }

    async fn find_simhash_candidates(&self, fingerprint: u64) -> Result<Vec<ContentHashRecord>> {
        let wanted = simhash::bands(fingerprint);
        let hashes = self.hashes.lock().unwrap_or_else(|e| e.into_inner());
        Ok(hashes
            .values()
            .filter(|record| match record.fingerprint() {
                Some(fp) => {
                    let have = simhash::bands(fp);
                    wanted.iter().zip(have.iter()).any(|(a, b)| a == b)
                }
                None => false,
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobId, PageId};

    fn page(url_hash: &str, website: Option<WebsiteId>) -> CrawledPage {
        CrawledPage::new(
            JobId::new(),
            website,
            format!("https://example.test/{url_hash}"),
            url_hash.to_string(),
        )
    }

    #[tokio::test]
    async fn duplicate_url_insert_loses_the_race() {
        let store = MemoryCrawlStore::new();
        let website = Some(WebsiteId::new());
        let first = page("h1", website);
        assert_eq!(store.insert_page(&first).await.unwrap(), PageInsert::Inserted);

        let second = page("h1", website);
        assert_eq!(
            store.insert_page(&second).await.unwrap(),
            PageInsert::DuplicateUrl { existing: first.id }
        );
    }

    #[tokio::test]
    async fn duplicate_flagged_rows_bypass_uniqueness() {
        let store = MemoryCrawlStore::new();
        let website = Some(WebsiteId::new());
        let first = page("h1", website);
        store.insert_page(&first).await.unwrap();

        let mut marker = page("h1", website);
        marker.is_duplicate = true;
        marker.duplicate_of = Some(first.id);
        assert_eq!(
            store.insert_page(&marker).await.unwrap(),
            PageInsert::Inserted
        );
        assert_eq!(store.pages().len(), 2);
    }

    #[tokio::test]
    async fn different_templates_do_not_collide() {
        let store = MemoryCrawlStore::new();
        store
            .insert_page(&page("h1", Some(WebsiteId::new())))
            .await
            .unwrap();
        assert_eq!(
            store
                .insert_page(&page("h1", Some(WebsiteId::new())))
                .await
                .unwrap(),
            PageInsert::Inserted
        );
    }

    #[tokio::test]
    async fn upsert_bumps_occurrence_count() {
        let store = MemoryCrawlStore::new();
        let record = ContentHashRecord::new("c1".to_string(), PageId::new(), 42);
        assert_eq!(store.upsert(&record).await.unwrap().occurrence_count, 1);
        assert_eq!(store.upsert(&record).await.unwrap().occurrence_count, 2);
        // First-seen page survives the bump.
        assert_eq!(
            store.upsert(&record).await.unwrap().first_seen_page_id,
            record.first_seen_page_id
        );
    }

    #[tokio::test]
    async fn simhash_candidates_share_a_band() {
        let store = MemoryCrawlStore::new();
        let fp = 0xAAAA_BBBB_CCCC_DDDDu64;
        store
            .upsert(&ContentHashRecord::new("c1".to_string(), PageId::new(), fp))
            .await
            .unwrap();
        // Same fingerprint with two low bits flipped: shares upper bands.
        let close = fp ^ 0b11;
        let candidates = store.find_simhash_candidates(close).await.unwrap();
        assert_eq!(candidates.len(), 1);

        let far = !fp;
        let candidates = store.find_simhash_candidates(far).await.unwrap();
        assert!(candidates.is_empty());
    }
}
