//! Pagination detection and walk bookkeeping.
//!
//! Detection order: explicit URL template from config, explicit
//! next-button selector, heuristic query-parameter detection on the seed
//! URL and its links. Anything else runs in single-page mode.

use std::collections::VecDeque;

use url::Url;

use crate::config::{ListSelectors, PaginationConfig};
use crate::error::CrawlError;
use crate::extract;
use crate::variables::{VariableContext, VariableResolver};

/// Query parameters the heuristic recognizes as page counters.
const PAGE_PARAMS: &[&str] = &["page", "p", "offset", "start"];

/// How many trailing page hashes the circular detector remembers.
const ROLLING_WINDOW: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub enum PaginationStrategy {
    /// Config-provided URL template with `${pagination.*}` counters.
    UrlTemplate { template: String },
    /// Config-provided next-button selector.
    NextSelector { selector: String },
    /// Heuristically detected numeric query parameter.
    QueryParam { param: String },
    SinglePage,
}

#[derive(Debug, Clone)]
pub struct Detection {
    pub strategy: PaginationStrategy,
    pub warnings: Vec<String>,
}

/// Pick a pagination strategy for this job.
pub fn detect(
    config: Option<&PaginationConfig>,
    seed_url: &str,
    seed_html: &str,
    list_selectors: &ListSelectors,
) -> Result<Detection, CrawlError> {
    let mut warnings = Vec::new();

    if let Some(config) = config {
        if let Some(template) = &config.url_template {
            return Ok(Detection {
                strategy: PaginationStrategy::UrlTemplate {
                    template: template.clone(),
                },
                warnings,
            });
        }
        if let Some(selector) = &config.next_selector {
            if extract::selector_matches(seed_html, selector)? {
                return Ok(Detection {
                    strategy: PaginationStrategy::NextSelector {
                        selector: selector.clone(),
                    },
                    warnings,
                });
            }
            warnings.push(format!(
                "configured pagination selector '{selector}' not found on seed page; single-page mode"
            ));
            return Ok(Detection {
                strategy: PaginationStrategy::SinglePage,
                warnings,
            });
        }
    }

    if let Some(param) = detect_query_param(seed_url, seed_html) {
        return Ok(Detection {
            strategy: PaginationStrategy::QueryParam { param },
            warnings,
        });
    }

    let detail_works = match extract::extract_detail_urls(seed_html, seed_url, list_selectors) {
        Ok(urls) => !urls.is_empty(),
        Err(_) => false,
    };
    if detail_works {
        warnings.push("no pagination detected; continuing in single-page mode".to_string());
    }
    Ok(Detection {
        strategy: PaginationStrategy::SinglePage,
        warnings,
    })
}

/// Heuristic: a recognized numeric page parameter on the seed URL itself,
/// or on a same-path link found in the page.
fn detect_query_param(seed_url: &str, seed_html: &str) -> Option<String> {
    let seed = Url::parse(seed_url).ok()?;

    if let Some(param) = numeric_page_param(&seed) {
        return Some(param);
    }

    for href in extract::all_hrefs(seed_html, seed_url) {
        if let Ok(link) = Url::parse(&href) {
            if link.host_str() == seed.host_str() && link.path() == seed.path() {
                if let Some(param) = numeric_page_param(&link) {
                    return Some(param);
                }
            }
        }
    }
    None
}

fn numeric_page_param(url: &Url) -> Option<String> {
    url.query_pairs().find_map(|(name, value)| {
        let lowered = name.to_ascii_lowercase();
        if PAGE_PARAMS.contains(&lowered.as_str()) && value.parse::<u64>().is_ok() {
            Some(name.into_owned())
        } else {
            None
        }
    })
}

/// Why the walk stopped before cancellation or natural exhaustion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkStop {
    MaxPages,
    Circular,
    EmptyPages,
}

/// Per-job walk state: page counter, rolling content hashes, empty streak.
#[derive(Debug)]
pub struct PaginationWalk {
    strategy: PaginationStrategy,
    max_pages: u32,
    max_empty: u32,
    pages_fetched: u32,
    empty_streak: u32,
    recent_hashes: VecDeque<String>,
}

impl PaginationWalk {
    pub fn new(strategy: PaginationStrategy, max_pages: u32, max_empty: u32) -> Self {
        Self {
            strategy,
            max_pages,
            max_empty,
            pages_fetched: 0,
            empty_streak: 0,
            recent_hashes: VecDeque::with_capacity(ROLLING_WINDOW),
        }
    }

    pub fn strategy(&self) -> &PaginationStrategy {
        &self.strategy
    }

    pub fn pages_fetched(&self) -> u32 {
        self.pages_fetched
    }

    /// Register a fetched page's content hash. Returns true when the hash
    /// repeats within the rolling window (circular pagination).
    pub fn check_hash(&mut self, content_hash: &str) -> bool {
        if self.recent_hashes.iter().any(|h| h == content_hash) {
            return true;
        }
        if self.recent_hashes.len() == ROLLING_WINDOW {
            self.recent_hashes.pop_front();
        }
        self.recent_hashes.push_back(content_hash.to_string());
        false
    }

    /// Register the URL yield of the page just processed.
    pub fn record_urls(&mut self, count: usize) -> Option<WalkStop> {
        self.pages_fetched += 1;
        if count == 0 {
            self.empty_streak += 1;
            if self.empty_streak >= self.max_empty {
                return Some(WalkStop::EmptyPages);
            }
        } else {
            self.empty_streak = 0;
        }
        if self.pages_fetched >= self.max_pages {
            return Some(WalkStop::MaxPages);
        }
        None
    }

    /// URL of the next list page, or None when the walk is exhausted.
    ///
    /// `page_number` is the 1-based number of the page being requested;
    /// `offset` is the count of detail URLs discovered so far.
    pub fn next_url(
        &self,
        page_number: u64,
        offset: u64,
        current_url: &str,
        current_html: &str,
        resolver: &VariableResolver,
        ctx: &mut VariableContext,
    ) -> Result<Option<String>, CrawlError> {
        match &self.strategy {
            PaginationStrategy::SinglePage => Ok(None),
            PaginationStrategy::UrlTemplate { template } => {
                ctx.set_pagination(page_number, offset);
                let (url, _) = resolver.resolve(ctx, template)?;
                Ok(Some(url))
            }
            PaginationStrategy::NextSelector { selector } => {
                let next = extract::first_href(current_html, selector, current_url)?;
                // A next link pointing at the current page would loop.
                Ok(next.filter(|n| n != current_url))
            }
            PaginationStrategy::QueryParam { param } => {
                let mut url = Url::parse(current_url)
                    .map_err(|e| CrawlError::InvalidConfig(format!("bad page url: {e}")))?;
                let mut params: Vec<(String, String)> = url
                    .query_pairs()
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect();
                let mut bumped = false;
                for (name, value) in params.iter_mut() {
                    if name == param {
                        let current: u64 = value.parse().unwrap_or(page_number - 1);
                        *value = (current + 1).to_string();
                        bumped = true;
                    }
                }
                if !bumped {
                    params.push((param.clone(), page_number.to_string()));
                }
                let query = url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(params.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                    .finish();
                url.set_query(Some(&query));
                Ok(Some(url.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::VariableResolver;

    fn list_selectors() -> ListSelectors {
        ListSelectors {
            link: Some("a.result-link".to_string()),
            ..Default::default()
        }
    }

    const SEED_HTML: &str = r#"<html><body>
        <a class="result-link" href="/item/1">One</a>
        <a class="next-page" href="/search?q=alpha&page=2">Next</a>
    </body></html>"#;

    #[test]
    fn url_template_wins_over_everything() {
        let config = PaginationConfig {
            url_template: Some("https://example.test/?page=${pagination.page}".to_string()),
            next_selector: Some("a.next-page".to_string()),
            ..Default::default()
        };
        let detection = detect(
            Some(&config),
            "https://example.test/",
            SEED_HTML,
            &list_selectors(),
        )
        .unwrap();
        assert!(matches!(
            detection.strategy,
            PaginationStrategy::UrlTemplate { .. }
        ));
    }

    #[test]
    fn next_selector_is_used_when_present_on_seed() {
        let config = PaginationConfig {
            next_selector: Some("a.next-page".to_string()),
            ..Default::default()
        };
        let detection = detect(
            Some(&config),
            "https://example.test/",
            SEED_HTML,
            &list_selectors(),
        )
        .unwrap();
        assert_eq!(
            detection.strategy,
            PaginationStrategy::NextSelector {
                selector: "a.next-page".to_string()
            }
        );
        assert!(detection.warnings.is_empty());
    }

    #[test]
    fn missing_configured_selector_degrades_to_single_page_with_warning() {
        let config = PaginationConfig {
            next_selector: Some("a.does-not-exist".to_string()),
            ..Default::default()
        };
        let detection = detect(
            Some(&config),
            "https://example.test/",
            SEED_HTML,
            &list_selectors(),
        )
        .unwrap();
        assert_eq!(detection.strategy, PaginationStrategy::SinglePage);
        assert_eq!(detection.warnings.len(), 1);
    }

    #[test]
    fn heuristic_detects_page_param_on_seed_url() {
        let detection = detect(
            None,
            "https://example.test/search?q=alpha&page=1",
            SEED_HTML,
            &list_selectors(),
        )
        .unwrap();
        assert_eq!(
            detection.strategy,
            PaginationStrategy::QueryParam {
                param: "page".to_string()
            }
        );
    }

    #[test]
    fn heuristic_detects_page_param_on_same_path_links() {
        let detection = detect(
            None,
            "https://example.test/search?q=alpha",
            SEED_HTML,
            &list_selectors(),
        )
        .unwrap();
        assert_eq!(
            detection.strategy,
            PaginationStrategy::QueryParam {
                param: "page".to_string()
            }
        );
    }

    #[test]
    fn no_signal_means_single_page_with_warning_when_details_extract() {
        let detection = detect(
            None,
            "https://example.test/plain",
            r#"<a class="result-link" href="/item/1">One</a>"#,
            &list_selectors(),
        )
        .unwrap();
        assert_eq!(detection.strategy, PaginationStrategy::SinglePage);
        assert_eq!(detection.warnings.len(), 1);
    }

    #[test]
    fn query_param_strategy_increments_the_counter() {
        let walk = PaginationWalk::new(
            PaginationStrategy::QueryParam {
                param: "page".to_string(),
            },
            50,
            3,
        );
        let resolver = VariableResolver::default();
        let mut ctx = VariableContext::default();
        let next = walk
            .next_url(
                2,
                4,
                "https://example.test/search?q=alpha&page=1",
                "",
                &resolver,
                &mut ctx,
            )
            .unwrap();
        assert_eq!(
            next.as_deref(),
            Some("https://example.test/search?q=alpha&page=2")
        );
    }

    #[test]
    fn url_template_strategy_resolves_counters() {
        let walk = PaginationWalk::new(
            PaginationStrategy::UrlTemplate {
                template: "https://example.test/?page=${pagination.page}&offset=${pagination.offset}"
                    .to_string(),
            },
            50,
            3,
        );
        let resolver = VariableResolver::default();
        let mut ctx = VariableContext::default();
        let next = walk
            .next_url(3, 24, "https://example.test/?page=2", "", &resolver, &mut ctx)
            .unwrap();
        assert_eq!(
            next.as_deref(),
            Some("https://example.test/?page=3&offset=24")
        );
    }

    #[test]
    fn next_selector_pointing_at_current_page_ends_the_walk() {
        let walk = PaginationWalk::new(
            PaginationStrategy::NextSelector {
                selector: "a.next-page".to_string(),
            },
            50,
            3,
        );
        let resolver = VariableResolver::default();
        let mut ctx = VariableContext::default();
        let html = r#"<a class="next-page" href="https://example.test/list">Next</a>"#;
        let next = walk
            .next_url(2, 0, "https://example.test/list", html, &resolver, &mut ctx)
            .unwrap();
        assert_eq!(next, None);
    }

    #[test]
    fn repeated_hash_within_window_is_circular() {
        let mut walk = PaginationWalk::new(PaginationStrategy::SinglePage, 50, 3);
        assert!(!walk.check_hash("h1"));
        assert!(!walk.check_hash("h2"));
        assert!(!walk.check_hash("h3"));
        assert!(walk.check_hash("h2"));
    }

    #[test]
    fn hashes_roll_out_of_the_window() {
        let mut walk = PaginationWalk::new(PaginationStrategy::SinglePage, 500, 3);
        for i in 0..ROLLING_WINDOW + 1 {
            assert!(!walk.check_hash(&format!("h{i}")));
        }
        // h0 was evicted, so it no longer reads as circular.
        assert!(!walk.check_hash("h0"));
    }

    #[test]
    fn empty_streak_stops_the_walk() {
        let mut walk = PaginationWalk::new(PaginationStrategy::SinglePage, 50, 2);
        assert_eq!(walk.record_urls(5), None);
        assert_eq!(walk.record_urls(0), None);
        assert_eq!(walk.record_urls(0), Some(WalkStop::EmptyPages));
    }

    #[test]
    fn url_yield_resets_the_empty_streak() {
        let mut walk = PaginationWalk::new(PaginationStrategy::SinglePage, 50, 2);
        assert_eq!(walk.record_urls(0), None);
        assert_eq!(walk.record_urls(3), None);
        assert_eq!(walk.record_urls(0), None);
    }

    #[test]
    fn max_pages_stops_the_walk() {
        let mut walk = PaginationWalk::new(PaginationStrategy::SinglePage, 2, 5);
        assert_eq!(walk.record_urls(4), None);
        assert_eq!(walk.record_urls(4), Some(WalkStop::MaxPages));
    }
}
