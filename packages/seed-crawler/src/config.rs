//! Typed crawl configuration.
//!
//! Website templates and inline configs arrive as JSON documents; they are
//! parsed into these records at pipeline entry. Step kinds and fetch
//! methods are closed sets, so unknown values fail the schema check
//! up front instead of deep inside the pipeline.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CrawlError;
use crate::retry::{BackoffStrategy, ErrorCategory, RetryPolicy};
use crate::variables::ResolveMode;

pub const DEFAULT_MAX_PAGES: u32 = 50;
pub const MAX_PAGES_CAP: u32 = 500;
pub const DEFAULT_MAX_EMPTY_RESPONSES: u32 = 3;
pub const DEFAULT_URL_TTL_DAYS: u32 = 14;
pub const DEFAULT_SIMHASH_MAX_DISTANCE: u32 = 3;
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.95;

/// How a step fetches a URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FetchMethod {
    Api,
    Browser,
    #[default]
    Http,
}

/// One selector, optionally pulling an attribute instead of text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldSelector {
    pub selector: String,
    pub attr: Option<String>,
}

impl FieldSelector {
    pub fn text(selector: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            attr: None,
        }
    }
}

// Accepts both the shorthand `"title": "h1"` and the full form
// `"title": {"selector": "h1", "attr": "datetime"}`.
impl<'de> Deserialize<'de> for FieldSelector {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Short(String),
            Full {
                selector: String,
                #[serde(default)]
                attr: Option<String>,
            },
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Short(selector) => FieldSelector {
                selector,
                attr: None,
            },
            Raw::Full { selector, attr } => FieldSelector { selector, attr },
        })
    }
}

/// Detail-URL extraction on list pages: either a flat anchor selector or a
/// container + sub-selector pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ListSelectors {
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub link_within: Option<String>,
    #[serde(default)]
    pub fields: HashMap<String, FieldSelector>,
}

/// One unit of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepConfig {
    /// Produces detail URLs (+ row metadata) from list pages.
    CrawlList {
        #[serde(default)]
        method: FetchMethod,
        #[serde(default)]
        selectors: ListSelectors,
    },
    /// Produces content per detail URL.
    ScrapeDetail {
        #[serde(default)]
        method: FetchMethod,
        #[serde(default)]
        selectors: HashMap<String, FieldSelector>,
    },
}

impl StepConfig {
    pub fn kind_name(&self) -> &'static str {
        match self {
            StepConfig::CrawlList { .. } => "crawl_list",
            StepConfig::ScrapeDetail { .. } => "scrape_detail",
        }
    }
}

/// Pagination hints from the template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PaginationConfig {
    /// URL template with `${pagination.page}` / `${pagination.offset}`.
    #[serde(default)]
    pub url_template: Option<String>,
    /// Next-button anchor selector.
    #[serde(default)]
    pub next_selector: Option<String>,
    #[serde(default)]
    pub max_pages: Option<u32>,
    #[serde(default)]
    pub max_empty_responses: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub url_ttl_days: u32,
    pub simhash_max_distance: u32,
    pub similarity_threshold: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            url_ttl_days: DEFAULT_URL_TTL_DAYS,
            simhash_max_distance: DEFAULT_SIMHASH_MAX_DISTANCE,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

/// Per-category retry-policy override as written in the config document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOverride {
    pub is_retryable: bool,
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    pub initial_delay_secs: f64,
    pub max_delay_secs: f64,
    pub multiplier: f64,
}

impl Default for RetryOverride {
    fn default() -> Self {
        Self {
            is_retryable: true,
            max_attempts: 3,
            backoff: BackoffStrategy::Exponential,
            initial_delay_secs: 1.0,
            max_delay_secs: 60.0,
            multiplier: 2.0,
        }
    }
}

impl From<RetryOverride> for RetryPolicy {
    fn from(o: RetryOverride) -> Self {
        RetryPolicy::new(
            o.is_retryable,
            o.max_attempts,
            o.backoff,
            o.initial_delay_secs,
            o.max_delay_secs,
            o.multiplier,
        )
    }
}

/// The full crawl configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlConfig {
    pub steps: Vec<StepConfig>,
    #[serde(default)]
    pub pagination: Option<PaginationConfig>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub variables: Value,
    #[serde(default)]
    pub tracking_params: Vec<String>,
    /// Selectors stripped from content before hashing (nav bars, footers).
    #[serde(default)]
    pub boilerplate_selectors: Vec<String>,
    #[serde(default)]
    pub retry: HashMap<ErrorCategory, RetryOverride>,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub lenient_variables: bool,
}

impl CrawlConfig {
    /// Parse and validate a config document, applying per-entry overrides
    /// (shallow JSON merge, override keys win) first.
    pub fn resolve(document: &Value, overrides: Option<&Value>) -> Result<Self, CrawlError> {
        let merged = match overrides {
            Some(o) => merge_documents(document, o),
            None => document.clone(),
        };
        let config: CrawlConfig = serde_json::from_value(merged)
            .map_err(|e| CrawlError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CrawlError> {
        if self.steps.is_empty() {
            return Err(CrawlError::InvalidConfig(
                "config must define at least one step".to_string(),
            ));
        }
        if self.list_step().is_none() {
            return Err(CrawlError::InvalidConfig(
                "config must include a crawl_list step".to_string(),
            ));
        }

        for step in &self.steps {
            match step {
                StepConfig::CrawlList { selectors, .. } => {
                    let flat = selectors.link.is_some();
                    let pair = selectors.container.is_some() && selectors.link_within.is_some();
                    if !flat && !pair {
                        return Err(CrawlError::InvalidConfig(
                            "crawl_list needs a link selector or a container + link_within pair"
                                .to_string(),
                        ));
                    }
                    for s in [
                        selectors.link.as_deref(),
                        selectors.container.as_deref(),
                        selectors.link_within.as_deref(),
                    ]
                    .into_iter()
                    .flatten()
                    {
                        check_selector(s)?;
                    }
                    for field in selectors.fields.values() {
                        check_selector(&field.selector)?;
                    }
                }
                StepConfig::ScrapeDetail { selectors, .. } => {
                    for field in selectors.values() {
                        check_selector(&field.selector)?;
                    }
                }
            }
        }

        if let Some(pagination) = &self.pagination {
            if let Some(next) = &pagination.next_selector {
                check_selector(next)?;
            }
        }
        for s in &self.boilerplate_selectors {
            check_selector(s)?;
        }
        if self.rate_limit.requests_per_second <= 0.0 {
            return Err(CrawlError::InvalidConfig(
                "rate_limit.requests_per_second must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective page cap: configured value clamped to the hard cap.
    pub fn max_pages(&self) -> u32 {
        self.pagination
            .as_ref()
            .and_then(|p| p.max_pages)
            .unwrap_or(DEFAULT_MAX_PAGES)
            .min(MAX_PAGES_CAP)
    }

    pub fn max_empty_responses(&self) -> u32 {
        self.pagination
            .as_ref()
            .and_then(|p| p.max_empty_responses)
            .unwrap_or(DEFAULT_MAX_EMPTY_RESPONSES)
    }

    pub fn resolve_mode(&self) -> ResolveMode {
        if self.lenient_variables {
            ResolveMode::Lenient
        } else {
            ResolveMode::Strict
        }
    }

    pub fn retry_overrides(&self) -> HashMap<ErrorCategory, RetryPolicy> {
        self.retry
            .iter()
            .map(|(category, o)| (*category, RetryPolicy::from(o.clone())))
            .collect()
    }

    pub fn list_step(&self) -> Option<(&FetchMethod, &ListSelectors)> {
        self.steps.iter().find_map(|s| match s {
            StepConfig::CrawlList { method, selectors } => Some((method, selectors)),
            _ => None,
        })
    }

    pub fn detail_step(&self) -> Option<(&FetchMethod, &HashMap<String, FieldSelector>)> {
        self.steps.iter().find_map(|s| match s {
            StepConfig::ScrapeDetail { method, selectors } => Some((method, selectors)),
            _ => None,
        })
    }
}

fn check_selector(selector: &str) -> Result<(), CrawlError> {
    let trimmed = selector.trim();
    if trimmed.is_empty() {
        return Err(CrawlError::InvalidConfig("empty selector".to_string()));
    }
    // XPath expressions are recognized but not supported by the CSS engine.
    if trimmed.starts_with('/') {
        return Err(CrawlError::InvalidConfig(format!(
            "xpath selectors are not supported: {trimmed}"
        )));
    }
    scraper::Selector::parse(trimmed)
        .map(|_| ())
        .map_err(|e| CrawlError::InvalidConfig(format!("invalid selector '{trimmed}': {e:?}")))
}

/// Shallow merge: top-level override keys replace document keys.
fn merge_documents(document: &Value, overrides: &Value) -> Value {
    match (document, overrides) {
        (Value::Object(base), Value::Object(over)) => {
            let mut merged = base.clone();
            for (k, v) in over {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        (_, o) if !o.is_null() => o.clone(),
        (d, _) => d.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_document() -> Value {
        json!({
            "steps": [
                {"kind": "crawl_list", "method": "http", "selectors": {"link": "a.result-link"}},
                {"kind": "scrape_detail", "method": "http", "selectors": {"title": "h1", "body": "div.content"}}
            ],
            "pagination": {"next_selector": "a.next-page", "max_pages": 3}
        })
    }

    #[test]
    fn parses_a_two_step_template() {
        let config = CrawlConfig::resolve(&sample_document(), None).unwrap();
        assert_eq!(config.steps.len(), 2);
        assert!(config.list_step().is_some());
        let (_, fields) = config.detail_step().unwrap();
        assert_eq!(fields["title"], FieldSelector::text("h1"));
        assert_eq!(config.max_pages(), 3);
    }

    #[test]
    fn field_selector_accepts_full_form() {
        let config = CrawlConfig::resolve(
            &json!({
                "steps": [
                    {"kind": "crawl_list", "selectors": {"link": "a"}},
                    {"kind": "scrape_detail", "selectors": {
                        "published": {"selector": "time", "attr": "datetime"}
                    }}
                ]
            }),
            None,
        )
        .unwrap();
        let (_, fields) = config.detail_step().unwrap();
        assert_eq!(fields["published"].attr.as_deref(), Some("datetime"));
    }

    #[test]
    fn unknown_step_kind_is_rejected() {
        let err = CrawlConfig::resolve(
            &json!({"steps": [{"kind": "teleport", "selectors": {}}]}),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, CrawlError::InvalidConfig(_)));
    }

    #[test]
    fn empty_steps_are_rejected() {
        let err = CrawlConfig::resolve(&json!({"steps": []}), None).unwrap_err();
        assert!(matches!(err, CrawlError::InvalidConfig(_)));
    }

    #[test]
    fn crawl_list_without_selectors_is_rejected() {
        let err = CrawlConfig::resolve(
            &json!({"steps": [{"kind": "crawl_list", "selectors": {}}]}),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, CrawlError::InvalidConfig(_)));
    }

    #[test]
    fn container_pair_is_accepted() {
        let config = CrawlConfig::resolve(
            &json!({"steps": [{"kind": "crawl_list", "selectors": {
                "container": "li.result",
                "link_within": "a",
                "fields": {"price": "span.price"}
            }}]}),
            None,
        )
        .unwrap();
        let (_, selectors) = config.list_step().unwrap();
        assert_eq!(selectors.container.as_deref(), Some("li.result"));
    }

    #[test]
    fn malformed_selector_is_rejected() {
        let err = CrawlConfig::resolve(
            &json!({"steps": [{"kind": "crawl_list", "selectors": {"link": "a[["}}]}),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, CrawlError::InvalidConfig(_)));
    }

    #[test]
    fn xpath_selectors_are_rejected() {
        let err = CrawlConfig::resolve(
            &json!({"steps": [{"kind": "crawl_list", "selectors": {"link": "//a[@class='x']"}}]}),
            None,
        )
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("xpath"), "unexpected error: {message}");
    }

    #[test]
    fn max_pages_is_capped() {
        let config = CrawlConfig::resolve(
            &json!({
                "steps": [{"kind": "crawl_list", "selectors": {"link": "a"}}],
                "pagination": {"max_pages": 9999}
            }),
            None,
        )
        .unwrap();
        assert_eq!(config.max_pages(), MAX_PAGES_CAP);
    }

    #[test]
    fn overrides_shadow_document_keys() {
        let config = CrawlConfig::resolve(
            &sample_document(),
            Some(&json!({"rate_limit": {"requests_per_second": 0.5}})),
        )
        .unwrap();
        assert_eq!(config.rate_limit.requests_per_second, 0.5);
        // Untouched keys survive the merge.
        assert_eq!(config.steps.len(), 2);
    }

    #[test]
    fn retry_overrides_convert_to_policies() {
        let config = CrawlConfig::resolve(
            &json!({
                "steps": [{"kind": "crawl_list", "selectors": {"link": "a"}}],
                "retry": {"rate_limit": {"max_attempts": 7, "backoff": "fixed"}}
            }),
            None,
        )
        .unwrap();
        let overrides = config.retry_overrides();
        let policy = &overrides[&ErrorCategory::RateLimit];
        assert_eq!(policy.max_attempts, 7);
        assert_eq!(policy.backoff, BackoffStrategy::Fixed);
    }

    #[test]
    fn zero_rate_limit_is_rejected() {
        let err = CrawlConfig::resolve(
            &json!({
                "steps": [{"kind": "crawl_list", "selectors": {"link": "a"}}],
                "rate_limit": {"requests_per_second": 0.0}
            }),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, CrawlError::InvalidConfig(_)));
    }
}
