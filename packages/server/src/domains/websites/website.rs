//! Website template model and its immutable config history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use url::Url;
use uuid::Uuid;

use seed_crawler::config::CrawlConfig;
use seed_crawler::types::WebsiteId;

use crate::domains::schedules::cron;
use crate::jobs::service::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "website_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WebsiteStatus {
    #[default]
    Active,
    Inactive,
}

/// A registered crawl template. Name is unique among non-soft-deleted
/// rows; soft deletion sets `deleted_at` and leaves running jobs alone.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Website {
    #[builder(default = WebsiteId::new())]
    pub id: WebsiteId,
    pub name: String,
    pub base_url: String,
    pub config: serde_json::Value,
    #[builder(default)]
    pub status: WebsiteStatus,
    #[builder(default, setter(strip_option))]
    pub default_cron: Option<String>,
    #[builder(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Website {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.name.trim().is_empty() {
            return Err(ServiceError::InvalidConfig(
                "website name must not be empty".to_string(),
            ));
        }
        Url::parse(&self.base_url)
            .map_err(|e| ServiceError::InvalidConfig(format!("base_url is not a valid url: {e}")))?;
        CrawlConfig::resolve(&self.config, None)
            .map_err(|e| ServiceError::InvalidConfig(e.to_string()))?;
        if let Some(expr) = &self.default_cron {
            cron::parse(expr).map_err(|e| ServiceError::InvalidCron(e.to_string()))?;
        }
        Ok(())
    }
}

/// One immutable config version. `version` is monotonic per website,
/// starting at 1.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct WebsiteConfigHistory {
    pub id: Uuid,
    pub website_id: WebsiteId,
    pub version: i32,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl WebsiteConfigHistory {
    pub fn new(website_id: WebsiteId, version: i32, config: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            website_id,
            version,
            config,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_config() -> serde_json::Value {
        json!({"steps": [{"kind": "crawl_list", "selectors": {"link": "a"}}]})
    }

    #[test]
    fn valid_website_passes_validation() {
        let website = Website::builder()
            .name("news-site")
            .base_url("https://news.example.test/")
            .config(valid_config())
            .default_cron("0 0 1,15 * *")
            .build();
        assert!(website.validate().is_ok());
        assert!(!website.is_deleted());
    }

    #[test]
    fn empty_name_is_rejected() {
        let website = Website::builder()
            .name("  ")
            .base_url("https://example.test/")
            .config(valid_config())
            .build();
        assert!(website.validate().is_err());
    }

    #[test]
    fn invalid_config_document_is_rejected() {
        let website = Website::builder()
            .name("broken")
            .base_url("https://example.test/")
            .config(json!({"steps": [{"kind": "nope"}]}))
            .build();
        assert!(website.validate().is_err());
    }

    #[test]
    fn invalid_cron_is_rejected() {
        let website = Website::builder()
            .name("cron-broken")
            .base_url("https://example.test/")
            .config(valid_config())
            .default_cron("every fortnight")
            .build();
        assert!(matches!(
            website.validate(),
            Err(ServiceError::InvalidCron(_))
        ));
    }
}
