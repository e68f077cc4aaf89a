//! Website template management. Owns template rows and their config
//! history; the scheduler and crawler only read them.

use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use seed_crawler::types::WebsiteId;

use super::store::WebsiteStore;
use super::website::{Website, WebsiteConfigHistory, WebsiteStatus};
use crate::common::Clock;
use crate::domains::schedules::{cron, ScheduleStore, ScheduledJob};
use crate::jobs::service::ServiceError;

#[derive(Debug, Clone)]
pub struct CreateWebsite {
    pub name: String,
    pub base_url: String,
    pub config: Value,
    pub default_cron: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateWebsite {
    pub name: Option<String>,
    pub base_url: Option<String>,
    pub config: Option<Value>,
    pub default_cron: Option<Option<String>>,
}

pub struct WebsiteService {
    websites: Arc<dyn WebsiteStore>,
    schedules: Arc<dyn ScheduleStore>,
    clock: Arc<dyn Clock>,
}

impl WebsiteService {
    pub fn new(
        websites: Arc<dyn WebsiteStore>,
        schedules: Arc<dyn ScheduleStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            websites,
            schedules,
            clock,
        }
    }

    /// Register a template. Writes config history version 1 and, when a
    /// default cron is present, the scheduled entry that drives it.
    pub async fn create(&self, request: CreateWebsite) -> Result<Website, ServiceError> {
        let website = Website::builder()
            .name(request.name)
            .base_url(request.base_url)
            .config(request.config)
            .default_cron(request.default_cron.unwrap_or_else(|| cron::DEFAULT_CRON.to_string()))
            .build();
        website.validate()?;

        if self.websites.find_by_name(&website.name).await?.is_some() {
            return Err(ServiceError::InvalidConfig(format!(
                "website name '{}' is already in use",
                website.name
            )));
        }

        let website = self.websites.insert(&website).await?;
        self.websites
            .add_history(&WebsiteConfigHistory::new(
                website.id,
                1,
                website.config.clone(),
            ))
            .await?;

        if let Some(expr) = &website.default_cron {
            let entry = ScheduledJob::builder()
                .website_id(website.id)
                .cron_expression(expr.clone())
                .build();
            let next = entry.next_fire_after(self.clock.now())?;
            let mut entry = entry;
            entry.next_run_time = next;
            self.schedules.insert(&entry).await?;
        }

        info!(website_id = %website.id, name = %website.name, "website registered");
        Ok(website)
    }

    pub async fn get(&self, id: WebsiteId) -> Result<Website, ServiceError> {
        self.websites.get(id).await?.ok_or(ServiceError::NotFound)
    }

    /// Apply a partial update. A config change writes the next history
    /// version; history is never rewritten.
    pub async fn update(
        &self,
        id: WebsiteId,
        request: UpdateWebsite,
    ) -> Result<Website, ServiceError> {
        let mut website = self.get(id).await?;
        if website.is_deleted() {
            return Err(ServiceError::NotFound);
        }

        if let Some(name) = request.name {
            if name != website.name {
                if self.websites.find_by_name(&name).await?.is_some() {
                    return Err(ServiceError::InvalidConfig(format!(
                        "website name '{name}' is already in use"
                    )));
                }
                website.name = name;
            }
        }
        if let Some(base_url) = request.base_url {
            website.base_url = base_url;
        }
        let config_changed = match request.config {
            Some(config) => {
                let changed = config != website.config;
                website.config = config;
                changed
            }
            None => false,
        };
        if let Some(default_cron) = request.default_cron {
            website.default_cron = default_cron;
        }
        website.validate()?;

        let website = self.websites.update(&website).await?;
        if config_changed {
            let version = self.websites.latest_version(id).await? + 1;
            self.websites
                .add_history(&WebsiteConfigHistory::new(
                    id,
                    version,
                    website.config.clone(),
                ))
                .await?;
        }
        Ok(website)
    }

    /// Soft delete. Scheduled entries deactivate; running jobs keep their
    /// loaded config.
    pub async fn delete(&self, id: WebsiteId) -> Result<(), ServiceError> {
        let deleted = self.websites.soft_delete(id, self.clock.now()).await?;
        if !deleted {
            return Err(ServiceError::NotFound);
        }
        self.schedules.set_active_for_website(id, false).await?;
        info!(website_id = %id, "website soft-deleted");
        Ok(())
    }

    /// Pause scheduling for a template without losing history.
    pub async fn pause(&self, id: WebsiteId) -> Result<(), ServiceError> {
        if !self
            .websites
            .set_status(id, WebsiteStatus::Inactive)
            .await?
        {
            return Err(ServiceError::NotFound);
        }
        self.schedules.set_active_for_website(id, false).await?;
        Ok(())
    }

    pub async fn resume(&self, id: WebsiteId) -> Result<(), ServiceError> {
        if !self.websites.set_status(id, WebsiteStatus::Active).await? {
            return Err(ServiceError::NotFound);
        }
        self.schedules.set_active_for_website(id, true).await?;
        Ok(())
    }

    pub async fn history(&self, id: WebsiteId) -> Result<Vec<WebsiteConfigHistory>, ServiceError> {
        Ok(self.websites.list_history(id).await?)
    }

    /// Copy a historical config forward as the newest version.
    pub async fn rollback(&self, id: WebsiteId, version: i32) -> Result<Website, ServiceError> {
        let row = self
            .websites
            .history_version(id, version)
            .await?
            .ok_or(ServiceError::NotFound)?;
        self.update(
            id,
            UpdateWebsite {
                config: Some(row.config),
                ..Default::default()
            },
        )
        .await
    }
}
