//! Environment-driven configuration for the `crawld` binary.

use std::time::Duration;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub nats_url: String,
    pub blob_root: String,
    pub worker_concurrency: usize,
    pub browser_pool_size: usize,
    pub browser_contexts_per_instance: usize,
    pub browser_enabled: bool,
    pub log_retention_days: i64,
    pub request_timeout: Duration,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is required")?;
        let nats_url =
            std::env::var("NATS_URL").unwrap_or_else(|_| "nats://127.0.0.1:4222".to_string());
        let blob_root = std::env::var("BLOB_ROOT").unwrap_or_else(|_| "./blobs".to_string());

        let browser_pool_size = env_or("BROWSER_POOL_SIZE", 5usize);
        let browser_contexts_per_instance = env_or("BROWSER_CONTEXTS_PER_INSTANCE", 10usize);
        let worker_concurrency = env_or(
            "WORKER_CONCURRENCY",
            browser_pool_size * browser_contexts_per_instance,
        );

        Ok(Self {
            database_url,
            nats_url,
            blob_root,
            worker_concurrency,
            browser_pool_size,
            browser_contexts_per_instance,
            browser_enabled: env_or("BROWSER_ENABLED", true),
            log_retention_days: env_or("LOG_RETENTION_DAYS", 90i64),
            request_timeout: Duration::from_secs(env_or("REQUEST_TIMEOUT_SECS", 30u64)),
        })
    }
}
