// Crawl control-plane daemon: scheduler + worker + browser pool.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use seed_crawler::browser::{BrowserPool, BrowserPoolConfig, ChromiumDriver};
use seed_crawler::cache::MemoryKvCache;
use seed_crawler::crawler::SeedUrlCrawler;
use seed_crawler::fetch::{CrawlFetcher, HttpFetcher};
use seed_crawler::storage::{FsBlobStore, PostgresCrawlStore};

use server_core::common::SystemClock;
use server_core::domains::logs::PostgresCrawlLogStore;
use server_core::domains::retries::{PostgresDlqStore, PostgresRetryStore};
use server_core::domains::schedules::{PostgresScheduleStore, Scheduler, SchedulerConfig};
use server_core::domains::websites::PostgresWebsiteStore;
use server_core::jobs::store::PostgresJobStore;
use server_core::jobs::{CrawlWorker, WorkerConfig};
use server_core::kernel::log_stream::LogHub;
use server_core::kernel::queue::{JetStreamQueueConfig, JetStreamWorkQueue};
use server_core::{Kernel, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug,seed_crawler=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let settings = Settings::from_env().context("failed to load settings")?;
    tracing::info!("starting crawld");

    // Database
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&settings.database_url)
        .await
        .context("failed to connect to postgres")?;
    tracing::info!("postgres connected");

    // Queue
    let nats = async_nats::connect(&settings.nats_url)
        .await
        .context("failed to connect to nats")?;
    let queue = Arc::new(
        JetStreamWorkQueue::connect(nats, JetStreamQueueConfig::default())
            .await
            .context("failed to set up the task stream")?,
    );
    tracing::info!("task stream ready");

    // Shared infrastructure
    let cache = Arc::new(MemoryKvCache::new());
    let blobs = Arc::new(FsBlobStore::new(settings.blob_root.clone()));
    let hub = Arc::new(LogHub::new());
    let crawl_store = Arc::new(PostgresCrawlStore::new(pool.clone()));
    let log_store = Arc::new(PostgresCrawlLogStore::new(pool.clone()));
    let retry_store = Arc::new(PostgresRetryStore::new(pool.clone()));

    let kernel = Kernel {
        queue: queue.clone(),
        cache: cache.clone(),
        blobs: blobs.clone(),
        clock: Arc::new(SystemClock),
        hub: hub.clone(),
        jobs: Arc::new(PostgresJobStore::new(pool.clone())),
        websites: Arc::new(PostgresWebsiteStore::new(pool.clone())),
        schedules: Arc::new(PostgresScheduleStore::new(pool.clone())),
        dlq: Arc::new(PostgresDlqStore::new(pool.clone())),
        retries: retry_store.clone(),
        logs: log_store.clone(),
    };
    let job_service = kernel.job_service();
    let log_stream = kernel.log_stream();

    let shutdown = CancellationToken::new();

    // Browser pool (optional; http-only deployments skip it)
    let browser_pool = if settings.browser_enabled {
        let pool = BrowserPool::new(
            Arc::new(ChromiumDriver::new()),
            BrowserPoolConfig {
                max_browsers: settings.browser_pool_size,
                max_contexts_per_browser: settings.browser_contexts_per_instance,
                ..Default::default()
            },
        );
        match pool.start().await {
            Ok(()) => {
                let status_cache: Arc<dyn seed_crawler::traits::KvCache> = cache.clone();
                tokio::spawn(
                    Arc::clone(&pool).run_health_loop(Some(status_cache), shutdown.clone()),
                );
                Some(pool)
            }
            Err(e) => {
                tracing::warn!(error = %e, "browser pool unavailable, browser steps fall back to http");
                None
            }
        }
    } else {
        None
    };

    // Crawl pipeline
    let fetcher = Arc::new(CrawlFetcher::new(
        HttpFetcher::new(settings.request_timeout)
            .map_err(|e| anyhow::anyhow!("failed to build http client: {e}"))?,
        browser_pool.clone(),
    ));
    let crawler = Arc::new(SeedUrlCrawler::new(
        fetcher,
        crawl_store.clone(),
        crawl_store.clone(),
        cache.clone(),
        blobs,
        log_stream,
        retry_store.clone(),
    ));

    // Scheduler
    let scheduler = Scheduler::new(
        kernel.schedules.clone(),
        kernel.websites.clone(),
        job_service.clone(),
        kernel.clock.clone(),
        SchedulerConfig::default(),
    );
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown.clone()));

    // Worker
    let worker = Arc::new(CrawlWorker::new(
        queue,
        job_service,
        kernel.websites.clone(),
        kernel.schedules.clone(),
        crawler,
        cache,
        retry_store,
        WorkerConfig {
            concurrency: settings.worker_concurrency,
            ..Default::default()
        },
    ));
    let worker_handle = tokio::spawn(worker.run(shutdown.clone()));

    // Log retention: drop monthly partitions past the cutoff, daily.
    let retention_shutdown = shutdown.clone();
    let retention_days = settings.log_retention_days;
    let retention_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(24 * 3600));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = retention_shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match log_store.drop_expired_partitions(retention_days).await {
                        Ok(dropped) if !dropped.is_empty() => {
                            tracing::info!(partitions = ?dropped, "dropped expired log partitions");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "log retention failed"),
                    }
                }
            }
        }
    });

    tracing::info!("crawld running; ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutting down");
    shutdown.cancel();

    let _ = worker_handle.await;
    let _ = scheduler_handle.await;
    let _ = retention_handle.await;
    if let Some(pool) = browser_pool {
        pool.shutdown().await;
    }

    tracing::info!("crawld stopped");
    Ok(())
}
