//! Bounded pool of browser instances with bounded contexts.
//!
//! Invariants: at most `P` browsers, at most `C` contexts per browser,
//! total in-flight contexts ≤ `P·C` enforced by a counting semaphore.
//! Waiters queue FIFO (tokio's semaphore is fair); acquisition past the
//! timeout returns `AcquireTimeout`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::driver::{BrowserContext, BrowserDriver, BrowserInstance};
use crate::error::CrawlError;
use crate::fetch::FetchedPage;
use crate::traits::KvCache;

#[derive(Debug, Clone)]
pub struct BrowserPoolConfig {
    /// Maximum browser instances (`P`).
    pub max_browsers: usize,
    /// Maximum contexts per browser (`C`).
    pub max_contexts_per_browser: usize,
    pub acquire_timeout: Duration,
    pub health_interval: Duration,
    /// How long shutdown waits for contexts to drain before force-closing.
    pub shutdown_grace: Duration,
}

impl Default for BrowserPoolConfig {
    fn default() -> Self {
        Self {
            max_browsers: 5,
            max_contexts_per_browser: 10,
            acquire_timeout: Duration::from_secs(300),
            health_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(300),
        }
    }
}

/// Snapshot published to `browser:pool:status` on each health tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatus {
    pub active_browsers: usize,
    pub contexts_in_use: usize,
    pub contexts_available: usize,
}

struct PooledBrowser {
    instance: Box<dyn BrowserInstance>,
    active_contexts: usize,
    healthy: bool,
}

pub struct BrowserPool {
    driver: Arc<dyn BrowserDriver>,
    config: BrowserPoolConfig,
    semaphore: Arc<Semaphore>,
    browsers: Mutex<Vec<PooledBrowser>>,
    shutting_down: AtomicBool,
}

impl BrowserPool {
    pub fn new(driver: Arc<dyn BrowserDriver>, config: BrowserPoolConfig) -> Arc<Self> {
        let permits = config.max_browsers * config.max_contexts_per_browser;
        Arc::new(Self {
            driver,
            config,
            semaphore: Arc::new(Semaphore::new(permits)),
            browsers: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Pre-warm every browser slot. Individual launch failures are logged;
    /// the pool starts as long as at least one browser came up.
    pub async fn start(self: &Arc<Self>) -> Result<(), CrawlError> {
        let mut browsers = self.browsers.lock().await;
        for i in 0..self.config.max_browsers {
            match self.driver.launch().await {
                Ok(instance) => browsers.push(PooledBrowser {
                    instance,
                    active_contexts: 0,
                    healthy: true,
                }),
                Err(e) => warn!(slot = i, error = %e, "browser launch failed during pool start"),
            }
        }
        if browsers.is_empty() {
            return Err(CrawlError::ResourceUnavailable(
                "no browser instance could be launched".to_string(),
            ));
        }
        info!(browsers = browsers.len(), "browser pool started");
        Ok(())
    }

    /// Acquire with the configured default timeout.
    pub async fn acquire(self: &Arc<Self>) -> Result<ContextHandle, CrawlError> {
        self.acquire_context(self.config.acquire_timeout).await
    }

    /// Acquire a context, waiting FIFO behind other borrowers.
    pub async fn acquire_context(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Result<ContextHandle, CrawlError> {
        if self.shutting_down.load(Ordering::Relaxed) {
            return Err(CrawlError::ResourceUnavailable(
                "browser pool is shutting down".to_string(),
            ));
        }

        let permit = match tokio::time::timeout(
            timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        {
            Err(_) => return Err(CrawlError::AcquireTimeout),
            Ok(Err(_)) => {
                return Err(CrawlError::ResourceUnavailable(
                    "browser pool is shutting down".to_string(),
                ))
            }
            Ok(Ok(permit)) => permit,
        };

        let mut browsers = self.browsers.lock().await;

        // Fewest active contexts wins, ties broken by index.
        let mut picked: Option<usize> = None;
        for (i, b) in browsers.iter().enumerate() {
            if !b.healthy || b.active_contexts >= self.config.max_contexts_per_browser {
                continue;
            }
            match picked {
                Some(j) if browsers[j].active_contexts <= b.active_contexts => {}
                _ => picked = Some(i),
            }
        }

        let index = match picked {
            Some(i) => i,
            None if browsers.len() < self.config.max_browsers => {
                let instance = self.driver.launch().await?;
                browsers.push(PooledBrowser {
                    instance,
                    active_contexts: 0,
                    healthy: true,
                });
                browsers.len() - 1
            }
            None => {
                return Err(CrawlError::ResourceUnavailable(
                    "no healthy browser with free context slots".to_string(),
                ))
            }
        };

        let context = browsers[index].instance.new_context().await?;
        browsers[index].active_contexts += 1;
        debug!(
            browser = index,
            active = browsers[index].active_contexts,
            "context acquired"
        );

        Ok(ContextHandle {
            context: Some(context),
            browser_index: index,
            pool: Arc::clone(self),
            _permit: Some(permit),
        })
    }

    async fn release_slot(&self, browser_index: usize) {
        let mut browsers = self.browsers.lock().await;
        if let Some(b) = browsers.get_mut(browser_index) {
            b.active_contexts = b.active_contexts.saturating_sub(1);
        }
    }

    /// Current pool occupancy.
    pub async fn status(&self) -> PoolStatus {
        let browsers = self.browsers.lock().await;
        let in_use: usize = browsers.iter().map(|b| b.active_contexts).sum();
        let capacity = self.config.max_browsers * self.config.max_contexts_per_browser;
        PoolStatus {
            active_browsers: browsers.iter().filter(|b| b.healthy).count(),
            contexts_in_use: in_use,
            contexts_available: capacity.saturating_sub(in_use),
        }
    }

    /// One health pass: ping every browser, mark failures unhealthy, and
    /// restart unhealthy browsers that have drained.
    pub async fn health_check(&self) {
        let mut browsers = self.browsers.lock().await;
        for (i, b) in browsers.iter_mut().enumerate() {
            if b.healthy {
                if let Err(e) = b.instance.ping().await {
                    warn!(browser = i, error = %e, "browser failed health check");
                    b.healthy = false;
                }
            } else if b.active_contexts == 0 {
                // Drained: replace the instance.
                match self.driver.launch().await {
                    Ok(instance) => {
                        let old = std::mem::replace(
                            b,
                            PooledBrowser {
                                instance,
                                active_contexts: 0,
                                healthy: true,
                            },
                        );
                        old.instance.close().await;
                        info!(browser = i, "unhealthy browser restarted");
                    }
                    Err(e) => warn!(browser = i, error = %e, "browser restart failed"),
                }
            }
        }
    }

    /// Background health loop. Publishes the pool snapshot to the cache
    /// when one is provided.
    pub async fn run_health_loop(
        self: Arc<Self>,
        cache: Option<Arc<dyn KvCache>>,
        shutdown: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(self.config.health_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.health_check().await;
                    if let Some(cache) = &cache {
                        let status = self.status().await;
                        let snapshot = json!(status);
                        if let Err(e) = cache
                            .set("browser:pool:status", snapshot, Duration::from_secs(300))
                            .await
                        {
                            warn!(error = %e, "failed to publish pool status");
                        }
                    }
                }
            }
        }
    }

    /// Stop accepting, wait up to the grace period for contexts to drain,
    /// then close everything.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        self.semaphore.close();

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        loop {
            let in_use: usize = {
                let browsers = self.browsers.lock().await;
                browsers.iter().map(|b| b.active_contexts).sum()
            };
            if in_use == 0 || tokio::time::Instant::now() >= deadline {
                if in_use > 0 {
                    warn!(contexts = in_use, "force-closing browsers with live contexts");
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let mut browsers = self.browsers.lock().await;
        for b in browsers.drain(..) {
            b.instance.close().await;
        }
        info!("browser pool shut down");
    }
}

/// A borrowed context. Call [`ContextHandle::release`] to clean the
/// context and return the slot; dropping without release still returns the
/// slot but skips cleanup.
pub struct ContextHandle {
    context: Option<Box<dyn BrowserContext>>,
    browser_index: usize,
    pool: Arc<BrowserPool>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl std::fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextHandle")
            .field("browser_index", &self.browser_index)
            .finish()
    }
}

impl ContextHandle {
    pub async fn navigate(&self, url: &str, timeout: Duration) -> Result<FetchedPage, CrawlError> {
        match &self.context {
            Some(context) => context.navigate(url, timeout).await,
            None => Err(CrawlError::ResourceUnavailable(
                "context already released".to_string(),
            )),
        }
    }

    /// Clean the context and return its slot. Cleanup errors are logged
    /// and never block the release.
    pub async fn release(mut self) {
        if let Some(context) = self.context.take() {
            if let Err(e) = context.reset().await {
                warn!(error = %e, "context reset failed during release");
            }
            context.close().await;
            self.pool.release_slot(self.browser_index).await;
        }
        // The permit drops with self, waking the next FIFO waiter.
    }
}

impl Drop for ContextHandle {
    fn drop(&mut self) {
        if self.context.take().is_some() {
            let pool = Arc::clone(&self.pool);
            let index = self.browser_index;
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    pool.release_slot(index).await;
                });
            }
        }
    }
}
