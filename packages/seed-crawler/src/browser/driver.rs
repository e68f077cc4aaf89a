//! Browser driver seam and the chromiumoxide implementation.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;

use crate::error::CrawlError;
use crate::fetch::FetchedPage;

/// Launches browser instances.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn BrowserInstance>, CrawlError>;
}

/// One running browser.
#[async_trait]
pub trait BrowserInstance: Send + Sync {
    async fn new_context(&self) -> Result<Box<dyn BrowserContext>, CrawlError>;

    /// Cheap liveness probe used by the pool health loop.
    async fn ping(&self) -> Result<(), CrawlError>;

    async fn close(self: Box<Self>);
}

/// One isolated browsing context (a tab with its own lifecycle).
#[async_trait]
pub trait BrowserContext: Send + Sync {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<FetchedPage, CrawlError>;

    /// Return the context to a blank state between borrowers.
    async fn reset(&self) -> Result<(), CrawlError>;

    async fn close(self: Box<Self>);
}

fn crash(stage: &str, e: impl std::fmt::Display) -> CrawlError {
    CrawlError::BrowserCrash(format!("{stage}: {e}"))
}

/// chromiumoxide-backed driver.
pub struct ChromiumDriver {
    headless: bool,
    executable: Option<PathBuf>,
    request_timeout: Duration,
}

impl ChromiumDriver {
    pub fn new() -> Self {
        Self {
            headless: true,
            executable: None,
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_head(mut self) -> Self {
        self.headless = false;
        self
    }

    pub fn with_executable(mut self, path: PathBuf) -> Self {
        self.executable = Some(path);
        self
    }
}

impl Default for ChromiumDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    async fn launch(&self) -> Result<Box<dyn BrowserInstance>, CrawlError> {
        let mut builder = BrowserConfig::builder()
            .request_timeout(self.request_timeout)
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-background-networking")
            .arg("--mute-audio");
        if let Some(path) = &self.executable {
            builder = builder.chrome_executable(path);
        }
        if !self.headless {
            builder = builder.with_head();
        }
        let config = builder
            .build()
            .map_err(|e| crash("browser config", e))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| crash("browser launch", e))?;

        // The handler stream must be drained for the CDP connection to make
        // progress; benign deserialization noise is dropped at trace level.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::trace!(error = %e, "browser handler event error");
                }
            }
        });

        Ok(Box::new(ChromiumInstance {
            browser,
            handler_task,
        }))
    }
}

struct ChromiumInstance {
    browser: Browser,
    handler_task: JoinHandle<()>,
}

#[async_trait]
impl BrowserInstance for ChromiumInstance {
    async fn new_context(&self) -> Result<Box<dyn BrowserContext>, CrawlError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| crash("new context", e))?;
        Ok(Box::new(ChromiumContext { page }))
    }

    async fn ping(&self) -> Result<(), CrawlError> {
        self.browser
            .version()
            .await
            .map(|_| ())
            .map_err(|e| crash("ping", e))
    }

    async fn close(mut self: Box<Self>) {
        if let Err(e) = self.browser.close().await {
            tracing::warn!(error = %e, "browser close failed");
        }
        let _ = self.browser.wait().await;
        self.handler_task.abort();
    }
}

struct ChromiumContext {
    page: Page,
}

#[async_trait]
impl BrowserContext for ChromiumContext {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<FetchedPage, CrawlError> {
        let result = tokio::time::timeout(timeout, async {
            self.page
                .goto(url)
                .await
                .map_err(|e| CrawlError::Network {
                    url: url.to_string(),
                    message: e.to_string(),
                })?;
            self.page
                .wait_for_navigation()
                .await
                .map_err(|e| crash("wait for navigation", e))?;
            let body = self
                .page
                .content()
                .await
                .map_err(|e| crash("page content", e))?;
            let final_url = self
                .page
                .url()
                .await
                .ok()
                .flatten()
                .unwrap_or_else(|| url.to_string());
            // CDP navigation does not surface the HTTP status; a page that
            // rendered is treated as 200.
            Ok(FetchedPage {
                status: 200,
                final_url,
                body,
                retry_after: None,
            })
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(CrawlError::Timeout {
                url: url.to_string(),
            }),
        }
    }

    async fn reset(&self) -> Result<(), CrawlError> {
        self.page
            .goto("about:blank")
            .await
            .map(|_| ())
            .map_err(|e| crash("context reset", e))
    }

    async fn close(self: Box<Self>) {
        if let Err(e) = self.page.clone().close().await {
            tracing::debug!(error = %e, "context close failed");
        }
    }
}
