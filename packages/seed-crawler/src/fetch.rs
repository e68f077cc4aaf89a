//! Page fetching.
//!
//! The pipeline fetches through the [`Fetcher`] trait so tests can serve
//! fixtures. Production wiring uses [`CrawlFetcher`]: plain HTTP and API
//! requests go through reqwest, browser steps draw a context from the
//! pool.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::browser::BrowserPool;
use crate::config::FetchMethod;
use crate::error::CrawlError;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A fetched page, successful or not. Transport failures are errors;
/// HTTP error statuses are data until the caller classifies them.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: u16,
    pub final_url: String,
    pub body: String,
    pub retry_after: Option<u64>,
}

impl FetchedPage {
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Convert a non-2xx response into the matching error.
    pub fn error_for_status(&self) -> Result<(), CrawlError> {
        if self.ok() {
            return Ok(());
        }
        Err(CrawlError::HttpStatus {
            status: self.status,
            url: self.final_url.clone(),
            retry_after: self.retry_after,
        })
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, method: FetchMethod) -> Result<FetchedPage, CrawlError>;
}

/// reqwest-backed fetcher for the `http` and `api` methods.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, CrawlError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CrawlError::ResourceUnavailable(format!("http client: {e}")))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn get(&self, url: &str, accept_json: bool) -> Result<FetchedPage, CrawlError> {
        let mut request = self.client.get(url);
        if accept_json {
            request = request.header(reqwest::header::ACCEPT, "application/json");
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                CrawlError::Timeout {
                    url: url.to_string(),
                }
            } else {
                CrawlError::Network {
                    url: url.to_string(),
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let body = response.text().await.map_err(|e| CrawlError::Network {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        Ok(FetchedPage {
            status,
            final_url,
            body,
            retry_after,
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, method: FetchMethod) -> Result<FetchedPage, CrawlError> {
        match method {
            FetchMethod::Http => self.get(url, false).await,
            FetchMethod::Api => self.get(url, true).await,
            FetchMethod::Browser => Err(CrawlError::ResourceUnavailable(
                "browser fetch requested but no browser pool is wired".to_string(),
            )),
        }
    }
}

/// Production fetcher: HTTP/API via reqwest, `browser` steps via the pool.
///
/// Without a pool, browser steps degrade to plain HTTP with a warning so
/// templates keep working on pool-less deployments.
pub struct CrawlFetcher {
    http: HttpFetcher,
    browser_pool: Option<Arc<BrowserPool>>,
    acquire_timeout: Duration,
    page_timeout: Duration,
}

impl CrawlFetcher {
    pub fn new(http: HttpFetcher, browser_pool: Option<Arc<BrowserPool>>) -> Self {
        Self {
            http,
            browser_pool,
            acquire_timeout: Duration::from_secs(300),
            page_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, acquire_timeout: Duration, page_timeout: Duration) -> Self {
        self.acquire_timeout = acquire_timeout;
        self.page_timeout = page_timeout;
        self
    }
}

#[async_trait]
impl Fetcher for CrawlFetcher {
    async fn fetch(&self, url: &str, method: FetchMethod) -> Result<FetchedPage, CrawlError> {
        match method {
            FetchMethod::Http | FetchMethod::Api => self.http.fetch(url, method).await,
            FetchMethod::Browser => match &self.browser_pool {
                Some(pool) => {
                    let handle = pool.acquire_context(self.acquire_timeout).await?;
                    let result = handle.navigate(url, self.page_timeout).await;
                    handle.release().await;
                    result
                }
                None => {
                    tracing::warn!(url = %url, "browser step without a pool, falling back to http");
                    self.http.fetch(url, FetchMethod::Http).await
                }
            },
        }
    }
}
