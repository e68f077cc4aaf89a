use thiserror::Error;

/// Variable-substitution failures. All are validation errors and never
/// retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VariableError {
    #[error("variable not found: ${{{0}}}")]
    NotFound(String),

    #[error("circular variable reference through ${{{0}}}")]
    CircularReference(String),

    #[error("substitution exceeded recursion depth {0}")]
    DepthExceeded(usize),

    #[error("unknown variable namespace: {0}")]
    UnknownNamespace(String),

    #[error("cannot coerce ${{{token}}} into {target}: {value}")]
    Coercion {
        token: String,
        target: &'static str,
        value: String,
    },
}

/// Errors surfaced by the crawl pipeline.
///
/// The retry classifier maps these onto closed error categories; the
/// pipeline itself converts terminal classifications into a `CrawlResult`
/// rather than bubbling them out.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("invalid crawl config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Variable(#[from] VariableError),

    #[error("http {status} fetching {url}")]
    HttpStatus {
        status: u16,
        url: String,
        retry_after: Option<u64>,
    },

    #[error("network error fetching {url}: {message}")]
    Network { url: String, message: String },

    #[error("timed out fetching {url}")]
    Timeout { url: String },

    #[error("browser crashed: {0}")]
    BrowserCrash(String),

    #[error("browser context acquire timed out")]
    AcquireTimeout,

    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("job cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CrawlError {
    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            CrawlError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// `Retry-After` seconds carried by the error, if any.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            CrawlError::HttpStatus { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_error_exposes_status_and_retry_after() {
        let err = CrawlError::HttpStatus {
            status: 429,
            url: "https://example.test/".to_string(),
            retry_after: Some(2),
        };
        assert_eq!(err.status(), Some(429));
        assert_eq!(err.retry_after(), Some(2));
    }

    #[test]
    fn variable_errors_render_the_token() {
        let err = VariableError::NotFound("variables.query".to_string());
        assert!(err.to_string().contains("${variables.query}"));
    }
}
