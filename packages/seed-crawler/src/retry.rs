//! Error classification and retry policy.
//!
//! Every failure inside the pipeline is mapped to a closed `ErrorCategory`;
//! the category's `RetryPolicy` decides whether the work is retried, with
//! what backoff, or routed to the dead-letter queue.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::CrawlError;
use crate::types::JobId;

/// Closed set of failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "error_category", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    RateLimit,
    ServerError,
    BrowserCrash,
    ResourceUnavailable,
    Timeout,
    ClientError,
    AuthError,
    NotFound,
    ValidationError,
    BusinessLogicError,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::BrowserCrash => "browser_crash",
            ErrorCategory::ResourceUnavailable => "resource_unavailable",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::ClientError => "client_error",
            ErrorCategory::AuthError => "auth_error",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::ValidationError => "validation_error",
            ErrorCategory::BusinessLogicError => "business_logic_error",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

/// Shape of the retry delay curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    #[default]
    Exponential,
    Linear,
    Fixed,
}

/// Per-category retry policy.
///
/// Field ranges are clamped on construction: `max_attempts` 0..=10,
/// `initial_delay` 0..=60s, `max_delay` 0..=3600s, `multiplier` 1..=10.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub is_retryable: bool,
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    pub initial_delay_secs: f64,
    pub max_delay_secs: f64,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn new(
        is_retryable: bool,
        max_attempts: u32,
        backoff: BackoffStrategy,
        initial_delay_secs: f64,
        max_delay_secs: f64,
        multiplier: f64,
    ) -> Self {
        Self {
            is_retryable,
            max_attempts: max_attempts.min(10),
            backoff,
            initial_delay_secs: initial_delay_secs.clamp(0.0, 60.0),
            max_delay_secs: max_delay_secs.clamp(0.0, 3600.0),
            multiplier: multiplier.clamp(1.0, 10.0),
        }
    }

    pub fn no_retry() -> Self {
        Self::new(false, 0, BackoffStrategy::Fixed, 0.0, 0.0, 1.0)
    }

    /// Base delay before jitter for the given zero-indexed attempt.
    pub fn base_delay(&self, attempt: u32) -> f64 {
        let raw = match self.backoff {
            BackoffStrategy::Exponential => {
                self.initial_delay_secs * self.multiplier.powi(attempt as i32)
            }
            BackoffStrategy::Linear => self.initial_delay_secs * (attempt as f64 + 1.0),
            BackoffStrategy::Fixed => self.initial_delay_secs,
        };
        raw.min(self.max_delay_secs)
    }

    /// Delay for the given attempt with uniform 0–20 % jitter applied.
    ///
    /// A `Retry-After` hint from the server overrides the computed delay,
    /// clamped to `max_delay`; jitter still applies on top.
    pub fn delay(&self, attempt: u32, retry_after: Option<u64>) -> Duration {
        let base = match retry_after {
            Some(secs) => (secs as f64).min(self.max_delay_secs),
            None => self.base_delay(attempt),
        };
        let jitter = rand::thread_rng().gen_range(0.0..=0.2);
        Duration::from_secs_f64(base * (1.0 + jitter))
    }
}

/// One retry attempt, recorded for the retry-history repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryRecord {
    pub job_id: JobId,
    pub url: Option<String>,
    pub category: ErrorCategory,
    pub attempt: u32,
    pub delay_seconds: f64,
    pub error: String,
}

/// Maps pipeline errors onto categories and policies.
///
/// Per-website policy overrides (from the crawl config) shadow the
/// defaults; anything unclassified falls back to `unknown`, which retries
/// three times with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryClassifier {
    policies: HashMap<ErrorCategory, RetryPolicy>,
}

impl Default for RetryClassifier {
    fn default() -> Self {
        let mut policies = HashMap::new();
        policies.insert(
            ErrorCategory::Network,
            RetryPolicy::new(true, 3, BackoffStrategy::Exponential, 1.0, 60.0, 2.0),
        );
        policies.insert(
            ErrorCategory::RateLimit,
            RetryPolicy::new(true, 5, BackoffStrategy::Exponential, 2.0, 300.0, 2.0),
        );
        policies.insert(
            ErrorCategory::ServerError,
            RetryPolicy::new(true, 3, BackoffStrategy::Exponential, 2.0, 120.0, 2.0),
        );
        policies.insert(
            ErrorCategory::BrowserCrash,
            RetryPolicy::new(true, 2, BackoffStrategy::Fixed, 5.0, 60.0, 1.0),
        );
        policies.insert(
            ErrorCategory::ResourceUnavailable,
            RetryPolicy::new(true, 3, BackoffStrategy::Linear, 2.0, 60.0, 1.0),
        );
        policies.insert(
            ErrorCategory::Timeout,
            RetryPolicy::new(true, 3, BackoffStrategy::Exponential, 1.0, 60.0, 2.0),
        );
        policies.insert(ErrorCategory::ClientError, RetryPolicy::no_retry());
        policies.insert(ErrorCategory::AuthError, RetryPolicy::no_retry());
        policies.insert(ErrorCategory::NotFound, RetryPolicy::no_retry());
        policies.insert(ErrorCategory::ValidationError, RetryPolicy::no_retry());
        policies.insert(ErrorCategory::BusinessLogicError, RetryPolicy::no_retry());
        policies.insert(
            ErrorCategory::Unknown,
            RetryPolicy::new(true, 3, BackoffStrategy::Exponential, 1.0, 60.0, 2.0),
        );
        Self { policies }
    }
}

impl RetryClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply per-website overrides on top of the defaults.
    pub fn with_overrides(mut self, overrides: HashMap<ErrorCategory, RetryPolicy>) -> Self {
        for (category, policy) in overrides {
            self.policies.insert(category, policy);
        }
        self
    }

    /// Category for an HTTP status code.
    pub fn classify_status(status: u16) -> ErrorCategory {
        match status {
            404 => ErrorCategory::NotFound,
            401 | 403 => ErrorCategory::AuthError,
            429 => ErrorCategory::RateLimit,
            408 => ErrorCategory::Timeout,
            500..=599 => ErrorCategory::ServerError,
            400..=499 => ErrorCategory::ClientError,
            _ => ErrorCategory::Unknown,
        }
    }

    /// Category for a pipeline error.
    pub fn classify(&self, error: &CrawlError) -> ErrorCategory {
        match error {
            CrawlError::HttpStatus { status, .. } => Self::classify_status(*status),
            CrawlError::Network { .. } => ErrorCategory::Network,
            CrawlError::Timeout { .. } => ErrorCategory::Timeout,
            CrawlError::BrowserCrash(_) => ErrorCategory::BrowserCrash,
            CrawlError::AcquireTimeout | CrawlError::ResourceUnavailable(_) => {
                ErrorCategory::ResourceUnavailable
            }
            CrawlError::CacheUnavailable(_) | CrawlError::StoreUnavailable(_) => {
                ErrorCategory::ResourceUnavailable
            }
            CrawlError::InvalidConfig(_) | CrawlError::Variable(_) => {
                ErrorCategory::ValidationError
            }
            CrawlError::Cancelled => ErrorCategory::BusinessLogicError,
            CrawlError::Other(_) => ErrorCategory::Unknown,
        }
    }

    /// Policy for a category. Always defined: the map is seeded with every
    /// variant and `unknown` covers the rest.
    pub fn policy(&self, category: ErrorCategory) -> &RetryPolicy {
        self.policies
            .get(&category)
            .unwrap_or_else(|| &self.policies[&ErrorCategory::Unknown])
    }

    /// Whether another attempt should run, given attempts already made.
    pub fn should_retry(&self, category: ErrorCategory, attempts_made: u32) -> bool {
        let policy = self.policy(category);
        policy.is_retryable && attempts_made < policy.max_attempts
    }
}
