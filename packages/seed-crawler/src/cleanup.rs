//! Deadline-bounded resource cleanup.
//!
//! On cancellation or terminal failure the pipeline walks its registered
//! resources, giving each a slice of the deadline to close gracefully and
//! force-closing the stragglers. The coordinator is idempotent: only the
//! first call does work.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::warn;

pub const DEFAULT_CLEANUP_DEADLINE: Duration = Duration::from_secs(5);

/// A resource the pipeline must shut down before reporting terminal state.
#[async_trait]
pub trait ManagedResource: Send + Sync {
    fn name(&self) -> &str;

    /// Attempt an orderly close within the given slice of the deadline.
    async fn close_gracefully(&self, deadline: Duration) -> anyhow::Result<()>;

    /// Last resort; must not block.
    async fn force_close(&self);
}

/// Result of one cleanup run.
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub started_at: Option<DateTime<Utc>>,
    pub graceful: Vec<String>,
    pub forced: Vec<String>,
}

pub struct CleanupCoordinator {
    resources: Mutex<Vec<Arc<dyn ManagedResource>>>,
    report: Mutex<Option<CleanupReport>>,
}

impl CleanupCoordinator {
    pub fn new() -> Self {
        Self {
            resources: Mutex::new(Vec::new()),
            report: Mutex::new(None),
        }
    }

    pub async fn register(&self, resource: Arc<dyn ManagedResource>) {
        self.resources.lock().await.push(resource);
    }

    /// Run cleanup once. Subsequent calls return the first run's report.
    pub async fn cleanup(&self, deadline: Duration) -> CleanupReport {
        {
            let report = self.report.lock().await;
            if let Some(done) = report.as_ref() {
                return done.clone();
            }
        }

        let resources: Vec<Arc<dyn ManagedResource>> =
            self.resources.lock().await.drain(..).collect();

        let mut report = CleanupReport {
            started_at: Some(Utc::now()),
            ..Default::default()
        };

        if !resources.is_empty() {
            // Each resource gets an equal slice of the deadline; a stuck
            // resource cannot starve the ones behind it.
            let share = deadline / resources.len() as u32;
            for resource in resources {
                let name = resource.name().to_string();
                let outcome =
                    tokio::time::timeout(share, resource.close_gracefully(share)).await;
                match outcome {
                    Ok(Ok(())) => report.graceful.push(name),
                    Ok(Err(e)) => {
                        warn!(resource = %name, error = %e, "graceful close failed, forcing");
                        resource.force_close().await;
                        report.forced.push(name);
                    }
                    Err(_) => {
                        warn!(resource = %name, "graceful close timed out, forcing");
                        resource.force_close().await;
                        report.forced.push(name);
                    }
                }
            }
        }

        *self.report.lock().await = Some(report.clone());
        report
    }
}

impl Default for CleanupCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
