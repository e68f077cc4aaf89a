//! Per-job log recording and live fan-out.
//!
//! `LogHub` is a topic-keyed broadcast layer: one channel per job,
//! bounded buffers, slow subscribers lag and drop the oldest events
//! rather than blocking writers. `LogStream` ties the hub to the
//! persistent log store and is what the pipeline writes through.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};

use seed_crawler::traits::JobLogger;
use seed_crawler::types::{JobId, LogEntry};

use crate::domains::logs::{CrawlLog, CrawlLogStore};
use crate::jobs::job::JobStatus;

/// Everything a subscriber can receive for a job.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEvent {
    Log(CrawlLog),
    StatusChange {
        job_id: JobId,
        from: Option<JobStatus>,
        to: JobStatus,
        at: DateTime<Utc>,
    },
    Progress {
        job_id: JobId,
        progress: serde_json::Value,
    },
}

/// In-process fan-out hub, one broadcast channel per job.
pub struct LogHub {
    channels: RwLock<HashMap<JobId, broadcast::Sender<LogEvent>>>,
    capacity: usize,
}

impl LogHub {
    /// Default per-subscriber buffer of 256 events.
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Publish to a job's subscribers. No-op when nobody listens.
    pub async fn publish(&self, job_id: JobId, event: LogEvent) {
        let channels = self.channels.read().await;
        if let Some(tx) = channels.get(&job_id) {
            let _ = tx.send(event);
        }
    }

    /// Subscribe to a job's live events, creating the channel on demand.
    pub async fn subscribe(&self, job_id: JobId) -> broadcast::Receiver<LogEvent> {
        let mut channels = self.channels.write().await;
        let tx = channels
            .entry(job_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        tx.subscribe()
    }

    /// Drop channels with no remaining subscribers.
    pub async fn cleanup(&self) {
        let mut channels = self.channels.write().await;
        channels.retain(|_, tx| tx.receiver_count() > 0);
    }
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Persistent log recorder + live fan-out, the pipeline's [`JobLogger`].
pub struct LogStream {
    store: Arc<dyn CrawlLogStore>,
    hub: Arc<LogHub>,
}

impl LogStream {
    pub fn new(store: Arc<dyn CrawlLogStore>, hub: Arc<LogHub>) -> Self {
        Self { store, hub }
    }

    pub fn hub(&self) -> Arc<LogHub> {
        Arc::clone(&self.hub)
    }

    /// Live events for a job as a `Stream`, for SSE-style consumers.
    /// Lagged subscribers drop the oldest events.
    pub async fn subscribe(
        &self,
        job_id: JobId,
    ) -> tokio_stream::wrappers::BroadcastStream<LogEvent> {
        tokio_stream::wrappers::BroadcastStream::new(self.hub.subscribe(job_id).await)
    }

    /// Stored logs for a job, oldest first.
    pub async fn replay(
        &self,
        job_id: JobId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<CrawlLog>> {
        self.store.replay(job_id, since).await
    }
}

#[async_trait]
impl JobLogger for LogStream {
    async fn log(&self, entry: LogEntry) -> Result<()> {
        let log = CrawlLog::from(entry);
        self.store.append(&log).await?;
        self.hub.publish(log.job_id, LogEvent::Log(log)).await;
        Ok(())
    }
}
