//! Composition root: every service dependency behind one struct.
//!
//! The kernel owns no behavior; it wires stores, queue, cache, and the
//! log hub together so the binary (and tests) can build services from one
//! place instead of threading a dozen `Arc`s around.

pub mod log_stream;
pub mod queue;

use std::sync::Arc;

use seed_crawler::traits::{BlobStore, KvCache, RetrySink};

use crate::common::Clock;
use crate::domains::logs::CrawlLogStore;
use crate::domains::retries::DlqStore;
use crate::domains::schedules::ScheduleStore;
use crate::domains::websites::WebsiteStore;
use crate::jobs::service::JobService;
use crate::jobs::store::JobStore;
use log_stream::{LogHub, LogStream};
use queue::WorkQueue;

/// Shared infrastructure + repositories.
pub struct Kernel {
    pub queue: Arc<dyn WorkQueue>,
    pub cache: Arc<dyn KvCache>,
    pub blobs: Arc<dyn BlobStore>,
    pub clock: Arc<dyn Clock>,
    pub hub: Arc<LogHub>,

    pub jobs: Arc<dyn JobStore>,
    pub websites: Arc<dyn WebsiteStore>,
    pub schedules: Arc<dyn ScheduleStore>,
    pub dlq: Arc<dyn DlqStore>,
    pub retries: Arc<dyn RetrySink>,
    pub logs: Arc<dyn CrawlLogStore>,
}

impl Kernel {
    /// The job orchestration service over this kernel's stores.
    pub fn job_service(&self) -> Arc<JobService> {
        Arc::new(JobService::new(
            Arc::clone(&self.jobs),
            Arc::clone(&self.queue),
            Arc::clone(&self.cache),
            Arc::clone(&self.schedules),
            Arc::clone(&self.dlq),
            Arc::clone(&self.clock),
            Arc::clone(&self.hub),
        ))
    }

    /// The persistent log recorder + live fan-out.
    pub fn log_stream(&self) -> Arc<LogStream> {
        Arc::new(LogStream::new(
            Arc::clone(&self.logs),
            Arc::clone(&self.hub),
        ))
    }
}
