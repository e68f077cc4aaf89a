//! Crawl worker: pulls queue deliveries, runs the pipeline, and settles
//! the job row through `JobService`.
//!
//! ```text
//! CrawlWorker
//!     │
//!     ├─► pull deliveries (WorkQueue)
//!     ├─► pending → running compare-and-set (JobService)
//!     ├─► SeedUrlCrawler::crawl
//!     │       ├─ heartbeat: extend the queue lease while running
//!     │       └─ flag poll: cancel the job token when the shared flag is set
//!     └─► complete / retry / dead-letter, then ack
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use seed_crawler::crawler::SeedUrlCrawler;
use seed_crawler::retry::{ErrorCategory, RetryClassifier, RetryRecord};
use seed_crawler::traits::{KvCache, RetrySink};
use seed_crawler::types::{CrawlOutcome, CrawlRequest, CrawlResult};

use crate::domains::schedules::ScheduleStore;
use crate::domains::websites::WebsiteStore;
use crate::jobs::job::{CrawlJob, JobStatus};
use crate::jobs::service::{JobService, ServiceError};
use crate::kernel::queue::{Delivery, WorkQueue};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Concurrent job handlers; sized to the browser pool by default.
    pub concurrency: usize,
    /// Max deliveries leased per pull.
    pub batch_size: usize,
    /// Idle sleep between empty pulls.
    pub poll_interval: Duration,
    /// Server-side wait for a non-empty pull.
    pub pull_wait: Duration,
    /// Shared cancellation flag poll cadence.
    pub flag_poll_interval: Duration,
    /// Queue lease extension cadence.
    pub heartbeat_interval: Duration,
    /// Deliveries beyond this route to the dead-letter queue.
    pub max_deliver: i64,
    pub worker_id: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 50,
            batch_size: 10,
            poll_interval: Duration::from_secs(1),
            pull_wait: Duration::from_secs(1),
            flag_poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(100),
            max_deliver: 3,
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

pub struct CrawlWorker {
    queue: Arc<dyn WorkQueue>,
    service: Arc<JobService>,
    websites: Arc<dyn WebsiteStore>,
    schedules: Arc<dyn ScheduleStore>,
    crawler: Arc<SeedUrlCrawler>,
    cache: Arc<dyn KvCache>,
    retries: Arc<dyn RetrySink>,
    classifier: RetryClassifier,
    config: WorkerConfig,
    semaphore: Arc<Semaphore>,
}

impl CrawlWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        service: Arc<JobService>,
        websites: Arc<dyn WebsiteStore>,
        schedules: Arc<dyn ScheduleStore>,
        crawler: Arc<SeedUrlCrawler>,
        cache: Arc<dyn KvCache>,
        retries: Arc<dyn RetrySink>,
        config: WorkerConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.concurrency));
        Self {
            queue,
            service,
            websites,
            schedules,
            crawler,
            cache,
            retries,
            classifier: RetryClassifier::new(),
            config,
            semaphore,
        }
    }

    /// Main loop: pull and dispatch until shutdown, then drain in-flight
    /// handlers.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            worker_id = %self.config.worker_id,
            concurrency = self.config.concurrency,
            "crawl worker starting"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let slots = self
                .semaphore
                .available_permits()
                .min(self.config.batch_size);
            if slots == 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }

            let deliveries = match self.queue.pull(slots, self.config.pull_wait).await {
                Ok(deliveries) => deliveries,
                Err(e) => {
                    error!(error = %e, "failed to pull from queue");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            if deliveries.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            debug!(count = deliveries.len(), "leased deliveries");
            for delivery in deliveries {
                let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                let worker = Arc::clone(&self);
                let job_shutdown = shutdown.clone();
                tokio::spawn(async move {
                    worker.process_delivery(delivery, &job_shutdown).await;
                    drop(permit);
                });
            }
        }

        // Let in-flight jobs finish; they observe the shutdown token via
        // their child cancellation tokens.
        let _ = self
            .semaphore
            .acquire_many(self.config.concurrency as u32)
            .await;
        info!(worker_id = %self.config.worker_id, "crawl worker stopped");
    }

    /// Pull one batch and process it serially. Test entry point; `run`
    /// wraps this behavior with concurrency.
    pub async fn drain_once(&self, shutdown: &CancellationToken) -> usize {
        let deliveries = match self
            .queue
            .pull(self.config.batch_size, self.config.pull_wait)
            .await
        {
            Ok(deliveries) => deliveries,
            Err(e) => {
                error!(error = %e, "failed to pull from queue");
                return 0;
            }
        };
        let count = deliveries.len();
        for delivery in deliveries {
            self.process_delivery(delivery, shutdown).await;
        }
        count
    }

    async fn ack(&self, delivery: Delivery) {
        if let Err(e) = self.queue.ack(delivery).await {
            warn!(error = %e, "failed to ack delivery");
        }
    }

    async fn nak(&self, delivery: Delivery, retry_after: Option<Duration>) {
        if let Err(e) = self.queue.nak(delivery, retry_after).await {
            warn!(error = %e, "failed to nak delivery");
        }
    }

    pub async fn process_delivery(&self, delivery: Delivery, shutdown: &CancellationToken) {
        let job_id = delivery.job_id;

        let job = match self.service.get(job_id).await {
            Ok(job) => job,
            Err(ServiceError::NotFound) => {
                debug!(job_id = %job_id, "delivery for unknown job, dropping");
                self.ack(delivery).await;
                return;
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "failed to load job, requeueing");
                self.nak(delivery, Some(Duration::from_secs(1))).await;
                return;
            }
        };

        // Deferred work leased early: hand it back until due.
        let now = chrono::Utc::now();
        if job.status == JobStatus::Pending {
            if let Some(at) = job.scheduled_at {
                if at > now {
                    let delay = (at - now).to_std().unwrap_or(Duration::from_secs(1));
                    self.nak(delivery, Some(delay)).await;
                    return;
                }
            }
        }

        // Redelivery backstop: messages past max_deliver dead-letter
        // instead of looping forever.
        if delivery.deliveries > self.config.max_deliver {
            warn!(
                job_id = %job_id,
                deliveries = delivery.deliveries,
                "delivery count exhausted, dead-lettering"
            );
            if let Some(running) = self.start(job_id).await {
                let _ = self
                    .service
                    .fail_terminal(
                        &running,
                        "queue delivery count exhausted",
                        ErrorCategory::ResourceUnavailable,
                        None,
                    )
                    .await;
            }
            self.ack(delivery).await;
            return;
        }

        let Some(running) = self.start(job_id).await else {
            // Not pending: cancellation raced us, or this is a duplicate
            // delivery of a job someone else is running.
            match self.service.get(job_id).await {
                Ok(job) if job.status == JobStatus::Cancelling => {
                    let _ = self.service.mark_cancelled(job_id, None).await;
                }
                _ => {}
            }
            self.ack(delivery).await;
            return;
        };

        let request = match self.build_request(&running).await {
            Ok(request) => request,
            Err(message) => {
                warn!(job_id = %job_id, error = %message, "job has no usable config");
                let _ = self
                    .service
                    .fail_terminal(&running, &message, ErrorCategory::ValidationError, None)
                    .await;
                self.ack(delivery).await;
                return;
            }
        };

        let token = shutdown.child_token();
        let cancel_key = format!("cancel:job:{job_id}");

        let crawl = self.crawler.crawl(request, token.clone());
        tokio::pin!(crawl);
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.tick().await;
        let mut flag_poll = tokio::time::interval(self.config.flag_poll_interval);
        flag_poll.tick().await;

        let result = loop {
            tokio::select! {
                result = &mut crawl => break result,
                _ = heartbeat.tick() => {
                    if let Err(e) = self.queue.touch(&delivery).await {
                        warn!(job_id = %job_id, error = %e, "lease heartbeat failed");
                    }
                }
                _ = flag_poll.tick() => {
                    if !token.is_cancelled()
                        && self.cache.exists(&cancel_key).await.unwrap_or(false)
                    {
                        debug!(job_id = %job_id, "cancellation flag observed");
                        token.cancel();
                    }
                }
            }
        };

        self.settle(running, result, delivery).await;
    }

    async fn start(&self, job_id: seed_crawler::types::JobId) -> Option<CrawlJob> {
        match self.service.mark_running(job_id).await {
            Ok(job) => job,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "failed to mark job running");
                None
            }
        }
    }

    async fn build_request(&self, job: &CrawlJob) -> Result<CrawlRequest, String> {
        let (config, overrides) = if let Some(website_id) = job.website_id {
            let website = self
                .websites
                .get(website_id)
                .await
                .map_err(|e| format!("website lookup failed: {e}"))?
                .ok_or_else(|| format!("website {website_id} not found"))?;
            // Soft-deleted templates still serve their loaded config to
            // jobs already in flight.
            let overrides = match job.schedule_id {
                Some(schedule_id) => self
                    .schedules
                    .get(schedule_id)
                    .await
                    .map_err(|e| format!("schedule lookup failed: {e}"))?
                    .map(|entry| entry.overrides)
                    .filter(|overrides| !overrides.is_null()),
                None => None,
            };
            (website.config, overrides)
        } else if let Some(config) = job.inline_config.clone() {
            (config, None)
        } else {
            return Err("job has neither website_id nor inline_config".to_string());
        };

        Ok(CrawlRequest {
            job_id: job.id,
            website_id: job.website_id,
            seed_url: job.seed_url.clone(),
            config,
            overrides,
            variables: job.variables.clone(),
            metadata: job.metadata.clone(),
        })
    }

    async fn settle(&self, job: CrawlJob, result: CrawlResult, delivery: Delivery) {
        let progress = json!(result.progress);
        let error = result
            .error
            .clone()
            .unwrap_or_else(|| "crawl failed".to_string());

        match result.outcome {
            CrawlOutcome::Cancelled => {
                if let Err(e) = self.service.mark_cancelled(job.id, Some(progress)).await {
                    error!(job_id = %job.id, error = %e, "failed to finalize cancellation");
                }
            }
            CrawlOutcome::InvalidConfig | CrawlOutcome::SeedUrl404 => {
                let category = result
                    .error_category
                    .unwrap_or(ErrorCategory::ValidationError);
                if let Err(e) = self
                    .service
                    .fail_terminal(&job, &error, category, Some(progress))
                    .await
                {
                    error!(job_id = %job.id, error = %e, "failed to dead-letter job");
                }
            }
            CrawlOutcome::SeedUrlError | CrawlOutcome::Failed => {
                let category = result.error_category.unwrap_or(ErrorCategory::Unknown);
                let attempts_made = job.retry_count as u32;
                if self.classifier.should_retry(category, attempts_made) {
                    let policy = self.classifier.policy(category);
                    let delay = policy.delay(attempts_made, None);
                    let record = RetryRecord {
                        job_id: job.id,
                        url: None,
                        category,
                        attempt: attempts_made + 1,
                        delay_seconds: delay.as_secs_f64(),
                        error: error.clone(),
                    };
                    if let Err(e) = self.retries.record_retry(record).await {
                        warn!(job_id = %job.id, error = %e, "failed to record retry history");
                    }
                    if let Err(e) = self
                        .service
                        .requeue_retry(job.id, delay, &error, category)
                        .await
                    {
                        error!(job_id = %job.id, error = %e, "failed to requeue retry");
                    }
                } else if let Err(e) = self
                    .service
                    .fail_terminal(&job, &error, category, Some(progress))
                    .await
                {
                    error!(job_id = %job.id, error = %e, "failed to dead-letter job");
                }
            }
            // Every remaining outcome ends the job in `completed`.
            _ => {
                if let Err(e) = self.service.complete(job.id, &result).await {
                    error!(job_id = %job.id, error = %e, "failed to complete job");
                }
            }
        }

        self.ack(delivery).await;
    }
}
