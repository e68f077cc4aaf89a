//! Cron dispatcher: materializes due scheduled entries into jobs and
//! republishes pending jobs whose backoff timestamp has come due.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::common::Clock;
use crate::domains::websites::WebsiteStore;
use crate::jobs::service::JobService;

use super::store::ScheduleStore;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Target tick period.
    pub tick: Duration,
    /// Max scheduled entries handled per tick.
    pub batch: i64,
    /// A firing older than this is considered missed and skipped forward.
    pub grace: chrono::Duration,
    /// Max due pending jobs republished per tick.
    pub dispatch_batch: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(60),
            batch: 50,
            grace: chrono::Duration::hours(1),
            dispatch_batch: 100,
        }
    }
}

/// Per-tick counters, mostly for logs and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickStats {
    pub fired: usize,
    pub skipped_running: usize,
    pub skipped_deleted: usize,
    pub missed: usize,
    pub dispatched: usize,
}

pub struct Scheduler {
    schedules: Arc<dyn ScheduleStore>,
    websites: Arc<dyn WebsiteStore>,
    jobs: Arc<JobService>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        schedules: Arc<dyn ScheduleStore>,
        websites: Arc<dyn WebsiteStore>,
        jobs: Arc<JobService>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            schedules,
            websites,
            jobs,
            clock,
            config,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(tick = ?self.config.tick, "scheduler starting");
        let mut interval = tokio::time::interval(self.config.tick);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(stats) if stats != TickStats::default() => {
                            info!(
                                fired = stats.fired,
                                skipped_running = stats.skipped_running,
                                missed = stats.missed,
                                dispatched = stats.dispatched,
                                "scheduler tick"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "scheduler tick failed"),
                    }
                }
            }
        }
        info!("scheduler stopped");
    }

    /// One pass: fire due entries, then republish due pending jobs.
    pub async fn tick(&self) -> anyhow::Result<TickStats> {
        // One clock read drives the whole tick.
        let now = self.clock.now();
        let mut stats = TickStats::default();

        let due = self.schedules.due(now, self.config.batch).await?;
        for entry in due {
            // Stack prevention: one live job per entry. The entry stays
            // due and fires on a later tick once the previous run ends.
            match self.jobs.schedule_has_live_job(entry.id).await {
                Ok(true) => {
                    warn!(
                        schedule_id = %entry.id,
                        "schedule_skipped_previous_running"
                    );
                    stats.skipped_running += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    error!(schedule_id = %entry.id, error = %e, "live-job check failed");
                    continue;
                }
            }

            let website = match self.websites.get(entry.website_id).await? {
                Some(website) if !website.is_deleted() => website,
                _ => {
                    warn!(schedule_id = %entry.id, "schedule points at a deleted website");
                    self.schedules.set_active(entry.id, false).await?;
                    stats.skipped_deleted += 1;
                    continue;
                }
            };

            if let Some(next_run) = entry.next_run_time {
                if now - next_run > self.config.grace {
                    warn!(
                        schedule_id = %entry.id,
                        overdue = %(now - next_run),
                        "missed_fire"
                    );
                    stats.missed += 1;
                }
            }

            let next = match entry.next_fire_after(now) {
                Ok(next) => next,
                Err(e) => {
                    error!(schedule_id = %entry.id, error = %e, "cron evaluation failed");
                    self.schedules.set_active(entry.id, false).await?;
                    continue;
                }
            };

            // Claim the firing before submitting: a raced second instance
            // loses the compare-and-set and skips.
            if !self
                .schedules
                .advance(entry.id, entry.next_run_time, now, next)
                .await?
            {
                continue;
            }

            let seed_url = entry
                .seed_url
                .clone()
                .unwrap_or_else(|| website.base_url.clone());
            match self.jobs.submit_scheduled(&entry, &seed_url, now).await {
                Ok(job) => {
                    info!(schedule_id = %entry.id, job_id = %job.id, "scheduled job fired");
                    stats.fired += 1;
                }
                Err(e) => {
                    // The entry has already advanced; this firing is lost
                    // and the next one happens at `next`.
                    error!(schedule_id = %entry.id, error = %e, "scheduled submit failed");
                }
            }
        }

        stats.dispatched = self
            .jobs
            .dispatch_due(now, self.config.dispatch_batch)
            .await
            .unwrap_or_else(|e| {
                error!(error = %e, "due-job dispatch failed");
                0
            });

        Ok(stats)
    }
}
