//! In-memory job store for tests.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use seed_crawler::types::{JobId, ScheduleId};

use super::job::{CrawlJob, JobPatch, JobStatus};
use super::store::{JobFilter, JobStore};

/// Stores jobs in memory and applies the same compare-and-set transition
/// semantics as the Postgres store.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, CrawlJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<CrawlJob> {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &CrawlJob) -> Result<CrawlJob> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        jobs.insert(job.id, job.clone());
        Ok(job.clone())
    }

    async fn get(&self, id: JobId) -> Result<Option<CrawlJob>> {
        Ok(self
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned())
    }

    async fn delete(&self, id: JobId) -> Result<()> {
        self.jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        Ok(())
    }

    async fn list(&self, filter: &JobFilter, limit: i64, offset: i64) -> Result<Vec<CrawlJob>> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        let mut matched: Vec<CrawlJob> = jobs
            .values()
            .filter(|j| filter.status.map(|s| j.status == s).unwrap_or(true))
            .filter(|j| {
                filter
                    .website_id
                    .map(|w| j.website_id == Some(w))
                    .unwrap_or(true)
            })
            .filter(|j| filter.job_type.map(|t| j.job_type == t).unwrap_or(true))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matched
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn transition(
        &self,
        id: JobId,
        from: &[JobStatus],
        to: JobStatus,
        patch: JobPatch,
    ) -> Result<Option<CrawlJob>> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        if !from.contains(&job.status) {
            return Ok(None);
        }
        job.status = to;
        if let Some(v) = patch.started_at {
            job.started_at = Some(v);
        }
        if let Some(v) = patch.completed_at {
            job.completed_at = Some(v);
        }
        if let Some(v) = patch.cancelled_at {
            job.cancelled_at = Some(v);
        }
        if let Some(v) = patch.cancelled_by {
            job.cancelled_by = Some(v);
        }
        if let Some(v) = patch.cancellation_reason {
            job.cancellation_reason = Some(v);
        }
        if let Some(v) = patch.error_message {
            job.error_message = Some(v);
        }
        if let Some(v) = patch.error_category {
            job.error_category = Some(v);
        }
        if let Some(v) = patch.scheduled_at {
            job.scheduled_at = Some(v);
        }
        if let Some(v) = patch.progress {
            job.progress = v;
        }
        if patch.increment_retry {
            job.retry_count += 1;
        }
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn latest_for_schedule(&self, schedule_id: ScheduleId) -> Result<Option<CrawlJob>> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        Ok(jobs
            .values()
            .filter(|j| j.schedule_id == Some(schedule_id))
            .max_by_key(|j| j.created_at)
            .cloned())
    }

    async fn due_pending(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<CrawlJob>> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        let mut due: Vec<CrawlJob> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .filter(|j| j.scheduled_at.map(|at| at <= now).unwrap_or(false))
            .cloned()
            .collect();
        due.sort_by_key(|j| (j.priority, j.scheduled_at));
        due.truncate(limit as usize);
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seed_crawler::types::WebsiteId;

    fn job() -> CrawlJob {
        CrawlJob::builder()
            .website_id(WebsiteId::new())
            .seed_url("https://example.test/")
            .build()
    }

    #[tokio::test]
    async fn transition_applies_only_from_allowed_states() {
        let store = MemoryJobStore::new();
        let inserted = store.insert(&job()).await.unwrap();

        let running = store
            .transition(
                inserted.id,
                &[JobStatus::Pending],
                JobStatus::Running,
                JobPatch {
                    started_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(running.unwrap().status, JobStatus::Running);

        // A second compare-and-set from pending loses.
        let duplicate = store
            .transition(
                inserted.id,
                &[JobStatus::Pending],
                JobStatus::Running,
                JobPatch::default(),
            )
            .await
            .unwrap();
        assert!(duplicate.is_none());
    }

    #[tokio::test]
    async fn increment_retry_bumps_the_counter() {
        let store = MemoryJobStore::new();
        let mut j = job();
        j.status = JobStatus::Running;
        let inserted = store.insert(&j).await.unwrap();

        let retried = store
            .transition(
                inserted.id,
                &[JobStatus::Running],
                JobStatus::Pending,
                JobPatch {
                    increment_retry: true,
                    scheduled_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retried.retry_count, 1);
        assert!(retried.scheduled_at.is_some());
    }

    #[tokio::test]
    async fn due_pending_ignores_unscheduled_jobs() {
        let store = MemoryJobStore::new();
        store.insert(&job()).await.unwrap();
        let mut scheduled = job();
        scheduled.scheduled_at = Some(Utc::now() - chrono::Duration::seconds(5));
        store.insert(&scheduled).await.unwrap();

        let due = store.due_pending(Utc::now(), 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, scheduled.id);
    }
}
