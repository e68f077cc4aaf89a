//! Job lifecycle: model, persistence, orchestration service, and the
//! queue worker.

pub mod job;
pub mod service;
pub mod store;
pub mod testing;
pub mod worker;

pub use job::{CrawlJob, JobPatch, JobStatus, JobType};
pub use service::{JobService, ServiceError, SubmitRequest, SubmitSchedule};
pub use store::{JobFilter, JobStore, PostgresJobStore};
pub use testing::MemoryJobStore;
pub use worker::{CrawlWorker, WorkerConfig};
