pub mod cron;
pub mod scheduled_job;
pub mod scheduler;
pub mod store;

pub use scheduled_job::ScheduledJob;
pub use scheduler::{Scheduler, SchedulerConfig, TickStats};
pub use store::{MemoryScheduleStore, PostgresScheduleStore, ScheduleStore};
