pub mod logs;
pub mod retries;
pub mod schedules;
pub mod websites;
