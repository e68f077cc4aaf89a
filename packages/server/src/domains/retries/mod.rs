pub mod dead_letter;
pub mod retry_history;

pub use dead_letter::{DeadLetterJob, DlqStore, MemoryDlqStore, PostgresDlqStore};
pub use retry_history::{MemoryRetryStore, PostgresRetryStore, RetryHistory, RetryStore};
