pub mod crawl_log;

pub use crawl_log::{CrawlLog, CrawlLogStore, MemoryCrawlLogStore, PostgresCrawlLogStore};
