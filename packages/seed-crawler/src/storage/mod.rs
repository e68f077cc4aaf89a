//! Storage implementations for crawl artifacts.
//!
//! `postgres` is the production backend; `memory` backs tests and
//! single-process experiments. Both implement the traits in
//! [`crate::traits`].

pub mod blob;
pub mod memory;
pub mod postgres;

pub use blob::{FsBlobStore, MemoryBlobStore};
pub use memory::MemoryCrawlStore;
pub use postgres::PostgresCrawlStore;
