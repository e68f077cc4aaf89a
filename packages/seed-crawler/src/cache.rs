//! In-process TTL'd key-value cache.
//!
//! Single-process deployments use this directly; multi-host deployments
//! plug a shared store in behind the same [`KvCache`] trait. Expiry is
//! checked lazily on access and swept opportunistically on writes.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::traits::KvCache;

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Instant,
}

impl Entry {
    fn fresh(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Thread-safe in-memory [`KvCache`].
#[derive(Default)]
pub struct MemoryKvCache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryKvCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries. Called opportunistically from `set`; also
    /// useful from a periodic maintenance task.
    pub fn sweep(&self) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, entry| entry.fresh());
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|e| e.fresh())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvCache for MemoryKvCache {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .get(key)
            .filter(|entry| entry.fresh())
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, entry| entry.fresh());
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let next = match entries.get(key).filter(|entry| entry.fresh()) {
            Some(entry) => entry.value.as_i64().unwrap_or(0) + 1,
            None => 1,
        };
        let expires_at = match entries.get(key).filter(|entry| entry.fresh()) {
            // Counters keep their original window.
            Some(entry) => entry.expires_at,
            None => now + ttl,
        };
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::from(next),
                expires_at,
            },
        );
        Ok(next)
    }
}
