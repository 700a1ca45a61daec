// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The cache-store seam and the in-process implementation.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheStoreError {
    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("cached payload failed schema validation: {0}")]
    Schema(String),
}

/// Byte-oriented key/value store with per-entry TTL.
///
/// Implementations must be safe to share across request handlers. Callers
/// treat every error as a cache miss; a store is never allowed to fail a
/// request.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheStoreError>;
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheStoreError>;
    async fn delete(&self, key: &str) -> Result<(), CacheStoreError>;
    async fn clear(&self) -> Result<(), CacheStoreError>;

    /// Cheap reachability check for the health monitor.
    async fn ping(&self) -> Result<(), CacheStoreError>;
}

/// In-process store backed by a concurrent map with lazy expiry.
///
/// The default when no Redis URL is configured, and the test double.
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Remove every expired entry. Maintenance-task helper; reads already
    /// expire lazily.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        before - self.entries.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheStoreError> {
        // Release the shard read guard before removing, or `remove` on the
        // same shard deadlocks.
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                return Ok(Some(entry.value.clone()))
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            drop(self.entries.remove(key));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheStoreError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheStoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheStoreError> {
        self.entries.clear();
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheStoreError> {
        Ok(())
    }
}
