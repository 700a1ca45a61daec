// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The typed cache facade over a [`CacheStore`].
//!
//! Values on the wire are [`CachedArtifact`] envelopes serialized as JSON:
//! a closed schema, deserialized with serde rather than any format that
//! can execute or allocate arbitrarily. A payload that fails to parse is
//! treated as a miss, so a poisoned or stale-schema entry can only cost a
//! backend call, never a crash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::fingerprint::Fingerprint;
use super::store::{CacheStore, CacheStoreError};

/// What kind of output an artifact holds. Drives the TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Translation,
    Transcription,
}

/// The schema-constrained cache envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedArtifact {
    pub kind: ArtifactKind,
    pub output: String,
    pub created_at: DateTime<Utc>,
}

impl CachedArtifact {
    pub fn new(kind: ArtifactKind, output: impl Into<String>) -> Self {
        Self {
            kind,
            output: output.into(),
            created_at: Utc::now(),
        }
    }
}

/// Hit/miss counters for the metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub store_errors: u64,
    pub hit_ratio: f64,
}

/// Content-addressed result cache with per-kind TTLs.
///
/// Translations are pure functions of their input and keep for a day;
/// transcriptions are larger and churn faster, so they keep for an hour
/// by default.
pub struct ResultCache {
    store: Arc<dyn CacheStore>,
    translation_ttl: Duration,
    transcription_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    store_errors: AtomicU64,
}

impl ResultCache {
    pub fn new(
        store: Arc<dyn CacheStore>,
        translation_ttl: Duration,
        transcription_ttl: Duration,
    ) -> Self {
        Self {
            store,
            translation_ttl,
            transcription_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            store_errors: AtomicU64::new(0),
        }
    }

    fn ttl_for(&self, kind: ArtifactKind) -> Duration {
        match kind {
            ArtifactKind::Translation => self.translation_ttl,
            ArtifactKind::Transcription => self.transcription_ttl,
        }
    }

    /// Look up an artifact. Store failures and undecodable payloads are
    /// both misses; this method cannot fail.
    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<CachedArtifact> {
        let artifact = match self.lookup(fingerprint).await {
            Ok(artifact) => artifact,
            Err(err @ CacheStoreError::Backend(_)) => {
                self.store_errors.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_cache_store_error("get");
                warn!(error = %err, "Cache store unavailable, treating as miss");
                None
            }
            Err(err @ CacheStoreError::Schema(_)) => {
                warn!(key = %fingerprint, error = %err, "Undecodable cache payload, treating as miss");
                None
            }
        };

        match artifact {
            Some(artifact) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_cache("hit");
                debug!(key = %fingerprint, "Cache hit");
                Some(artifact)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_cache("miss");
                None
            }
        }
    }

    async fn lookup(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<CachedArtifact>, CacheStoreError> {
        match self.store.get(fingerprint.as_hex()).await? {
            Some(bytes) => serde_json::from_slice::<CachedArtifact>(&bytes)
                .map(Some)
                .map_err(|e| CacheStoreError::Schema(e.to_string())),
            None => Ok(None),
        }
    }

    /// Store an artifact under its fingerprint with the kind's TTL.
    /// Store failures are logged and swallowed.
    pub async fn put(&self, fingerprint: &Fingerprint, artifact: &CachedArtifact) {
        let bytes = match serde_json::to_vec(artifact) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "Failed to serialize cache artifact");
                return;
            }
        };
        let ttl = self.ttl_for(artifact.kind);
        if let Err(err) = self.store.set(fingerprint.as_hex(), &bytes, ttl).await {
            self.store_errors.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_cache_store_error("set");
            warn!(error = %err, "Cache store write failed, continuing without cache");
        }
    }

    /// Drop one entry.
    pub async fn delete(&self, fingerprint: &Fingerprint) {
        if let Err(err) = self.store.delete(fingerprint.as_hex()).await {
            self.store_errors.fetch_add(1, Ordering::Relaxed);
            warn!(error = %err, "Cache delete failed");
        }
    }

    /// Drop every entry this cache owns.
    pub async fn clear(&self) {
        if let Err(err) = self.store.clear().await {
            self.store_errors.fetch_add(1, Ordering::Relaxed);
            warn!(error = %err, "Cache clear failed");
        }
    }

    /// Reachability of the underlying store, for the health monitor.
    pub async fn is_reachable(&self) -> bool {
        self.store.ping().await.is_ok()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            store_errors: self.store_errors.load(Ordering::Relaxed),
            hit_ratio: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::{CacheStoreError, MemoryStore};
    use async_trait::async_trait;

    fn cache() -> ResultCache {
        ResultCache::new(
            Arc::new(MemoryStore::new()),
            Duration::from_secs(86_400),
            Duration::from_secs(3_600),
        )
    }

    #[tokio::test]
    async fn test_round_trip() {
        let cache = cache();
        let fp = Fingerprint::translation("hello", "en", "es");
        let artifact = CachedArtifact::new(ArtifactKind::Translation, "hola");

        cache.put(&fp, &artifact).await;
        let found = cache.get(&fp).await.unwrap();
        assert_eq!(found.output, "hola");
        assert_eq!(found.kind, ArtifactKind::Translation);
    }

    #[tokio::test]
    async fn test_miss_on_unknown_key() {
        let cache = cache();
        let fp = Fingerprint::translation("never stored", "en", "es");
        assert!(cache.get(&fp).await.is_none());

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
    }

    #[tokio::test]
    async fn test_ttl_expiry_is_a_miss() {
        let store = Arc::new(MemoryStore::new());
        let cache = ResultCache::new(
            store,
            Duration::from_millis(20),
            Duration::from_millis(20),
        );
        let fp = Fingerprint::translation("k", "en", "es");
        cache
            .put(&fp, &CachedArtifact::new(ArtifactKind::Translation, "v"))
            .await;

        assert!(cache.get(&fp).await.is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get(&fp).await.is_none());
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_a_miss() {
        let store = Arc::new(MemoryStore::new());
        let fp = Fingerprint::translation("k", "en", "es");
        store
            .set(fp.as_hex(), b"\x80\x04not-json", Duration::from_secs(60))
            .await
            .unwrap();

        let cache = ResultCache::new(store, Duration::from_secs(60), Duration::from_secs(60));
        assert!(cache.get(&fp).await.is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    struct BrokenStore;

    #[async_trait]
    impl CacheStore for BrokenStore {
        async fn get(&self, _: &str) -> Result<Option<Vec<u8>>, CacheStoreError> {
            Err(CacheStoreError::Backend("connection refused".into()))
        }
        async fn set(&self, _: &str, _: &[u8], _: Duration) -> Result<(), CacheStoreError> {
            Err(CacheStoreError::Backend("connection refused".into()))
        }
        async fn delete(&self, _: &str) -> Result<(), CacheStoreError> {
            Err(CacheStoreError::Backend("connection refused".into()))
        }
        async fn clear(&self) -> Result<(), CacheStoreError> {
            Err(CacheStoreError::Backend("connection refused".into()))
        }
        async fn ping(&self) -> Result<(), CacheStoreError> {
            Err(CacheStoreError::Backend("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_store_outage_degrades_to_miss() {
        let cache = ResultCache::new(
            Arc::new(BrokenStore),
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        let fp = Fingerprint::translation("k", "en", "es");

        // Neither direction fails the caller
        cache
            .put(&fp, &CachedArtifact::new(ArtifactKind::Translation, "v"))
            .await;
        assert!(cache.get(&fp).await.is_none());

        let stats = cache.stats();
        assert_eq!(stats.store_errors, 2);
        assert!(!cache.is_reachable().await);
    }

    #[tokio::test]
    async fn test_per_kind_ttls() {
        let store = Arc::new(MemoryStore::new());
        let cache = ResultCache::new(
            store.clone(),
            Duration::from_secs(60),
            Duration::from_millis(20),
        );

        let t_fp = Fingerprint::translation("k", "en", "es");
        let a_fp = Fingerprint::transcription(b"audio", None);
        cache
            .put(&t_fp, &CachedArtifact::new(ArtifactKind::Translation, "hola"))
            .await;
        cache
            .put(&a_fp, &CachedArtifact::new(ArtifactKind::Transcription, "words"))
            .await;

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get(&t_fp).await.is_some());
        assert!(cache.get(&a_fp).await.is_none());
    }

    #[tokio::test]
    async fn test_hit_ratio() {
        let cache = cache();
        let fp = Fingerprint::translation("k", "en", "es");
        cache
            .put(&fp, &CachedArtifact::new(ArtifactKind::Translation, "v"))
            .await;

        cache.get(&fp).await;
        cache.get(&fp).await;
        cache.get(&Fingerprint::translation("other", "en", "es")).await;

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_ratio - 2.0 / 3.0).abs() < 1e-9);
    }
}
