// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Content-addressed result caching.
//!
//! Cache keys are SHA-256 fingerprints over normalized request inputs, so
//! identical requests are idempotent lookups. Values are schema-constrained
//! JSON envelopes ([`CachedArtifact`]); anything that fails to deserialize
//! is treated as a miss and overwritten. The cache is an optimization, not
//! a dependency: any store failure degrades to a miss.

pub mod fingerprint;
pub mod redis;
pub mod result_cache;
pub mod store;

pub use fingerprint::Fingerprint;
pub use redis::RedisStore;
pub use result_cache::{ArtifactKind, CacheStats, CachedArtifact, ResultCache};
pub use store::{CacheStore, CacheStoreError, MemoryStore};
