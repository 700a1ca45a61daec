// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis cache store.
//!
//! Values are opaque bytes written with `SETEX` so Redis itself enforces
//! the TTL. Keys carry a configurable prefix for namespacing when the
//! instance is shared with other applications. The `ConnectionManager`
//! reconnects on its own; individual command failures bubble up as
//! [`CacheStoreError::Backend`] and the caller degrades to a miss.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::time::Duration;

use super::store::{CacheStore, CacheStoreError};

pub struct RedisStore {
    connection: ConnectionManager,
    prefix: String,
}

impl RedisStore {
    /// Connect with the default `infergate:` key prefix.
    pub async fn new(connection_string: &str) -> Result<Self, CacheStoreError> {
        Self::with_prefix(connection_string, "infergate:").await
    }

    pub async fn with_prefix(
        connection_string: &str,
        prefix: &str,
    ) -> Result<Self, CacheStoreError> {
        let client = Client::open(connection_string)
            .map_err(|e| CacheStoreError::Backend(e.to_string()))?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| CacheStoreError::Backend(e.to_string()))?;
        Ok(Self {
            connection,
            prefix: prefix.to_string(),
        })
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheStoreError> {
        let mut conn = self.connection.clone();
        let value: Option<Vec<u8>> = conn
            .get(self.prefixed_key(key))
            .await
            .map_err(|e| CacheStoreError::Backend(e.to_string()))?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheStoreError> {
        let mut conn = self.connection.clone();
        let secs = ttl.as_secs().max(1);
        let _: () = conn
            .set_ex(self.prefixed_key(key), value, secs)
            .await
            .map_err(|e| CacheStoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheStoreError> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .del(self.prefixed_key(key))
            .await
            .map_err(|e| CacheStoreError::Backend(e.to_string()))?;
        Ok(())
    }

    /// Delete every key under this store's prefix, leaving the rest of the
    /// instance untouched. Uses SCAN, never KEYS.
    async fn clear(&self) -> Result<(), CacheStoreError> {
        let mut conn = self.connection.clone();
        let pattern = format!("{}*", self.prefix);
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| CacheStoreError::Backend(e.to_string()))?;
            if !keys.is_empty() {
                let _: () = conn
                    .del(keys)
                    .await
                    .map_err(|e| CacheStoreError::Backend(e.to_string()))?;
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheStoreError> {
        let mut conn = self.connection.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheStoreError::Backend(e.to_string()))?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(CacheStoreError::Backend(format!(
                "unexpected PING reply: {pong}"
            )))
        }
    }
}
