//! TTL key-value cache behind a backend-agnostic trait.
//!
//! Two backends: an in-process map for single-instance deployments and a
//! SQLite table for deployments where several processes must share one
//! cache. Selection is config-driven. Cache failures are never fatal to a
//! request: a backend error logs a warning and behaves as a miss.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::Config;

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get_raw(&self, key: &str) -> Option<String>;
    async fn set_raw(&self, key: &str, value: String);
    async fn delete(&self, key: &str);
}

/// Typed read: a missing key, an expired entry, and an undecodable value
/// all behave as a miss.
pub async fn get_json<T: DeserializeOwned>(cache: &dyn Cache, key: &str) -> Option<T> {
    let raw = cache.get_raw(key).await?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(key, error = %e, "discarding undecodable cache entry");
            cache.delete(key).await;
            None
        }
    }
}

pub async fn set_json<T: Serialize>(cache: &dyn Cache, key: &str, value: &T) {
    match serde_json::to_string(value) {
        Ok(raw) => cache.set_raw(key, raw).await,
        Err(e) => tracing::warn!(key, error = %e, "failed to serialize cache entry"),
    }
}

/// In-process backend: a map of value + expiry instant.
pub struct MemoryCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, String)>>,
}

impl MemoryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get_raw(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some((expires, value)) if *expires > Instant::now() => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn set_raw(&self, key: &str, value: String) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), (Instant::now() + self.ttl, value));
    }

    async fn delete(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
    }
}

/// Shared backend: `kv_cache` table with microsecond expiry stamps.
pub struct SqliteCache {
    pool: SqlitePool,
    ttl: Duration,
}

impl SqliteCache {
    pub fn new(pool: SqlitePool, ttl: Duration) -> Self {
        Self { pool, ttl }
    }
}

fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

#[async_trait]
impl Cache for SqliteCache {
    async fn get_raw(&self, key: &str) -> Option<String> {
        let result: Result<Option<String>, sqlx::Error> = sqlx::query_scalar(
            "SELECT value FROM kv_cache WHERE key = ? AND expires_at > ?",
        )
        .bind(key)
        .bind(now_micros())
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache read failed");
                None
            }
        }
    }

    async fn set_raw(&self, key: &str, value: String) {
        let expires_at = now_micros() + self.ttl.as_micros() as i64;
        let result = sqlx::query(
            r#"
            INSERT INTO kv_cache (key, value, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::warn!(key, error = %e, "cache write failed");
        }
    }

    async fn delete(&self, key: &str) {
        let result = sqlx::query("DELETE FROM kv_cache WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await;

        if let Err(e) = result {
            tracing::warn!(key, error = %e, "cache delete failed");
        }
    }
}

/// Build the configured cache backend.
pub fn build_cache(config: &Config, pool: &SqlitePool) -> Arc<dyn Cache> {
    let ttl = Duration::from_secs(config.cache.ttl_secs);
    match config.cache.backend.as_str() {
        "sqlite" => Arc::new(SqliteCache::new(pool.clone(), ttl)),
        _ => Arc::new(MemoryCache::new(ttl)),
    }
}
