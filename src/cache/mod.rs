pub mod local;
pub mod postgres;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;

use crate::config::{CacheBackendKind, Config};

/// Backend-agnostic key/value cache with per-key TTL and prefix
/// invalidation.
///
/// Expiry is lazy: a `get` on an expired key deletes it and returns `None`.
/// The rest of the system never knows which backend is active; callers
/// serialize values to JSON strings themselves.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: String, ttl: Duration);
    async fn delete(&self, key: &str);
    /// Remove every key starting with `prefix`; returns how many were
    /// dropped. Must stay safe for large key spaces (bounded batches on the
    /// shared backend).
    async fn invalidate(&self, prefix: &str) -> usize;
    async fn clear(&self);
}

/// Select the backend from configuration. The `postgres` backend requires a
/// pool; selecting it without one is a startup error.
pub fn from_config(
    config: &Config,
    pool: Option<&PgPool>,
) -> anyhow::Result<Arc<dyn CacheBackend>> {
    match config.cache_backend {
        CacheBackendKind::Local => Ok(Arc::new(local::LocalCache::new())),
        CacheBackendKind::Postgres => {
            let pool = pool
                .ok_or_else(|| anyhow::anyhow!("CACHE_BACKEND=postgres requires DATABASE_URL"))?;
            Ok(Arc::new(postgres::PgCache::new(pool.clone())))
        }
    }
}
