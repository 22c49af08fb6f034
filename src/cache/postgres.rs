use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tracing::warn;

use super::CacheBackend;

/// Batch size for prefix invalidation; keeps each DELETE short-lived so a
/// large key space never holds a long lock.
const INVALIDATE_BATCH: i64 = 500;

/// Shared cache backend over the `cache_entries` table, safe across
/// multiple service instances.
///
/// Cache I/O is best-effort: database errors degrade to a miss (or a no-op
/// write) with a warning, never to a pipeline failure.
#[derive(Clone)]
pub struct PgCache {
    pool: PgPool,
}

impl PgCache {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CacheBackend for PgCache {
    async fn get(&self, key: &str) -> Option<String> {
        // Expiry check and eviction in one statement keeps the
        // read-modify-write atomic per key.
        let evicted =
            sqlx::query("DELETE FROM cache_entries WHERE key = $1 AND expires_at <= now()")
                .bind(key)
                .execute(&self.pool)
                .await;
        if let Err(e) = evicted {
            warn!(key = %key, error = %e, "cache eviction failed");
            return None;
        }

        match sqlx::query_scalar::<_, String>(
            "SELECT value FROM cache_entries WHERE key = $1 AND expires_at > now()",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, error = %e, "cache read failed");
                None
            }
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) {
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        let result = sqlx::query(
            "INSERT INTO cache_entries (key, value, expires_at) VALUES ($1, $2, $3) \
             ON CONFLICT (key) DO UPDATE SET value = $2, expires_at = $3",
        )
        .bind(key)
        .bind(&value)
        .bind(expires_at)
        .execute(&self.pool)
        .await;
        if let Err(e) = result {
            warn!(key = %key, error = %e, "cache write failed");
        }
    }

    async fn delete(&self, key: &str) {
        let result = sqlx::query("DELETE FROM cache_entries WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await;
        if let Err(e) = result {
            warn!(key = %key, error = %e, "cache delete failed");
        }
    }

    async fn invalidate(&self, prefix: &str) -> usize {
        // `LIKE 'prefix%'` with a literal-escaped prefix; deletes run in
        // bounded batches instead of one statement over the whole key space.
        let pattern = format!("{}%", escape_like(prefix));
        let mut total: usize = 0;
        loop {
            let result = sqlx::query(
                "DELETE FROM cache_entries WHERE key IN ( \
                     SELECT key FROM cache_entries WHERE key LIKE $1 LIMIT $2)",
            )
            .bind(&pattern)
            .bind(INVALIDATE_BATCH)
            .execute(&self.pool)
            .await;
            match result {
                Ok(done) => {
                    let n = done.rows_affected() as usize;
                    total += n;
                    if (n as i64) < INVALIDATE_BATCH {
                        break;
                    }
                }
                Err(e) => {
                    warn!(prefix = %prefix, error = %e, "cache invalidation failed");
                    break;
                }
            }
        }
        total
    }

    async fn clear(&self) {
        if let Err(e) = sqlx::query("DELETE FROM cache_entries").execute(&self.pool).await {
            warn!(error = %e, "cache clear failed");
        }
    }
}

/// Escape `%`, `_` and `\` so the prefix matches literally under `LIKE`.
fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}
