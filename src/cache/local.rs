use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::CacheBackend;

/// In-process cache backend.
///
/// Wrapped in `Arc` so it can be cheaply cloned and shared across tasks.
/// Uses `tokio::sync::RwLock` so concurrent readers never block each other;
/// expiry of a stale entry upgrades to a write lock and re-checks under it,
/// so two readers racing on the same expired key delete it exactly once.
#[derive(Clone, Default)]
pub struct LocalCache {
    inner: Arc<RwLock<HashMap<String, Entry>>>,
}

#[derive(Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl LocalCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for LocalCache {
    async fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        {
            let map = self.inner.read().await;
            match map.get(key) {
                Some(entry) if entry.expires_at > now => return Some(entry.value.clone()),
                Some(_) => {} // expired, fall through to the write path
                None => return None,
            }
        }

        // Re-check under the write lock: another task may have replaced the
        // entry since the read lock was dropped.
        let mut map = self.inner.write().await;
        match map.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                map.remove(key);
                None
            }
            None => None,
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.inner.write().await.insert(key.to_owned(), entry);
    }

    async fn delete(&self, key: &str) {
        self.inner.write().await.remove(key);
    }

    async fn invalidate(&self, prefix: &str) -> usize {
        let mut map = self.inner.write().await;
        let before = map.len();
        map.retain(|k, _| !k.starts_with(prefix));
        before - map.len()
    }

    async fn clear(&self) {
        self.inner.write().await.clear();
    }
}
