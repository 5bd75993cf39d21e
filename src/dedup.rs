// =============================================================================
// DedupStore — "seen?" TTL set used by ingest-side dedup
// =============================================================================
//
// Grounded on `libs/feature-store/src/feature_store/dedup.py`. One method:
// `seen_or_add` atomically checks and records a key, returning whether it
// was already present. The Redis implementation leans on `SET NX EX` for
// that atomicity instead of a read-then-write round trip.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Returns `true` if `key` was already recorded and still within its
    /// TTL (a duplicate); otherwise records it with a fresh TTL and
    /// returns `false`.
    async fn seen_or_add(&self, key: &str, ttl_sec: u64) -> anyhow::Result<bool>;
}

pub struct MemoryDedupStore {
    items: Mutex<HashMap<String, Instant>>,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryDedupStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn seen_or_add(&self, key: &str, ttl_sec: u64) -> anyhow::Result<bool> {
        let now = Instant::now();
        let mut items = self.items.lock();
        if let Some(expiry) = items.get(key) {
            if *expiry > now {
                return Ok(true);
            }
        }
        items.insert(key.to_string(), now + Duration::from_secs(ttl_sec));
        Ok(false)
    }
}

pub struct RedisDedupStore {
    client: redis::Client,
    namespace: String,
}

impl RedisDedupStore {
    pub fn new(redis_url: &str, namespace: impl Into<String>) -> anyhow::Result<Self> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            namespace: namespace.into(),
        })
    }

    async fn conn(&self) -> anyhow::Result<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

#[async_trait]
impl DedupStore for RedisDedupStore {
    async fn seen_or_add(&self, key: &str, ttl_sec: u64) -> anyhow::Result<bool> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let namespaced = format!("{}:{}", self.namespace, key);
        let options = redis::SetOptions::default()
            .conditional_set(redis::ExistenceCheck::NX)
            .with_expiration(redis::SetExpiry::EX(ttl_sec as usize));
        let created: Option<String> = conn.set_options(&namespaced, "1", options).await?;
        Ok(created.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_sighting_is_not_a_duplicate() {
        let store = MemoryDedupStore::new();
        assert!(!store.seen_or_add("a", 60).await.unwrap());
    }

    #[tokio::test]
    async fn second_sighting_within_ttl_is_a_duplicate() {
        let store = MemoryDedupStore::new();
        store.seen_or_add("a", 60).await.unwrap();
        assert!(store.seen_or_add("a", 60).await.unwrap());
    }

    #[tokio::test]
    async fn expired_entry_is_not_a_duplicate() {
        let store = MemoryDedupStore::new();
        store.seen_or_add("a", 0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!store.seen_or_add("a", 60).await.unwrap());
    }

    #[tokio::test]
    async fn distinct_keys_do_not_collide() {
        let store = MemoryDedupStore::new();
        store.seen_or_add("a", 60).await.unwrap();
        assert!(!store.seen_or_add("b", 60).await.unwrap());
    }
}
