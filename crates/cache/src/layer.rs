use crate::error::Result;
use crate::kv::KvStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Request-scoped memoization map. Strongly consistent within one request;
/// dropped with it.
#[derive(Default)]
pub struct RequestCache {
    inner: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl RequestCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str, field: &str) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .await
            .get(&(key.to_string(), field.to_string()))
            .cloned()
    }

    pub async fn put(&self, key: &str, field: &str, value: Vec<u8>) {
        self.inner
            .lock()
            .await
            .insert((key.to_string(), field.to_string()), value);
    }

    pub async fn remove(&self, key: &str, field: &str) {
        self.inner
            .lock()
            .await
            .remove(&(key.to_string(), field.to_string()));
    }

    pub async fn remove_key(&self, key: &str) {
        self.inner.lock().await.retain(|(k, _), _| k != key);
    }

    pub async fn clear(&self) {
        self.inner.lock().await.clear();
    }
}

/// Two-tier memoization: request map in front of the shared store.
///
/// Readers tolerate stale shared entries; writers invalidate explicitly
/// after their write commits.
#[derive(Clone)]
pub struct CacheLayer {
    request: Arc<RequestCache>,
    shared: Arc<dyn KvStore>,
}

impl CacheLayer {
    pub fn new(shared: Arc<dyn KvStore>) -> Self {
        Self {
            request: Arc::new(RequestCache::new()),
            shared,
        }
    }

    /// A layer sharing the same store but with a fresh request tier.
    pub fn scoped(&self) -> Self {
        Self {
            request: Arc::new(RequestCache::new()),
            shared: Arc::clone(&self.shared),
        }
    }

    pub async fn get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        if let Some(hit) = self.request.get(key, field).await {
            return Ok(Some(hit));
        }
        let value = self.shared.hget(key, field).await?;
        if let Some(blob) = &value {
            self.request.put(key, field, blob.clone()).await;
        }
        Ok(value)
    }

    /// One `Option` per field; shared-tier hits are pulled forward into the
    /// request tier.
    pub async fn get_many(&self, key: &str, fields: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        let mut results: Vec<Option<Vec<u8>>> = Vec::with_capacity(fields.len());
        let mut missing: Vec<usize> = Vec::new();
        for (idx, field) in fields.iter().enumerate() {
            match self.request.get(key, field).await {
                Some(hit) => results.push(Some(hit)),
                None => {
                    results.push(None);
                    missing.push(idx);
                }
            }
        }
        if missing.is_empty() {
            return Ok(results);
        }

        let wanted: Vec<String> = missing.iter().map(|idx| fields[*idx].clone()).collect();
        let fetched = self.shared.hmget(key, &wanted).await?;
        for (slot, value) in missing.into_iter().zip(fetched) {
            if let Some(blob) = value {
                self.request.put(key, &fields[slot], blob.clone()).await;
                results[slot] = Some(blob);
            }
        }
        Ok(results)
    }

    pub async fn put(&self, key: &str, field: &str, value: Vec<u8>) -> Result<()> {
        self.request.put(key, field, value.clone()).await;
        self.shared
            .hset(key, &[(field.to_string(), value)])
            .await?;
        Ok(())
    }

    pub async fn put_many(&self, key: &str, entries: &[(String, Vec<u8>)]) -> Result<()> {
        for (field, value) in entries {
            self.request.put(key, field, value.clone()).await;
        }
        self.shared.hset(key, entries).await?;
        Ok(())
    }

    /// Drop specific entries from both tiers.
    pub async fn invalidate(&self, key: &str, fields: &[String]) -> Result<()> {
        for field in fields {
            self.request.remove(key, field).await;
        }
        self.shared.hdel(key, fields).await?;
        tracing::debug!(key, ?fields, "cache invalidated");
        Ok(())
    }

    /// Drop every entry under `key` from both tiers.
    pub async fn invalidate_all(&self, key: &str) -> Result<()> {
        self.request.remove_key(key).await;
        self.shared.del(key).await?;
        tracing::debug!(key, "cache invalidated");
        Ok(())
    }

    pub async fn clear_request(&self) {
        self.request.clear().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;

    fn layer() -> CacheLayer {
        CacheLayer::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn lookup_falls_through_to_shared() {
        let cache = layer();
        assert_eq!(cache.get("k", "1").await.unwrap(), None);

        cache.put("k", "1", vec![7]).await.unwrap();
        assert_eq!(cache.get("k", "1").await.unwrap(), Some(vec![7]));

        // A sibling scope misses the request tier but hits the shared one.
        let sibling = cache.scoped();
        assert_eq!(sibling.get("k", "1").await.unwrap(), Some(vec![7]));
    }

    #[tokio::test]
    async fn get_many_merges_tiers() {
        let cache = layer();
        cache.put("k", "1", vec![1]).await.unwrap();
        let sibling = cache.scoped();
        sibling.put("k", "2", vec![2]).await.unwrap();

        let values = cache
            .get_many("k", &["1".to_string(), "2".to_string(), "3".to_string()])
            .await
            .unwrap();
        assert_eq!(values, vec![Some(vec![1]), Some(vec![2]), None]);
    }

    #[tokio::test]
    async fn invalidation_hits_both_tiers() {
        let cache = layer();
        cache.put("k", "1", vec![1]).await.unwrap();
        cache.put("k", "2", vec![2]).await.unwrap();

        cache.invalidate("k", &["1".to_string()]).await.unwrap();
        assert_eq!(cache.get("k", "1").await.unwrap(), None);
        assert_eq!(cache.get("k", "2").await.unwrap(), Some(vec![2]));

        cache.invalidate_all("k").await.unwrap();
        assert_eq!(cache.get("k", "2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn request_tier_shields_shared_deletes() {
        let store = Arc::new(MemoryStore::new());
        let cache = CacheLayer::new(store.clone() as Arc<dyn KvStore>);
        cache.put("k", "1", vec![1]).await.unwrap();

        // Another process dropping the shared entry does not disturb the
        // current request's view.
        store.del("k").await.unwrap();
        assert_eq!(cache.get("k", "1").await.unwrap(), Some(vec![1]));

        cache.clear_request().await;
        assert_eq!(cache.get("k", "1").await.unwrap(), None);
    }
}
