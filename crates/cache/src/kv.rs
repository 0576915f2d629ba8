use crate::error::Result;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub url: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("REDIS_URL").unwrap_or_else(|_| Self::default().url),
        }
    }
}

/// Hash-shaped key-value transport backing the shared cache tier.
///
/// Values are opaque byte blobs; keys address a hash, fields address entries
/// inside it.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>>;

    /// One `Option` per requested field, in order.
    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<Vec<u8>>>>;

    async fn hset(&self, key: &str, entries: &[(String, Vec<u8>)]) -> Result<()>;

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<()>;

    /// Drop the whole hash.
    async fn del(&self, key: &str) -> Result<()>;
}

/// Redis-backed store for deployments sharing the cache across processes.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    pub async fn new(config: CacheConfig) -> Result<Self> {
        let client = Client::open(config.url)?;
        let manager = ConnectionManager::new(client).await?;

        Ok(Self { manager })
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.manager.clone();
        let value: Option<Vec<u8>> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.manager.clone();
        let values: Vec<Option<Vec<u8>>> = redis::cmd("HMGET")
            .arg(key)
            .arg(fields)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn hset(&self, key: &str, entries: &[(String, Vec<u8>)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        conn.hset_multiple::<_, _, _, ()>(key, entries).await?;
        Ok(())
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        conn.hdel::<_, _, ()>(key, fields).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}

/// Process-local store with the same shape; used in tests and single-node
/// deployments.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<HashMap<String, HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn flush_all(&self) {
        self.inner.lock().await.clear();
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.lock().await;
        Ok(inner.get(key).and_then(|hash| hash.get(field)).cloned())
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        let inner = self.inner.lock().await;
        let hash = inner.get(key);
        Ok(fields
            .iter()
            .map(|field| hash.and_then(|h| h.get(field)).cloned())
            .collect())
    }

    async fn hset(&self, key: &str, entries: &[(String, Vec<u8>)]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let hash = inner.entry(key.to_string()).or_default();
        for (field, value) in entries {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(hash) = inner.get_mut(key) {
            for field in fields {
                hash.remove(field);
            }
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.inner.lock().await.remove(key);
        Ok(())
    }
}
