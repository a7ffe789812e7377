use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{Adapter, AdapterPurge, AdapterRead, AdapterWrite};
use crate::error::CacheError;
use crate::key::{CacheKey, KeyPattern};

/// Largest string value Redis accepts.
pub const REDIS_MAX_VALUE: usize = 512 * 1024 * 1024;

/// Shared external store on Redis.
///
/// Keys are stored as `{namespace}:{cache key}`; purges only ever touch the
/// namespace.
#[derive(Clone)]
pub struct RedisAdapter {
    connection: ConnectionManager,
    namespace: String,
    max_payload: usize,
}

impl RedisAdapter {
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            namespace: "tower_proxy_cache".to_owned(),
            max_payload: REDIS_MAX_VALUE,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_max_payload(mut self, bytes: usize) -> Self {
        self.max_payload = bytes.min(REDIS_MAX_VALUE);
        self
    }

    fn make_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    async fn namespaced_keys(&self) -> Result<Vec<String>, CacheError> {
        let mut conn = self.connection.clone();
        let mut iter = conn
            .scan_match::<_, String>(format!("{}:*", self.namespace))
            .await?;
        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }
}

#[async_trait]
impl Adapter for RedisAdapter {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn ready(&self) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn reader(&self) -> Option<&dyn AdapterRead> {
        Some(self)
    }

    fn writer(&self) -> Option<&dyn AdapterWrite> {
        Some(self)
    }

    fn purger(&self) -> Option<&dyn AdapterPurge> {
        Some(self)
    }
}

#[async_trait]
impl AdapterRead for RedisAdapter {
    async fn get(&self, key: &CacheKey) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection.clone();
        conn.get(self.make_key(key.as_str()))
            .await
            .map_err(|err| CacheError::AdapterRead(err.to_string()))
    }
}

#[async_trait]
impl AdapterWrite for RedisAdapter {
    async fn set(&self, key: &CacheKey, payload: String) -> Result<(), CacheError> {
        if payload.len() > self.max_payload {
            return Err(CacheError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload,
            });
        }
        let mut conn = self.connection.clone();
        let _: () = conn
            .set(self.make_key(key.as_str()), payload)
            .await
            .map_err(|err| CacheError::AdapterWrite(err.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl AdapterPurge for RedisAdapter {
    async fn clear(&self, pattern: Option<&KeyPattern>) -> Result<(), CacheError> {
        let prefix_len = self.namespace.len() + 1;
        let doomed: Vec<String> = self
            .namespaced_keys()
            .await?
            .into_iter()
            .filter(|stored| {
                pattern.map_or(true, |pattern| {
                    stored
                        .get(prefix_len..)
                        .is_some_and(|key| pattern.matches(key))
                })
            })
            .collect();

        if doomed.is_empty() {
            return Ok(());
        }

        let mut conn = self.connection.clone();
        let removed: usize = conn.del(&doomed).await?;
        tracing::info!(removed, namespace = %self.namespace, "purged redis entries");
        Ok(())
    }
}
