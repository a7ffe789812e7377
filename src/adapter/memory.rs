use async_trait::async_trait;
use moka::future::Cache;

use super::{Adapter, AdapterPurge, AdapterRead, AdapterWrite};
use crate::error::CacheError;
use crate::key::{CacheKey, KeyPattern};

pub const DEFAULT_MAX_PAYLOAD: usize = 512 * 1024 * 1024;

/// Process-local external store backed by [`moka`].
///
/// Useful when several stores in one process share persisted entries, and as
/// a stand-in for a networked adapter in tests. Capacity is measured in bytes
/// of key plus serialized payload.
#[derive(Clone)]
pub struct MemoryAdapter {
    cache: Cache<String, String>,
    max_payload: usize,
}

impl MemoryAdapter {
    pub fn new(max_capacity_bytes: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity_bytes)
            .weigher(|key: &String, payload: &String| {
                u32::try_from(key.len() + payload.len()).unwrap_or(u32::MAX)
            })
            .build();
        Self {
            cache,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    /// Payloads larger than `bytes` are refused with
    /// [`CacheError::PayloadTooLarge`].
    pub fn with_max_payload(mut self, bytes: usize) -> Self {
        self.max_payload = bytes;
        self
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.cache.get(key).await.is_some()
    }
}

impl Adapter for MemoryAdapter {
    fn name(&self) -> &'static str {
        "memory"
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
impl AdapterRead for MemoryAdapter {
    async fn get(&self, key: &CacheKey) -> Result<Option<String>, CacheError> {
        Ok(self.cache.get(key.as_str()).await)
    }
}

#[async_trait]
impl AdapterWrite for MemoryAdapter {
    async fn set(&self, key: &CacheKey, payload: String) -> Result<(), CacheError> {
        if payload.len() > self.max_payload {
            return Err(CacheError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload,
            });
        }
        self.cache.insert(key.to_string(), payload).await;
        Ok(())
    }
}

#[async_trait]
impl AdapterPurge for MemoryAdapter {
    async fn clear(&self, pattern: Option<&KeyPattern>) -> Result<(), CacheError> {
        match pattern {
            None => self.cache.invalidate_all(),
            Some(pattern) => {
                let matching: Vec<_> = self
                    .cache
                    .iter()
                    .filter(|(key, _)| pattern.matches(key))
                    .map(|(key, _)| key)
                    .collect();
                for key in matching {
                    self.cache.invalidate(key.as_str()).await;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stores_and_returns_payloads() {
        let adapter = MemoryAdapter::new(1024 * 1024);
        let key = CacheKey::from("not_phone:a:/x");

        assert_eq!(adapter.get(&key).await.unwrap(), None);
        adapter.set(&key, "{\"v\":1}".into()).await.unwrap();
        assert_eq!(adapter.get(&key).await.unwrap().as_deref(), Some("{\"v\":1}"));
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected() {
        let adapter = MemoryAdapter::new(1024).with_max_payload(8);
        let key = CacheKey::from("k");

        let err = adapter
            .set(&key, "0123456789".into())
            .await
            .expect_err("too large");
        assert!(matches!(err, CacheError::PayloadTooLarge { size: 10, max: 8 }));
        assert!(!adapter.contains("k").await);
    }

    #[tokio::test]
    async fn clear_honors_pattern() {
        let adapter = MemoryAdapter::new(1024 * 1024);
        for path in ["/hello", "/delay", "/hello/world"] {
            let key = CacheKey::build("not_phone", "localhost", path);
            adapter.set(&key, "payload".into()).await.unwrap();
        }

        adapter
            .clear(Some(&KeyPattern::new("*/hello")))
            .await
            .unwrap();
        assert!(!adapter.contains("not_phone:localhost:/hello").await);
        assert!(adapter.contains("not_phone:localhost:/delay").await);
        assert!(adapter.contains("not_phone:localhost:/hello/world").await);

        adapter.clear(None).await.unwrap();
        assert!(!adapter.contains("not_phone:localhost:/delay").await);
    }
}
