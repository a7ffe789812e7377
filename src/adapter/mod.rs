//! Adapter contract.
//!
//! An adapter plugs external persistence and staleness detection into the
//! store. Every capability is optional and discovered through the accessor
//! methods on [`Adapter`]; an adapter that returns `None` from
//! [`Adapter::reader`] is simply never consulted on a miss.
//!
//! Shipped adapters:
//! - [`TtlAdapter`]: the default; reports staleness once per fixed TTL.
//! - [`PublishScheduleAdapter`]: reports staleness when a new publish time
//!   appears in a [`PublishSchedule`].
//! - [`MemoryAdapter`]: process-local external store backed by [`moka`].
//! - `RedisAdapter` *(optional)*: shared external store, behind the
//!   `redis-adapter` crate feature.
//! - [`CombinedAdapter`]: one adapter's staleness with another's storage.

pub mod combined;
pub mod memory;
#[cfg(feature = "redis-adapter")]
pub mod redis;
pub mod schedule;
pub mod ttl;

pub use combined::CombinedAdapter;
pub use memory::MemoryAdapter;
#[cfg(feature = "redis-adapter")]
pub use self::redis::RedisAdapter;
pub use schedule::{MemorySchedule, PublishSchedule, PublishScheduleAdapter};
pub use ttl::TtlAdapter;

use async_trait::async_trait;

use crate::error::CacheError;
use crate::key::{CacheKey, KeyPattern};

/// Base adapter trait.
#[async_trait]
pub trait Adapter: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Resolves once the adapter can serve requests. The store awaits this
    /// before it starts its watchers.
    async fn ready(&self) -> Result<(), CacheError> {
        Ok(())
    }

    fn reader(&self) -> Option<&dyn AdapterRead> {
        None
    }

    fn writer(&self) -> Option<&dyn AdapterWrite> {
        None
    }

    fn purger(&self) -> Option<&dyn AdapterPurge> {
        None
    }

    fn staleness(&self) -> Option<&dyn StalenessSignal> {
        None
    }
}

/// Looks up a serialized entry.
#[async_trait]
pub trait AdapterRead: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<String>, CacheError>;
}

/// Stores a serialized entry.
///
/// Implementations with a size limit return [`CacheError::PayloadTooLarge`].
#[async_trait]
pub trait AdapterWrite: Send + Sync {
    async fn set(&self, key: &CacheKey, payload: String) -> Result<(), CacheError>;
}

/// Removes serialized entries, all of them when `pattern` is `None`.
#[async_trait]
pub trait AdapterPurge: Send + Sync {
    async fn clear(&self, pattern: Option<&KeyPattern>) -> Result<(), CacheError>;
}

/// Polled by the staleness watcher. `true` makes the store clear itself.
#[async_trait]
pub trait StalenessSignal: Send + Sync {
    async fn is_stale(&self) -> Result<bool, CacheError>;
}

/// Adapter with no capabilities.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullAdapter;

impl Adapter for NullAdapter {
    fn name(&self) -> &'static str {
        "null"
    }
}
