//! Re-exports for consumers who prefer a single import.
//!
//! ```no_run
//! use tower_proxy_cache::prelude::*;
//! let layer = ProxyCacheLayer::builder()
//!     .adapter(MemoryAdapter::new(64 * 1024 * 1024))
//!     .build();
//! ```

pub use crate::adapter::{
    Adapter, AdapterPurge, AdapterRead, AdapterWrite, CombinedAdapter, MemoryAdapter,
    MemorySchedule, NullAdapter, PublishSchedule, PublishScheduleAdapter, StalenessSignal,
    TtlAdapter,
};
#[cfg(feature = "redis-adapter")]
pub use crate::adapter::RedisAdapter;
pub use crate::codec::{CacheCodec, JsonCodec, PersistedEntry};
pub use crate::config::{ProxyCacheConfig, ProxyCacheSettings, SuccessStatuses};
pub use crate::entry::{CacheEntry, CachedResponse, EntryInfo, EntryState};
pub use crate::error::CacheError;
pub use crate::eviction::{EvictionReport, MemoryCheck, MemoryProbe, ProcessMemoryProbe};
pub use crate::key::{CacheKey, DeviceClass, DeviceClassifier, KeyPattern, UserAgentClassifier};
pub use crate::layer::{ProxyCacheLayer, ProxyCacheLayerBuilder, ProxyCacheService};
pub use crate::logging::{CacheEvent, CacheEventType, EventLogConfig};
pub use crate::refresh::{RefreshHandle, RefreshOutcome};
pub use crate::store::{CacheStore, ClearOutcome};
pub use crate::watcher::Watchers;
