//! Tower Proxy Cache
//! =================
//!
//! `tower-proxy-cache` puts an in-memory response cache in front of an
//! upstream HTTP service. It is meant to sit in a reverse proxy: the wrapped
//! Tower service is the origin, and the layer answers repeat requests from
//! memory.
//!
//! - Concurrent misses for the same key are coalesced onto one upstream
//!   fetch, and the triggering caller is streamed the live upstream body.
//! - Staleness comes from a pluggable [`Adapter`](adapter::Adapter) (a TTL
//!   by default). Stale entries are dropped, or kept and refreshed in the
//!   background when stale serving is enabled.
//! - A watcher samples resident memory and evicts least-hit entries above a
//!   threshold.
//! - Adapters can also persist entries externally (Redis, or a shared
//!   in-process store) so that other instances start warm.
//!
//! ```no_run
//! use std::time::Duration;
//! use tower::{Service, ServiceBuilder, ServiceExt};
//! use tower_proxy_cache::prelude::*;
//!
//! # async fn run() -> Result<(), tower_proxy_cache::layer::BoxError> {
//! let layer = ProxyCacheLayer::builder()
//!     .adapter(TtlAdapter::new(Duration::from_secs(300)))
//!     .allow_stale(true)
//!     .build();
//! let _watchers = layer.store().start().await?;
//!
//! let mut svc = ServiceBuilder::new()
//!     .layer(layer)
//!     .service(tower::service_fn(|_req: http::Request<http_body_util::Empty<bytes::Bytes>>| async {
//!         Ok::<_, std::convert::Infallible>(http::Response::new(http_body_util::Full::from("ok")))
//!     }));
//!
//! let response = svc
//!     .ready()
//!     .await?
//!     .call(http::Request::new(http_body_util::Empty::new()))
//!     .await?;
//! # drop(response);
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod codec;
pub mod config;
pub mod entry;
pub mod error;
pub mod eviction;
pub mod key;
pub mod layer;
pub mod logging;
pub mod prelude;
pub mod refresh;
pub mod request_id;
pub mod stats;
pub mod store;
pub mod watcher;

pub use config::{ProxyCacheConfig, ProxyCacheSettings};
pub use error::CacheError;
pub use layer::{ProxyCacheLayer, ProxyCacheLayerBuilder, ProxyCacheService};
pub use logging::{CacheEvent, CacheEventType, EventLogConfig};
pub use request_id::RequestId;
pub use store::CacheStore;
