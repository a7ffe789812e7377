//! The cache store: key → entry map plus the request path.

use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use http::header::{HeaderName, CONNECTION, CONTENT_TYPE, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode};
use http_body::{Body, Frame};
use http_body_util::{BodyExt, Full, StreamBody};
use tokio::sync::mpsc;
use tower::{Service, ServiceExt};

#[cfg(feature = "metrics")]
use metrics::{counter, gauge, histogram};

use crate::adapter::{Adapter, TtlAdapter};
use crate::codec::{CacheCodec, JsonCodec};
use crate::config::ProxyCacheConfig;
use crate::entry::{CacheEntry, CachedResponse, EntryInfo, EntryView, Observation, Readiness};
use crate::error::CacheError;
use crate::eviction::{MemoryProbe, ProcessMemoryProbe};
use crate::key::{CacheKey, KeyBuilder, KeyPattern};
use crate::layer::{BoxError, ProxyBody};
use crate::logging::{saturating_millis, CacheEvent, CacheEventType};
use crate::refresh::{spawn_refresh, RefreshHandle, RefreshMetadata};
use crate::request_id::RequestId;
use crate::stats::{StatsSnapshot, StoreStats};
use crate::watcher::Watchers;

pub const X_CACHE_SERVER_VERSION: HeaderName = HeaderName::from_static("x-cache-server-version");
pub const X_CACHE_KEY: HeaderName = HeaderName::from_static("x-cache-key");
pub const X_CACHE_DATE: HeaderName = HeaderName::from_static("x-cache-date");
pub const X_CACHE_UPDATED: HeaderName = HeaderName::from_static("x-cache-updated");
pub const X_CACHE_HITS: HeaderName = HeaderName::from_static("x-cache-hits");

pub const FAILURE_BODY: &str = "Sorry, an unknown error occurred.";
pub const PROXY_ERROR_BODY: &str = "Proxy request error.";

// Frames buffered between the upstream pump and the triggering caller.
const FRAME_BUFFER: usize = 32;

/// Process-wide cache of upstream responses.
///
/// Build one per upstream, wrap it in an [`Arc`], and share it between the
/// Tower service and anything that needs to clear or inspect it.
pub struct CacheStore {
    entries: DashMap<CacheKey, Arc<CacheEntry>>,
    adapter: Arc<dyn Adapter>,
    codec: Arc<dyn CacheCodec>,
    config: ProxyCacheConfig,
    keys: KeyBuilder,
    stats: StoreStats,
    probe: Arc<dyn MemoryProbe>,
}

/// Outcome of a [`CacheStore::clear`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearOutcome {
    Removed(usize),
    MarkedStale(usize),
}

impl CacheStore {
    /// Creates a store with the default TTL adapter.
    pub fn new(config: ProxyCacheConfig) -> Self {
        Self::with_adapter(config, TtlAdapter::default())
    }

    pub fn with_adapter(config: ProxyCacheConfig, adapter: impl Adapter) -> Self {
        Self::with_shared_adapter(config, Arc::new(adapter))
    }

    pub fn with_shared_adapter(config: ProxyCacheConfig, adapter: Arc<dyn Adapter>) -> Self {
        Self {
            entries: DashMap::new(),
            adapter,
            codec: Arc::new(JsonCodec),
            keys: config.key_builder(),
            config,
            stats: StoreStats::new(),
            probe: Arc::new(ProcessMemoryProbe),
        }
    }

    pub fn with_codec(mut self, codec: impl CacheCodec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    pub fn with_memory_probe(mut self, probe: impl MemoryProbe) -> Self {
        self.probe = Arc::new(probe);
        self
    }

    /// Waits for the adapter, then starts the staleness and memory watchers.
    pub async fn start(self: &Arc<Self>) -> Result<Watchers, CacheError> {
        self.adapter.ready().await?;
        tracing::info!(
            adapter = self.adapter.name(),
            memory_threshold = self.config.memory_threshold(),
            "cache store ready"
        );
        Ok(Watchers::spawn(self.clone()))
    }

    pub fn config(&self) -> &ProxyCacheConfig {
        &self.config
    }

    pub fn adapter(&self) -> &dyn Adapter {
        self.adapter.as_ref()
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn probe(&self) -> &dyn MemoryProbe {
        self.probe.as_ref()
    }

    /// Key the store would use for `req`.
    pub fn key_for<B>(&self, req: &Request<B>) -> CacheKey {
        self.keys.key_for(req)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<_> = self.entries.iter().map(|item| item.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn entry(&self, key: &str) -> Option<Arc<CacheEntry>> {
        self.entries.get(key).map(|item| item.value().clone())
    }

    pub fn entry_info(&self, key: &str) -> Option<EntryInfo> {
        self.entries.get(key).map(|item| item.value().info())
    }

    pub(crate) fn entries(&self) -> &DashMap<CacheKey, Arc<CacheEntry>> {
        &self.entries
    }

    /// Answers `req` from the cache or through `upstream`.
    pub async fn handle<S, ReqBody, ResBody>(
        self: &Arc<Self>,
        upstream: S,
        mut req: Request<ReqBody>,
    ) -> Result<Response<ProxyBody>, BoxError>
    where
        S: Service<Request<ReqBody>, Response = Response<ResBody>> + Send + 'static,
        S::Error: Into<BoxError> + Send,
        S::Future: Send + 'static,
        ReqBody: Default + Send + 'static,
        ResBody: Body<Data = Bytes> + Send + 'static,
        ResBody::Error: Into<BoxError> + Send,
    {
        self.stats.record_request();
        if let Some(host) = self.config.host_override() {
            req.headers_mut().insert(HOST, host.clone());
        }

        let key = self.keys.key_for(&req);
        let request_id = self
            .config
            .event_log()
            .enabled
            .then(|| RequestId::ensure(&mut req));

        if let Some(reason) = self.config.bypass_reason(&req) {
            self.stats.record_bypass();
            tracing::debug!(key = %key, reason = reason.as_str(), "cache bypassed");
            self.emit(CacheEventType::Bypass, &key, |event| {
                with_request(event, &request_id).with_detail(reason.as_str())
            });
            return Ok(forward(upstream, req, &key).await);
        }

        let created = match self.entries.entry(key.clone()) {
            Entry::Occupied(occupied) => Err(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                let entry = Arc::new(CacheEntry::pending(
                    key.clone(),
                    RefreshMetadata::from_request(&req),
                ));
                vacant.insert(entry.clone());
                Ok(entry)
            }
        };

        let entry = match created {
            Ok(entry) => entry,
            Err(existing) => return Ok(self.serve_existing(existing, upstream, &request_id).await),
        };

        if let Some(reader) = self.adapter.reader() {
            match reader.get(&key).await {
                Ok(Some(payload)) => match self
                    .codec
                    .decode(&payload)
                    .and_then(|persisted| entry.restore(persisted, self.config.success_statuses()))
                {
                    Ok(()) => {
                        if let Some(view) = entry.view() {
                            self.stats.record_external_hit();
                            tracing::info!(key = %key, "HIT (external)");
                            self.emit(CacheEventType::ExternalHit, &key, |event| {
                                with_request(event, &request_id)
                            });
                            #[cfg(feature = "metrics")]
                            counter!("tower_proxy_cache.external_hit").increment(1);
                            return Ok(cached_response(&view));
                        }
                    }
                    Err(err) => {
                        tracing::warn!(key = %key, error = %err, "ignoring unusable external entry");
                    }
                },
                Ok(None) => {
                    tracing::debug!(key = %key, "MISS (memory + external)");
                }
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "adapter read failed");
                }
            }
        } else {
            tracing::debug!(key = %key, "MISS (memory)");
        }

        self.stats.record_miss();
        self.emit(CacheEventType::Miss, &key, |event| {
            with_request(event, &request_id).with_method(req.method().clone())
        });
        #[cfg(feature = "metrics")]
        counter!("tower_proxy_cache.miss").increment(1);

        Ok(self.populate_from_upstream(entry, upstream, req).await)
    }

    async fn serve_existing<S, ReqBody, ResBody>(
        self: &Arc<Self>,
        entry: Arc<CacheEntry>,
        upstream: S,
        request_id: &Option<RequestId>,
    ) -> Response<ProxyBody>
    where
        S: Service<Request<ReqBody>, Response = Response<ResBody>> + Send + 'static,
        S::Error: Into<BoxError> + Send,
        S::Future: Send + 'static,
        ReqBody: Default + Send + 'static,
        ResBody: Body<Data = Bytes> + Send + 'static,
        ResBody::Error: Into<BoxError> + Send,
    {
        let key = entry.key().clone();
        match entry.observe() {
            Observation::Serve(view) => {
                self.stats.record_hit();
                tracing::debug!(key = %key, hits = view.hits, "HIT");
                self.emit(CacheEventType::Hit, &key, |event| {
                    with_request(event, request_id).with_hits(view.hits)
                });
                #[cfg(feature = "metrics")]
                counter!("tower_proxy_cache.hit").increment(1);
                cached_response(&view)
            }
            Observation::ServeStale(view) => {
                self.stats.record_hit();
                tracing::info!(key = %key, hits = view.hits, "serving stale entry; refreshing");
                self.emit(CacheEventType::Hit, &key, |event| {
                    with_request(event, request_id)
                        .with_hits(view.hits)
                        .with_detail("stale")
                });
                #[cfg(feature = "metrics")]
                counter!("tower_proxy_cache.stale_hit").increment(1);
                self.refresh(&entry, upstream);
                cached_response(&view)
            }
            Observation::Pooled => {
                self.stats.record_pooled();
                tracing::debug!(key = %key, pooled = entry.pooled(), "pooled");
                self.emit(CacheEventType::Pooled, &key, |event| {
                    with_request(event, request_id)
                });
                #[cfg(feature = "metrics")]
                counter!("tower_proxy_cache.pooled").increment(1);

                match entry.wait_ready().await {
                    Readiness::Ready => match entry.view() {
                        Some(view) => cached_response(&view),
                        None => failure_response(),
                    },
                    Readiness::Pending | Readiness::Failed => failure_response(),
                }
            }
        }
    }

    /// Starts (or joins) the refresh of `entry`, replaying its original
    /// request through `upstream`.
    ///
    /// Returns `None` for entries that are not stale: a ready entry that was
    /// just refreshed is never replayed a second time.
    pub fn refresh<S, ReqBody, ResBody>(
        self: &Arc<Self>,
        entry: &Arc<CacheEntry>,
        upstream: S,
    ) -> Option<RefreshHandle>
    where
        S: Service<Request<ReqBody>, Response = Response<ResBody>> + Send + 'static,
        S::Error: Into<BoxError> + Send,
        S::Future: Send + 'static,
        ReqBody: Default + Send + 'static,
        ResBody: Body + Send + 'static,
        ResBody::Data: Send,
        ResBody::Error: Into<BoxError>,
    {
        entry.begin_refresh(|| spawn_refresh(self.clone(), entry.clone(), upstream))
    }

    async fn populate_from_upstream<S, ReqBody, ResBody>(
        self: &Arc<Self>,
        entry: Arc<CacheEntry>,
        upstream: S,
        req: Request<ReqBody>,
    ) -> Response<ProxyBody>
    where
        S: Service<Request<ReqBody>, Response = Response<ResBody>> + Send + 'static,
        S::Error: Into<BoxError> + Send,
        S::Future: Send + 'static,
        ReqBody: Send + 'static,
        ResBody: Body<Data = Bytes> + Send + 'static,
        ResBody::Error: Into<BoxError> + Send,
    {
        let key = entry.key().clone();
        let started = Instant::now();

        let response = match upstream.oneshot(req).await {
            Ok(response) => response,
            Err(err) => {
                let err: BoxError = err.into();
                self.abandon(&entry, &CacheError::UpstreamTransport(err.to_string()));
                return proxy_error_response();
            }
        };
        #[cfg(feature = "metrics")]
        histogram!("tower_proxy_cache.upstream_latency").record(started.elapsed().as_secs_f64());

        let (parts, body) = response.into_parts();
        if !self.config.success_statuses().is_success(parts.status) {
            self.abandon(&entry, &CacheError::NonSuccessStatus(parts.status));
            return Response::from_parts(parts, body.map_err(Into::into).boxed_unsync());
        }

        let (tx, mut rx) = mpsc::channel::<Result<Frame<Bytes>, BoxError>>(FRAME_BUFFER);
        let status = parts.status;
        let headers = parts.headers.clone();
        let store = self.clone();

        tokio::spawn(async move {
            let mut body = Box::pin(body);
            let mut buffer = BytesMut::new();
            let mut client_open = true;

            let captured = loop {
                match body.frame().await {
                    None => break Ok(buffer.freeze()),
                    Some(Ok(frame)) => {
                        if let Some(data) = frame.data_ref() {
                            buffer.extend_from_slice(data);
                        }
                        if client_open && tx.send(Ok(frame)).await.is_err() {
                            client_open = false;
                            tracing::debug!(key = %key, "client went away; finishing upstream fetch");
                        }
                    }
                    Some(Err(err)) => {
                        let err: BoxError = err.into();
                        let message = err.to_string();
                        if client_open {
                            let _ = tx.send(Err(err)).await;
                        }
                        break Err(CacheError::UpstreamTransport(message));
                    }
                }
            };
            drop(tx);

            store.finish_population(entry, status, headers, captured, started);
        });

        let frames = futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx));
        Response::from_parts(parts, StreamBody::new(frames).boxed_unsync())
    }

    fn finish_population(
        &self,
        entry: Arc<CacheEntry>,
        status: StatusCode,
        headers: HeaderMap,
        captured: Result<Bytes, CacheError>,
        started: Instant,
    ) {
        let key = entry.key().clone();
        let populated = captured.and_then(|body| {
            entry.populate(
                CachedResponse::new(status, headers, body),
                self.config.success_statuses(),
            )
        });

        match populated {
            Ok(()) => {
                let size = entry.body_len();
                self.stats.record_store();
                tracing::info!(
                    key = %key,
                    size_bytes = size,
                    latency_ms = saturating_millis(started.elapsed()),
                    "cached"
                );
                self.emit(CacheEventType::Store, &key, |event| {
                    event
                        .with_status(status)
                        .with_size(size)
                        .with_latency(started.elapsed())
                });
                #[cfg(feature = "metrics")]
                {
                    counter!("tower_proxy_cache.store").increment(1);
                    gauge!("tower_proxy_cache.entries").set(self.entries.len() as f64);
                }
                if self.is_current(&entry) {
                    self.persist(&entry);
                }
            }
            Err(err) => self.abandon(&entry, &err),
        }
    }

    // Pending → removed.
    fn abandon(&self, entry: &Arc<CacheEntry>, err: &CacheError) {
        entry.fail();
        self.discard(entry);
        if err.is_upstream() {
            tracing::info!(key = %entry.key(), error = %err, "will not cache");
        } else {
            tracing::warn!(key = %entry.key(), error = %err, "dropping pending entry");
        }
    }

    /// Removes `entry` if the map still points at this exact entry.
    pub(crate) fn discard(&self, entry: &Arc<CacheEntry>) -> bool {
        self.entries
            .remove_if(entry.key(), |_, current| Arc::ptr_eq(current, entry))
            .is_some()
    }

    pub(crate) fn is_current(&self, entry: &Arc<CacheEntry>) -> bool {
        self.entries
            .get(entry.key())
            .is_some_and(|current| Arc::ptr_eq(current.value(), entry))
    }

    /// Best-effort background write of a ready entry to the adapter.
    pub(crate) fn persist(&self, entry: &Arc<CacheEntry>) {
        if self.adapter.writer().is_none() {
            return;
        }
        let Some(snapshot) = entry.persisted() else {
            return;
        };
        let key = entry.key().clone();
        let payload = match self.codec.encode(&snapshot) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(key = %key, error = %err, "failed to serialize entry");
                return;
            }
        };

        let adapter = self.adapter.clone();
        tokio::spawn(async move {
            let Some(writer) = adapter.writer() else {
                return;
            };
            match writer.set(&key, payload).await {
                Ok(()) => tracing::debug!(key = %key, "saved to adapter storage"),
                Err(err @ CacheError::PayloadTooLarge { .. }) => {
                    tracing::warn!(key = %key, error = %err, "entry too large for adapter storage");
                }
                Err(err) => {
                    tracing::error!(key = %key, error = %err, "failed to save to adapter storage");
                }
            }
        });
    }

    /// Deletes matching entries, or flags them stale when stale retention is
    /// on, then asks the adapter to purge the same pattern.
    ///
    /// With stale retention only ready entries are flagged; pending and
    /// refreshing entries already have a fetch in flight.
    pub async fn clear(&self, pattern: Option<&KeyPattern>) -> ClearOutcome {
        let matches = |key: &CacheKey| pattern.map_or(true, |pattern| pattern.matches(key.as_str()));

        let outcome = if self.config.allow_stale() {
            let flagged = self
                .entries
                .iter()
                .filter(|item| matches(item.key()) && item.value().mark_stale())
                .count();
            ClearOutcome::MarkedStale(flagged)
        } else {
            let mut removed = 0;
            self.entries.retain(|key, _| {
                let doomed = matches(key);
                removed += usize::from(doomed);
                !doomed
            });
            ClearOutcome::Removed(removed)
        };

        let affected = match outcome {
            ClearOutcome::Removed(count) | ClearOutcome::MarkedStale(count) => count,
        };
        self.stats.record_invalidations(affected as u64);
        tracing::info!(
            pattern = pattern.map(KeyPattern::as_str).unwrap_or("*"),
            ?outcome,
            "cleared memory cache"
        );
        self.emit(
            CacheEventType::Invalidate,
            &CacheKey::from(pattern.map(KeyPattern::as_str).unwrap_or("*")),
            |event| event.with_detail(format!("{outcome:?}")),
        );
        #[cfg(feature = "metrics")]
        counter!("tower_proxy_cache.invalidated").increment(affected as u64);

        if let Some(purger) = self.adapter.purger() {
            if let Err(err) = purger.clear(pattern).await {
                tracing::warn!(error = %err, "failed to clear adapter storage");
            }
        }

        outcome
    }

    /// Polls the adapter's staleness signal once and clears the store when it
    /// fires. Returns whether a clear happened.
    pub async fn check_staleness(&self) -> Result<bool, CacheError> {
        let Some(signal) = self.adapter.staleness() else {
            return Ok(false);
        };
        if !signal.is_stale().await? {
            return Ok(false);
        }
        tracing::info!(adapter = self.adapter.name(), "adapter reported stale cache");
        self.clear(None).await;
        Ok(true)
    }

    pub(crate) fn emit<F>(&self, kind: CacheEventType, key: &CacheKey, build: F)
    where
        F: FnOnce(CacheEvent) -> CacheEvent,
    {
        let config = self.config.event_log();
        if !config.enabled {
            return;
        }
        build(CacheEvent::new(kind, key.as_str())).log(config);
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("entries", &self.entries.len())
            .field("adapter", &self.adapter.name())
            .field("config", &self.config)
            .finish()
    }
}

fn with_request(event: CacheEvent, request_id: &Option<RequestId>) -> CacheEvent {
    match request_id {
        Some(id) => event.with_request_id(id.clone()),
        None => event,
    }
}

async fn forward<S, ReqBody, ResBody>(
    upstream: S,
    req: Request<ReqBody>,
    key: &CacheKey,
) -> Response<ProxyBody>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Error: Into<BoxError>,
    ResBody: Body<Data = Bytes> + Send + 'static,
    ResBody::Error: Into<BoxError>,
{
    match upstream.oneshot(req).await {
        Ok(response) => response.map(|body| body.map_err(Into::into).boxed_unsync()),
        Err(err) => {
            let err: BoxError = err.into();
            tracing::warn!(key = %key, error = %err, "proxy request error");
            proxy_error_response()
        }
    }
}

pub(crate) fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn text_response(status: StatusCode, body: &'static str) -> Response<ProxyBody> {
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

fn failure_response() -> Response<ProxyBody> {
    text_response(StatusCode::INTERNAL_SERVER_ERROR, FAILURE_BODY)
}

fn proxy_error_response() -> Response<ProxyBody> {
    text_response(StatusCode::INTERNAL_SERVER_ERROR, PROXY_ERROR_BODY)
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Builds the response for a cache-served request: stored status, headers,
/// and body plus the `x-cache-*` metadata headers.
pub(crate) fn cached_response(view: &EntryView) -> Response<ProxyBody> {
    let stored = &view.response;
    let mut response = Response::new(full(stored.body.clone()));
    *response.status_mut() = stored.status;

    let headers = response.headers_mut();
    *headers = stored.headers.clone();
    headers.remove(TRANSFER_ENCODING);
    headers.remove(CONNECTION);

    headers.insert(
        X_CACHE_SERVER_VERSION,
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    if let Ok(key) = HeaderValue::from_str(view.key.as_str()) {
        headers.insert(X_CACHE_KEY, key);
    }
    if let Ok(date) = HeaderValue::from_str(&timestamp(view.created_at)) {
        headers.insert(X_CACHE_DATE, date);
    }
    if let Some(updated) = view
        .last_updated
        .and_then(|at| HeaderValue::from_str(&timestamp(at)).ok())
    {
        headers.insert(X_CACHE_UPDATED, updated);
    }
    headers.insert(X_CACHE_HITS, HeaderValue::from(view.hits));

    response
}
