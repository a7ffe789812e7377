use std::error::Error as StdError;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{HeaderValue, Method, Request, Response};
use http_body::Body;
use http_body_util::combinators::UnsyncBoxBody;
use tower::{Layer, Service};

use crate::adapter::{Adapter, TtlAdapter};
use crate::codec::CacheCodec;
use crate::config::{ProxyCacheConfig, SuccessStatuses};
use crate::eviction::MemoryProbe;
use crate::key::{DeviceClassifier, KeyPattern};
use crate::logging::EventLogConfig;
use crate::store::CacheStore;

pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Body of every response produced by the proxy cache: either a cached body
/// or the live upstream stream.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Caching reverse-proxy layer for Tower services.
///
/// The wrapped service is the upstream. Every clone of the layer, and every
/// service it produces, shares one [`CacheStore`]. Create instances via
/// [`ProxyCacheLayer::builder`], or wrap a store you already hold with
/// [`ProxyCacheLayer::from_store`].
#[derive(Clone)]
pub struct ProxyCacheLayer {
    store: Arc<CacheStore>,
}

/// Builder for configuring [`ProxyCacheLayer`] instances.
pub struct ProxyCacheLayerBuilder {
    config: ProxyCacheConfig,
    adapter: Arc<dyn Adapter>,
    codec: Option<Box<dyn FnOnce(CacheStore) -> CacheStore + Send>>,
    probe: Option<Box<dyn FnOnce(CacheStore) -> CacheStore + Send>>,
}

impl ProxyCacheLayerBuilder {
    pub fn new() -> Self {
        Self {
            config: ProxyCacheConfig::default(),
            adapter: Arc::new(TtlAdapter::default()),
            codec: None,
            probe: None,
        }
    }

    /// Replaces the configuration with a pre-built value.
    pub fn config(mut self, config: ProxyCacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the adapter that supplies staleness signals and external storage.
    pub fn adapter(mut self, adapter: impl Adapter) -> Self {
        self.adapter = Arc::new(adapter);
        self
    }

    pub fn shared_adapter(mut self, adapter: Arc<dyn Adapter>) -> Self {
        self.adapter = adapter;
        self
    }

    pub fn codec(mut self, codec: impl CacheCodec) -> Self {
        self.codec = Some(Box::new(move |store| store.with_codec(codec)));
        self
    }

    pub fn memory_probe(mut self, probe: impl MemoryProbe) -> Self {
        self.probe = Some(Box::new(move |store| store.with_memory_probe(probe)));
        self
    }

    /// Keep serving entries flagged stale while a refresh runs, instead of
    /// dropping them when the adapter reports staleness.
    pub fn allow_stale(mut self, allow: bool) -> Self {
        self.config = self.config.with_allow_stale(allow);
        self
    }

    pub fn success_statuses(mut self, statuses: SuccessStatuses) -> Self {
        self.config = self.config.with_success_statuses(statuses);
        self
    }

    /// Resident memory, in bytes, above which entries are evicted.
    pub fn memory_threshold(mut self, bytes: u64) -> Self {
        self.config = self.config.with_memory_threshold(bytes);
        self
    }

    pub fn memory_check_interval(mut self, interval: Option<Duration>) -> Self {
        self.config = self.config.with_memory_check_interval(interval);
        self
    }

    pub fn stale_check_interval(mut self, interval: Option<Duration>) -> Self {
        self.config = self.config.with_stale_check_interval(interval);
        self
    }

    /// Requests whose path and query match any pattern are never cached.
    pub fn ignore_patterns<I, P>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<KeyPattern>,
    {
        self.config = self.config.with_ignore_patterns(patterns);
        self
    }

    pub fn method_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Method) -> bool + Send + Sync + 'static,
    {
        self.config = self.config.with_method_predicate(predicate);
        self
    }

    /// Requests the predicate rejects bypass the cache entirely.
    pub fn cacheable_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Method, &http::Uri, &http::HeaderMap) -> bool + Send + Sync + 'static,
    {
        self.config = self.config.with_cacheable_predicate(predicate);
        self
    }

    /// Honor `Cache-Control: no-cache` / `no-store` and `Pragma: no-cache`
    /// on incoming requests.
    pub fn respect_cache_control(mut self, enabled: bool) -> Self {
        self.config = self.config.with_respect_cache_control(enabled);
        self
    }

    /// Rewrites the `Host` header before keying and forwarding.
    pub fn host_override(mut self, host: HeaderValue) -> Self {
        self.config = self.config.with_host_override(Some(host));
        self
    }

    pub fn classifier<C: DeviceClassifier>(mut self, classifier: C) -> Self {
        self.config = self.config.with_classifier(classifier);
        self
    }

    pub fn event_log(mut self, config: EventLogConfig) -> Self {
        self.config = self.config.with_event_log(config);
        self
    }

    /// Builds the store and the layer around it.
    ///
    /// Background watchers are not started; call [`CacheStore::start`] on
    /// [`ProxyCacheLayer::store`] once a runtime is available.
    pub fn build(self) -> ProxyCacheLayer {
        let mut store = CacheStore::with_shared_adapter(self.config, self.adapter);
        if let Some(apply) = self.codec {
            store = apply(store);
        }
        if let Some(apply) = self.probe {
            store = apply(store);
        }
        ProxyCacheLayer::from_store(Arc::new(store))
    }
}

impl Default for ProxyCacheLayerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyCacheLayer {
    /// Builds a layer with the default configuration and TTL adapter.
    pub fn new() -> Self {
        ProxyCacheLayerBuilder::new().build()
    }

    pub fn builder() -> ProxyCacheLayerBuilder {
        ProxyCacheLayerBuilder::new()
    }

    pub fn from_store(store: Arc<CacheStore>) -> Self {
        Self { store }
    }

    /// The shared store, for clearing, introspection, and starting watchers.
    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }
}

impl Default for ProxyCacheLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Layer<S> for ProxyCacheLayer {
    type Service = ProxyCacheService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ProxyCacheService {
            inner,
            store: self.store.clone(),
        }
    }
}

#[derive(Clone)]
pub struct ProxyCacheService<S> {
    inner: S,
    store: Arc<CacheStore>,
}

impl<S> ProxyCacheService<S> {
    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for ProxyCacheService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError> + Send,
    ReqBody: Default + Send + 'static,
    ResBody: Body<Data = Bytes> + Send + 'static,
    ResBody::Error: Into<BoxError> + Send,
{
    type Response = Response<ProxyBody>;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let inner = self.inner.clone();
        let store = self.store.clone();

        Box::pin(async move {
            tracing::trace!(method = %req.method(), uri = %req.uri(), "proxy_cache_call");
            store.handle(inner, req).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use http_body_util::{BodyExt, Full};
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::{service_fn, ServiceBuilder, ServiceExt};

    #[tokio::test]
    async fn layer_caches_through_the_shared_store() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let layer = ProxyCacheLayer::builder()
            .memory_check_interval(None)
            .build();
        let store = layer.store().clone();

        let svc = ServiceBuilder::new()
            .layer(layer)
            .service(service_fn(move |_req: Request<Full<Bytes>>| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Infallible>(Response::new(Full::from("hello")))
                }
            }));

        for _ in 0..3 {
            let req = Request::builder()
                .uri("/greeting")
                .header(http::header::HOST, "origin.test")
                .body(Full::default())
                .unwrap();
            let response = svc.clone().oneshot(req).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let body = response.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(body, "hello");
            // Let the capture task finish before the next request.
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.entry_info("not_phone:origin.test:/greeting").unwrap().hits,
            2
        );
    }

    #[tokio::test]
    async fn builder_settings_reach_the_store() {
        let layer = ProxyCacheLayer::builder()
            .allow_stale(true)
            .memory_threshold(1024)
            .respect_cache_control(true)
            .host_override(HeaderValue::from_static("spoofed.test"))
            .memory_probe(|| Some(0u64))
            .build();

        let config = layer.store().config();
        assert!(config.allow_stale());
        assert_eq!(config.memory_threshold(), 1024);
        assert!(config.respect_cache_control());
        assert_eq!(config.host_override().unwrap(), "spoofed.test");
        assert_eq!(layer.store().adapter().name(), "ttl");
    }
}
