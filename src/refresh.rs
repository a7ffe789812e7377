//! Stale-while-revalidate refresh.
//!
//! A refresh replays the request that originally populated an entry, runs the
//! upstream response through the same validation as a first population, and
//! swaps the result in wholesale. At most one refresh is in flight per entry;
//! concurrent triggers share a single [`RefreshHandle`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use http::{HeaderMap, Method, Request, Uri};
use http_body::Body;
use http_body_util::BodyExt;
use tower::{Service, ServiceExt};

#[cfg(feature = "metrics")]
use metrics::{counter, histogram};

use crate::entry::{CacheEntry, CachedResponse};
use crate::error::CacheError;
use crate::layer::BoxError;
use crate::logging::{saturating_millis, CacheEventType};
use crate::store::CacheStore;

/// Request data needed to replay the populating request.
#[derive(Debug, Clone)]
pub struct RefreshMetadata {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

impl RefreshMetadata {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap) -> Self {
        Self {
            method,
            uri,
            headers,
        }
    }

    /// Captures method, URI, and every header of `req`.
    pub fn from_request<B>(req: &Request<B>) -> Self {
        Self {
            method: req.method().clone(),
            uri: req.uri().clone(),
            headers: req.headers().clone(),
        }
    }

    /// Rebuilds the request with an empty body.
    pub fn to_request<B: Default>(&self) -> Request<B> {
        let mut req = Request::new(B::default());
        *req.method_mut() = self.method.clone();
        *req.uri_mut() = self.uri.clone();
        *req.headers_mut() = self.headers.clone();
        req
    }
}

/// How a refresh ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// New data was swapped in.
    Refreshed,
    /// The upstream fetch failed or was rejected; the entry was discarded.
    Failed,
}

/// Shared handle to an in-flight refresh.
///
/// Cloning is cheap and every clone resolves to the same outcome. The refresh
/// runs on its own task, so dropping every handle does not cancel it.
#[derive(Clone)]
pub struct RefreshHandle {
    outcome: Shared<BoxFuture<'static, RefreshOutcome>>,
    finished: Arc<AtomicBool>,
}

impl RefreshHandle {
    /// Spawns `fut` on the current runtime.
    pub fn spawn<F>(fut: F) -> Self
    where
        F: std::future::Future<Output = RefreshOutcome> + Send + 'static,
    {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let task = tokio::spawn(async move {
            let outcome = fut.await;
            flag.store(true, Ordering::Release);
            outcome
        });

        let outcome = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::error!(error = %err, "refresh task aborted");
                    RefreshOutcome::Failed
                }
            }
        }
        .boxed()
        .shared();

        Self { outcome, finished }
    }

    /// Waits for the refresh to finish.
    pub async fn wait(&self) -> RefreshOutcome {
        self.outcome.clone().await
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Returns `true` when both handles refer to the same refresh.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.finished, &other.finished)
    }
}

impl fmt::Debug for RefreshHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshHandle")
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Starts the refresh task for `entry`. Callers go through
/// [`CacheEntry::begin_refresh`] so that only one task is spawned.
pub(crate) fn spawn_refresh<S, ReqBody, ResBody>(
    store: Arc<CacheStore>,
    entry: Arc<CacheEntry>,
    upstream: S,
) -> RefreshHandle
where
    S: Service<Request<ReqBody>, Response = http::Response<ResBody>> + Send + 'static,
    S::Error: Into<BoxError> + Send,
    S::Future: Send + 'static,
    ReqBody: Default + Send + 'static,
    ResBody: Body + Send + 'static,
    ResBody::Data: Send,
    ResBody::Error: Into<BoxError>,
{
    RefreshHandle::spawn(async move {
        let key = entry.key().clone();
        tracing::debug!(key = %key, "refresh started");
        #[cfg(feature = "metrics")]
        counter!("tower_proxy_cache.refresh.started").increment(1);

        let started = Instant::now();
        match fetch(&entry, upstream, store.config().success_statuses()).await {
            Ok(response) => {
                let size = response.body.len();
                entry.replace(response);
                store.stats().record_refresh();
                store.emit(CacheEventType::Refresh, &key, |event| {
                    event.with_size(size).with_latency(started.elapsed())
                });
                tracing::info!(
                    key = %key,
                    size_bytes = size,
                    latency_ms = saturating_millis(started.elapsed()),
                    "refreshed stale entry"
                );
                #[cfg(feature = "metrics")]
                {
                    counter!("tower_proxy_cache.refresh.success").increment(1);
                    histogram!("tower_proxy_cache.refresh.latency")
                        .record(started.elapsed().as_secs_f64());
                }

                if store.is_current(&entry) {
                    store.persist(&entry);
                }
                RefreshOutcome::Refreshed
            }
            Err(err) => {
                entry.abandon_refresh();
                store.discard(&entry);
                store.stats().record_refresh_failure();
                store.emit(CacheEventType::RefreshFailure, &key, |event| {
                    event.with_detail(err.to_string())
                });
                tracing::warn!(key = %key, error = %err, "refresh failed; entry discarded");
                #[cfg(feature = "metrics")]
                counter!("tower_proxy_cache.refresh.failure").increment(1);
                RefreshOutcome::Failed
            }
        }
    })
}

async fn fetch<S, ReqBody, ResBody>(
    entry: &CacheEntry,
    upstream: S,
    statuses: &crate::config::SuccessStatuses,
) -> Result<CachedResponse, CacheError>
where
    S: Service<Request<ReqBody>, Response = http::Response<ResBody>>,
    S::Error: Into<BoxError>,
    ReqBody: Default,
    ResBody: Body,
    ResBody::Error: Into<BoxError>,
{
    let req = entry.origin().to_request::<ReqBody>();
    let response = upstream
        .oneshot(req)
        .await
        .map_err(|err| CacheError::UpstreamTransport(err.into().to_string()))?;

    let (parts, body) = response.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|err| CacheError::UpstreamTransport(err.into().to_string()))?
        .to_bytes();

    let response = CachedResponse::new(parts.status, parts.headers, body);
    response.validate(statuses)?;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{ACCEPT, HOST};
    use std::time::Duration;

    #[test]
    fn metadata_replays_method_uri_and_headers() {
        let req = Request::builder()
            .method(Method::GET)
            .uri("/articles?page=2")
            .header(HOST, "origin.test")
            .header(ACCEPT, "text/html")
            .body(())
            .unwrap();

        let metadata = RefreshMetadata::from_request(&req);
        let replayed: Request<String> = metadata.to_request();

        assert_eq!(replayed.method(), Method::GET);
        assert_eq!(replayed.uri(), "/articles?page=2");
        assert_eq!(replayed.headers()[HOST], "origin.test");
        assert_eq!(replayed.headers()[ACCEPT], "text/html");
        assert!(replayed.body().is_empty());
    }

    #[tokio::test]
    async fn handle_clones_share_one_outcome() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = RefreshHandle::spawn(async move {
            let _ = rx.await;
            RefreshOutcome::Failed
        });
        let clone = handle.clone();

        assert!(handle.ptr_eq(&clone));
        assert!(!handle.is_finished());

        tx.send(()).unwrap();
        assert_eq!(clone.wait().await, RefreshOutcome::Failed);
        assert_eq!(handle.wait().await, RefreshOutcome::Failed);
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn dropping_handles_does_not_cancel_the_task() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        drop(RefreshHandle::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = tx.send(());
            RefreshOutcome::Refreshed
        }));

        rx.await.expect("refresh task ran to completion");
    }
}
