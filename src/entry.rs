//! Cache entries and their lifecycle.
//!
//! ```text
//!  Pending ──ok──▶ Ready ──stale signal──▶ Stale ──next request──▶ Refreshing
//!     │              ▲                                                 │
//!     │              └──────────────────── refresh ok ◀────────────────┤
//!     └── empty / non-success / transport error ──▶ removed ◀── refresh failed
//! ```
//!
//! Each entry owns a readiness signal. Callers that arrive while the entry is
//! still pending subscribe to it and are resolved by the single populating
//! fetch.

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, StatusCode};
use serde::Serialize;
use tokio::sync::watch;

use crate::codec::PersistedEntry;
use crate::config::SuccessStatuses;
use crate::error::CacheError;
use crate::key::CacheKey;
use crate::refresh::{RefreshHandle, RefreshMetadata};

/// Status, headers, and body captured from an upstream response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CachedResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Rejects responses that must never become servable.
    pub fn validate(&self, statuses: &SuccessStatuses) -> Result<(), CacheError> {
        if !statuses.is_success(self.status) {
            return Err(CacheError::NonSuccessStatus(self.status));
        }
        if self.body.is_empty() {
            return Err(CacheError::EmptyUpstreamResponse);
        }
        Ok(())
    }
}

/// Lifecycle state of a [`CacheEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Pending,
    Ready,
    Stale,
    Refreshing,
}

/// Value carried by an entry's readiness signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Pending,
    Ready,
    Failed,
}

/// What a request observed when it looked at an existing entry.
pub(crate) enum Observation {
    /// Servable data; the hit was counted.
    Serve(EntryView),
    /// Servable data from a stale entry. The entry is already `Refreshing`
    /// and this caller must start the refresh.
    ServeStale(EntryView),
    /// Data is not there yet (or is being replaced); the pooled counter was
    /// bumped and the caller should wait for readiness.
    Pooled,
}

/// Consistent snapshot of everything needed to answer from the cache.
#[derive(Debug, Clone)]
pub struct EntryView {
    pub key: CacheKey,
    pub response: Arc<CachedResponse>,
    pub created_at: DateTime<Utc>,
    pub last_updated: Option<DateTime<Utc>>,
    pub hits: u64,
}

/// Serializable summary of an entry for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct EntryInfo {
    pub key: String,
    pub state: EntryState,
    pub stale: bool,
    pub status: Option<u16>,
    pub size_bytes: usize,
    pub hits: u64,
    pub pooled: u64,
    pub created_at: DateTime<Utc>,
    pub last_updated: Option<DateTime<Utc>>,
    pub refreshing: bool,
}

struct EntryInner {
    state: EntryState,
    created_at: DateTime<Utc>,
    response: Option<Arc<CachedResponse>>,
    hits: u64,
    pooled: u64,
    last_updated: Option<DateTime<Utc>>,
    refresh: Option<RefreshHandle>,
}

/// One cached response plus its lifecycle metadata.
///
/// Entries are owned by the [`CacheStore`](crate::store::CacheStore); the
/// mutable fields sit behind a per-entry mutex that is never held across an
/// await point.
pub struct CacheEntry {
    key: CacheKey,
    origin: RefreshMetadata,
    ready_tx: watch::Sender<Readiness>,
    inner: Mutex<EntryInner>,
}

impl CacheEntry {
    /// Creates an entry in the `Pending` state.
    pub fn pending(key: CacheKey, origin: RefreshMetadata) -> Self {
        let (ready_tx, _) = watch::channel(Readiness::Pending);
        Self {
            key,
            origin,
            ready_tx,
            inner: Mutex::new(EntryInner {
                state: EntryState::Pending,
                created_at: Utc::now(),
                response: None,
                hits: 0,
                pooled: 0,
                last_updated: None,
                refresh: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EntryInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!(
                    key = %self.key,
                    "recovered poisoned cache entry lock"
                );
                poisoned.into_inner()
            }
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Request metadata replayed when the entry is refreshed.
    pub fn origin(&self) -> &RefreshMetadata {
        &self.origin
    }

    pub fn state(&self) -> EntryState {
        self.lock().state
    }

    pub fn is_stale(&self) -> bool {
        matches!(self.state(), EntryState::Stale | EntryState::Refreshing)
    }

    pub fn is_servable(&self) -> bool {
        self.state() != EntryState::Pending
    }

    pub fn hits(&self) -> u64 {
        self.lock().hits
    }

    pub fn pooled(&self) -> u64 {
        self.lock().pooled
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.lock().created_at
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.lock().last_updated
    }

    pub fn body_len(&self) -> usize {
        self.lock()
            .response
            .as_ref()
            .map_or(0, |response| response.body.len())
    }

    pub fn response(&self) -> Option<Arc<CachedResponse>> {
        self.lock().response.clone()
    }

    /// The in-flight refresh, if any.
    pub fn refresh_handle(&self) -> Option<RefreshHandle> {
        self.lock().refresh.clone()
    }

    pub fn readiness(&self) -> Readiness {
        *self.ready_tx.borrow()
    }

    /// Records a request arriving for this key and decides how to answer it.
    pub(crate) fn observe(&self) -> Observation {
        let mut inner = self.lock();
        match inner.state {
            EntryState::Pending | EntryState::Refreshing => {
                inner.pooled += 1;
                Observation::Pooled
            }
            EntryState::Ready | EntryState::Stale => {
                inner.hits += 1;
                let Some(view) = view_of(&self.key, &inner) else {
                    return Observation::Pooled;
                };
                if inner.state == EntryState::Stale {
                    // Only the caller that flips the state starts the refresh.
                    inner.state = EntryState::Refreshing;
                    Observation::ServeStale(view)
                } else {
                    Observation::Serve(view)
                }
            }
        }
    }

    /// Snapshot of the servable data, or `None` while pending.
    pub fn view(&self) -> Option<EntryView> {
        view_of(&self.key, &self.lock())
    }

    /// Waits until the entry leaves `Pending`.
    ///
    /// Returns immediately for entries that already hold data, including
    /// stale and refreshing ones.
    pub async fn wait_ready(&self) -> Readiness {
        let mut rx = self.ready_tx.subscribe();
        let outcome = rx
            .wait_for(|readiness| *readiness != Readiness::Pending)
            .await
            .map(|readiness| *readiness);
        // The sender lives as long as `self`, so the channel cannot close here.
        outcome.unwrap_or(Readiness::Failed)
    }

    /// `Pending → Ready` from an upstream response.
    ///
    /// On validation failure the readiness signal resolves to `Failed`; the
    /// caller is responsible for removing the entry from the store.
    pub(crate) fn populate(
        &self,
        response: CachedResponse,
        statuses: &SuccessStatuses,
    ) -> Result<(), CacheError> {
        if let Err(err) = response.validate(statuses) {
            self.fail();
            return Err(err);
        }

        let mut inner = self.lock();
        if inner.state != EntryState::Pending {
            return Err(CacheError::Backend(format!(
                "entry {} populated twice",
                self.key
            )));
        }
        inner.state = EntryState::Ready;
        inner.response = Some(Arc::new(response));
        inner.created_at = Utc::now();
        inner.pooled = 0;
        drop(inner);

        self.ready_tx.send_replace(Readiness::Ready);
        Ok(())
    }

    /// `Pending → Ready` from a persisted envelope.
    pub(crate) fn restore(
        &self,
        persisted: PersistedEntry,
        statuses: &SuccessStatuses,
    ) -> Result<(), CacheError> {
        persisted.response.validate(statuses)?;

        let mut inner = self.lock();
        if inner.state != EntryState::Pending {
            return Err(CacheError::Backend(format!(
                "entry {} restored after population",
                self.key
            )));
        }
        inner.state = EntryState::Ready;
        inner.response = Some(Arc::new(persisted.response));
        inner.created_at = persisted.created_at;
        inner.pooled = 0;
        drop(inner);

        self.ready_tx.send_replace(Readiness::Ready);
        Ok(())
    }

    /// `Pending → removed`. Wakes every pooled waiter with `Failed`.
    pub(crate) fn fail(&self) {
        self.ready_tx.send_if_modified(|readiness| {
            if *readiness == Readiness::Pending {
                *readiness = Readiness::Failed;
                true
            } else {
                false
            }
        });
    }

    /// `Ready → Stale`. Returns `false` when the entry is not in a state that
    /// can be flagged (pending, already stale, or refreshing).
    pub(crate) fn mark_stale(&self) -> bool {
        let mut inner = self.lock();
        if inner.state == EntryState::Ready {
            inner.state = EntryState::Stale;
            true
        } else {
            false
        }
    }

    /// `Stale → Refreshing`, memoized.
    ///
    /// Returns the live handle when a refresh is already running. Otherwise
    /// calls `start` once, installs the handle it returns, and moves the
    /// entry to `Refreshing`, but only while the entry is stale (or was
    /// flagged `Refreshing` by [`observe`](Self::observe) and has no handle
    /// yet). Ready and pending entries start nothing and yield `None`.
    pub(crate) fn begin_refresh<F>(&self, start: F) -> Option<RefreshHandle>
    where
        F: FnOnce() -> RefreshHandle,
    {
        let mut inner = self.lock();
        if let Some(handle) = inner.refresh.as_ref().filter(|handle| !handle.is_finished()) {
            return Some(handle.clone());
        }
        let startable = match inner.state {
            EntryState::Stale => true,
            EntryState::Refreshing => inner.refresh.is_none(),
            EntryState::Pending | EntryState::Ready => false,
        };
        if !startable {
            return None;
        }
        let handle = start();
        inner.refresh = Some(handle.clone());
        inner.state = EntryState::Refreshing;
        Some(handle)
    }

    /// `Refreshing → Ready` with a wholesale swap of the response.
    pub(crate) fn replace(&self, response: CachedResponse) {
        let mut inner = self.lock();
        inner.response = Some(Arc::new(response));
        inner.state = EntryState::Ready;
        inner.hits = 0;
        inner.last_updated = Some(Utc::now());
        inner.refresh = None;
    }

    /// Drops the refresh handle after a failed refresh. The store removes the
    /// entry itself.
    pub(crate) fn abandon_refresh(&self) {
        self.lock().refresh = None;
    }

    /// Snapshot handed to write-capable adapters.
    pub fn persisted(&self) -> Option<PersistedEntry> {
        let inner = self.lock();
        inner.response.as_ref().map(|response| PersistedEntry {
            created_at: inner.created_at,
            response: CachedResponse::clone(response),
        })
    }

    pub fn info(&self) -> EntryInfo {
        let inner = self.lock();
        EntryInfo {
            key: self.key.to_string(),
            state: inner.state,
            stale: matches!(inner.state, EntryState::Stale | EntryState::Refreshing),
            status: inner.response.as_ref().map(|r| r.status.as_u16()),
            size_bytes: inner.response.as_ref().map_or(0, |r| r.body.len()),
            hits: inner.hits,
            pooled: inner.pooled,
            created_at: inner.created_at,
            last_updated: inner.last_updated,
            refreshing: inner.refresh.is_some(),
        }
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("state", &inner.state)
            .field("hits", &inner.hits)
            .field("pooled", &inner.pooled)
            .finish()
    }
}

fn view_of(key: &CacheKey, inner: &EntryInner) -> Option<EntryView> {
    inner.response.as_ref().map(|response| EntryView {
        key: key.clone(),
        response: response.clone(),
        created_at: inner.created_at,
        last_updated: inner.last_updated,
        hits: inner.hits,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refresh::RefreshOutcome;
    use http::Method;

    fn pending() -> CacheEntry {
        CacheEntry::pending(
            CacheKey::from("not_phone:example.com:/"),
            RefreshMetadata::new(Method::GET, http::Uri::from_static("/"), HeaderMap::new()),
        )
    }

    fn ok_response(body: &'static str) -> CachedResponse {
        CachedResponse::new(StatusCode::OK, HeaderMap::new(), Bytes::from_static(body.as_bytes()))
    }

    #[tokio::test]
    async fn populate_moves_pending_to_ready_and_resets_pooled() {
        let entry = pending();
        assert!(matches!(entry.observe(), Observation::Pooled));
        assert!(matches!(entry.observe(), Observation::Pooled));
        assert_eq!(entry.pooled(), 2);

        entry
            .populate(ok_response("hello"), &SuccessStatuses::default())
            .expect("valid response");

        assert_eq!(entry.state(), EntryState::Ready);
        assert_eq!(entry.pooled(), 0);
        assert_eq!(entry.wait_ready().await, Readiness::Ready);
        assert_eq!(entry.response().expect("data").body, "hello");
    }

    #[tokio::test]
    async fn empty_or_non_success_responses_fail_the_entry() {
        let statuses = SuccessStatuses::default();

        let empty = pending();
        let err = empty
            .populate(ok_response(""), &statuses)
            .expect_err("empty body rejected");
        assert!(matches!(err, CacheError::EmptyUpstreamResponse));
        assert_eq!(empty.wait_ready().await, Readiness::Failed);
        assert_eq!(empty.state(), EntryState::Pending);

        let not_found = pending();
        let response = CachedResponse::new(
            StatusCode::NOT_FOUND,
            HeaderMap::new(),
            Bytes::from_static(b"missing"),
        );
        let err = not_found
            .populate(response, &statuses)
            .expect_err("404 rejected");
        assert!(matches!(err, CacheError::NonSuccessStatus(StatusCode::NOT_FOUND)));
        assert_eq!(not_found.readiness(), Readiness::Failed);
    }

    #[test]
    fn observe_counts_hits_once_ready() {
        let entry = pending();
        entry
            .populate(ok_response("a"), &SuccessStatuses::default())
            .unwrap();

        assert!(matches!(entry.observe(), Observation::Serve(_)));
        match entry.observe() {
            Observation::Serve(view) => assert_eq!(view.hits, 2),
            _ => panic!("expected a servable view"),
        }
        assert_eq!(entry.hits(), 2);
    }

    #[tokio::test]
    async fn stale_entry_starts_exactly_one_refresh() {
        let entry = pending();
        entry
            .populate(ok_response("old"), &SuccessStatuses::default())
            .unwrap();
        assert!(entry.mark_stale());
        assert!(!entry.mark_stale());
        assert!(entry.is_stale());

        assert!(matches!(entry.observe(), Observation::ServeStale(_)));
        assert_eq!(entry.state(), EntryState::Refreshing);

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let mut starts = 0;
        let first = entry
            .begin_refresh(|| {
                starts += 1;
                RefreshHandle::spawn(async move {
                    let _ = rx.await;
                    RefreshOutcome::Refreshed
                })
            })
            .expect("stale entry starts a refresh");
        let second = entry
            .begin_refresh(|| {
                starts += 1;
                RefreshHandle::spawn(async { RefreshOutcome::Refreshed })
            })
            .expect("joins the running refresh");

        assert_eq!(starts, 1);
        assert!(first.ptr_eq(&second));
        assert!(matches!(entry.observe(), Observation::Pooled));

        tx.send(()).unwrap();
        assert_eq!(first.wait().await, RefreshOutcome::Refreshed);

        entry.replace(ok_response("new"));
        assert_eq!(entry.state(), EntryState::Ready);
        assert_eq!(entry.hits(), 0);
        assert!(entry.last_updated().is_some());
        assert!(entry.refresh_handle().is_none());
        assert_eq!(entry.response().unwrap().body, "new");
    }

    #[tokio::test]
    async fn only_the_first_stale_observer_refreshes() {
        let entry = pending();
        entry
            .populate(ok_response("old"), &SuccessStatuses::default())
            .unwrap();
        entry.mark_stale();

        assert!(matches!(entry.observe(), Observation::ServeStale(_)));
        match entry.observe() {
            Observation::Pooled => {}
            _ => panic!("second observer must not see a stale entry"),
        }

        let mut starts = 0;
        let handle = entry
            .begin_refresh(|| {
                starts += 1;
                RefreshHandle::spawn(async { RefreshOutcome::Refreshed })
            })
            .unwrap();
        assert_eq!(handle.wait().await, RefreshOutcome::Refreshed);
        entry.replace(ok_response("new"));

        // A late trigger on the refreshed entry starts nothing.
        let late = entry.begin_refresh(|| {
            starts += 1;
            RefreshHandle::spawn(async { RefreshOutcome::Refreshed })
        });
        assert!(late.is_none());
        assert_eq!(starts, 1);
        assert_eq!(entry.state(), EntryState::Ready);
        assert_eq!(entry.response().unwrap().body, "new");
    }
}
