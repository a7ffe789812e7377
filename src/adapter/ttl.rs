use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use super::{Adapter, StalenessSignal};
use crate::error::CacheError;
use crate::logging::saturating_millis;

pub const DEFAULT_TTL: Duration = Duration::from_secs(600);

/// Staleness-only adapter: the cache goes stale once every `ttl`.
///
/// The window starts when the adapter is built and restarts each time a
/// check reports staleness.
#[derive(Debug)]
pub struct TtlAdapter {
    ttl: Duration,
    window_start: Mutex<Instant>,
}

impl TtlAdapter {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            window_start: Mutex::new(Instant::now()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Time left before the next check reports staleness.
    pub fn remaining(&self) -> Duration {
        let start = *self
            .window_start
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.ttl.saturating_sub(start.elapsed())
    }
}

impl Default for TtlAdapter {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl Adapter for TtlAdapter {
    fn name(&self) -> &'static str {
        "ttl"
    }

    fn staleness(&self) -> Option<&dyn StalenessSignal> {
        Some(self)
    }
}

#[async_trait]
impl StalenessSignal for TtlAdapter {
    async fn is_stale(&self) -> Result<bool, CacheError> {
        let mut start = self
            .window_start
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let elapsed = start.elapsed();
        let expired = elapsed > self.ttl;
        if expired {
            *start = Instant::now();
        }
        let remaining = self.ttl.saturating_sub(elapsed);
        tracing::debug!(
            remaining_ms = saturating_millis(remaining),
            expired,
            "ttl staleness check"
        );
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn reports_stale_once_per_window() {
        let adapter = TtlAdapter::new(Duration::from_secs(10));
        let signal = adapter.staleness().expect("ttl exposes staleness");
        assert!(adapter.reader().is_none());
        assert!(adapter.writer().is_none());

        assert!(!signal.is_stale().await.unwrap());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(signal.is_stale().await.unwrap());
        assert!(!signal.is_stale().await.unwrap());
        assert_eq!(adapter.remaining(), Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!signal.is_stale().await.unwrap(), "boundary is exclusive");
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(signal.is_stale().await.unwrap());
    }

    #[test]
    fn default_ttl_is_ten_minutes() {
        assert_eq!(TtlAdapter::default().ttl(), Duration::from_secs(600));
    }
}
