use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Mutex, PoisonError};

use super::{Adapter, StalenessSignal};
use crate::error::CacheError;

/// Source of publish times.
#[async_trait]
pub trait PublishSchedule: Send + Sync + 'static {
    /// Latest publish time `t` with `after < t <= until`. A `None` lower
    /// bound is unbounded.
    async fn latest_between(
        &self,
        after: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, CacheError>;

    /// Lets a schedule backed by a database connection delay start-up.
    async fn ready(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Reports staleness whenever the schedule has a publish time newer than
/// the last one observed.
///
/// The first check only records a baseline (the latest past publish time, or
/// now) and reports fresh. Storage capabilities can be layered on through
/// [`CombinedAdapter`](super::CombinedAdapter).
pub struct PublishScheduleAdapter<S> {
    schedule: S,
    last_published: Mutex<Option<DateTime<Utc>>>,
}

impl<S: PublishSchedule> PublishScheduleAdapter<S> {
    pub fn new(schedule: S) -> Self {
        Self {
            schedule,
            last_published: Mutex::new(None),
        }
    }

    pub fn schedule(&self) -> &S {
        &self.schedule
    }

    pub fn last_published(&self) -> Option<DateTime<Utc>> {
        *self
            .last_published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_last_published(&self, at: DateTime<Utc>) {
        *self
            .last_published
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(at);
    }
}

#[async_trait]
impl<S: PublishSchedule> Adapter for PublishScheduleAdapter<S> {
    fn name(&self) -> &'static str {
        "publish_schedule"
    }

    async fn ready(&self) -> Result<(), CacheError> {
        self.schedule.ready().await
    }

    fn staleness(&self) -> Option<&dyn StalenessSignal> {
        Some(self)
    }
}

#[async_trait]
impl<S: PublishSchedule> StalenessSignal for PublishScheduleAdapter<S> {
    async fn is_stale(&self) -> Result<bool, CacheError> {
        let now = Utc::now();

        let Some(last) = self.last_published() else {
            let baseline = self.schedule.latest_between(None, now).await?.unwrap_or(now);
            self.set_last_published(baseline);
            tracing::debug!(baseline = %baseline, "publish schedule baseline recorded");
            return Ok(false);
        };

        match self.schedule.latest_between(Some(last), now).await? {
            Some(published) => {
                self.set_last_published(published);
                tracing::info!(published = %published, "new publish time observed");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// In-memory [`PublishSchedule`].
#[derive(Debug, Default)]
pub struct MemorySchedule {
    times: Mutex<Vec<DateTime<Utc>>>,
}

impl MemorySchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish_at(&self, at: DateTime<Utc>) {
        self.times
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(at);
    }
}

#[async_trait]
impl PublishSchedule for MemorySchedule {
    async fn latest_between(
        &self,
        after: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, CacheError> {
        let times = self.times.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(times
            .iter()
            .copied()
            .filter(|t| *t <= until && after.map_or(true, |after| *t > after))
            .max())
    }
}

#[async_trait]
impl<S: PublishSchedule> PublishSchedule for std::sync::Arc<S> {
    async fn latest_between(
        &self,
        after: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, CacheError> {
        (**self).latest_between(after, until).await
    }

    async fn ready(&self) -> Result<(), CacheError> {
        (**self).ready().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    #[tokio::test]
    async fn first_check_records_baseline_and_reports_fresh() {
        let schedule = MemorySchedule::new();
        let past = Utc::now() - Duration::hours(1);
        schedule.publish_at(past);
        schedule.publish_at(past - Duration::hours(1));

        let adapter = PublishScheduleAdapter::new(schedule);
        assert!(!adapter.is_stale().await.unwrap());
        assert_eq!(adapter.last_published(), Some(past));
        assert!(!adapter.is_stale().await.unwrap());
    }

    #[tokio::test]
    async fn new_publish_time_reports_stale_once() {
        let schedule = Arc::new(MemorySchedule::new());
        let adapter = PublishScheduleAdapter::new(schedule.clone());

        assert!(!adapter.is_stale().await.unwrap());
        let baseline = adapter.last_published().expect("baseline set");

        let published = baseline + Duration::milliseconds(1);
        schedule.publish_at(published);
        // Future entries are not due yet.
        schedule.publish_at(Utc::now() + Duration::hours(1));
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        assert!(adapter.is_stale().await.unwrap());
        assert_eq!(adapter.last_published(), Some(published));
        assert!(!adapter.is_stale().await.unwrap());
    }
}
