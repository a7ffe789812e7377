use async_trait::async_trait;
use std::sync::Arc;

use super::{Adapter, AdapterPurge, AdapterRead, AdapterWrite, StalenessSignal};
use crate::error::CacheError;

/// Takes staleness from one adapter and storage from another, e.g. a
/// publish schedule in front of Redis.
#[derive(Clone)]
pub struct CombinedAdapter {
    staleness: Arc<dyn Adapter>,
    storage: Arc<dyn Adapter>,
}

impl CombinedAdapter {
    pub fn new(staleness: impl Adapter, storage: impl Adapter) -> Self {
        Self::from_arcs(Arc::new(staleness), Arc::new(storage))
    }

    pub fn from_arcs(staleness: Arc<dyn Adapter>, storage: Arc<dyn Adapter>) -> Self {
        Self { staleness, storage }
    }
}

#[async_trait]
impl Adapter for CombinedAdapter {
    fn name(&self) -> &'static str {
        "combined"
    }

    async fn ready(&self) -> Result<(), CacheError> {
        self.staleness.ready().await?;
        self.storage.ready().await
    }

    fn reader(&self) -> Option<&dyn AdapterRead> {
        self.storage.reader()
    }

    fn writer(&self) -> Option<&dyn AdapterWrite> {
        self.storage.writer()
    }

    fn purger(&self) -> Option<&dyn AdapterPurge> {
        self.storage.purger()
    }

    fn staleness(&self) -> Option<&dyn StalenessSignal> {
        self.staleness.staleness()
    }
}
