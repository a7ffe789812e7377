//! Background staleness and memory watchers.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::logging::saturating_millis;
use crate::store::CacheStore;

struct Watcher {
    name: &'static str,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

/// Handles to the periodic tasks started by [`CacheStore::start`].
///
/// Dropping the value signals every task to stop; [`Watchers::shutdown`]
/// also waits for them.
pub struct Watchers {
    tasks: Vec<Watcher>,
}

impl Watchers {
    pub(crate) fn spawn(store: Arc<CacheStore>) -> Self {
        let mut tasks = Vec::new();

        match store.config().stale_check_interval() {
            Some(every) if store.adapter().staleness().is_some() => {
                tasks.push(Watcher::start("staleness", every, store.clone(), |store| {
                    async move {
                        if let Err(err) = store.check_staleness().await {
                            tracing::warn!(error = %err, "staleness check failed");
                        }
                    }
                    .boxed()
                }));
            }
            _ => tracing::debug!("staleness watcher disabled"),
        }

        match store.config().memory_check_interval() {
            Some(every) => {
                tasks.push(Watcher::start("memory", every, store, |store| {
                    async move {
                        store.check_memory();
                    }
                    .boxed()
                }));
            }
            None => tracing::debug!("memory watcher disabled"),
        }

        Self { tasks }
    }

    /// Names of the running watchers.
    pub fn running(&self) -> Vec<&'static str> {
        self.tasks
            .iter()
            .filter(|task| !task.handle.is_finished())
            .map(|task| task.name)
            .collect()
    }

    pub async fn shutdown(mut self) {
        for task in &mut self.tasks {
            if let Some(tx) = task.shutdown_tx.take() {
                let _ = tx.send(());
            }
        }
        for task in self.tasks.drain(..) {
            if let Err(err) = task.handle.await {
                tracing::warn!(watcher = task.name, error = %err, "watcher ended abnormally");
            }
        }
        tracing::info!("cache watchers stopped");
    }
}

impl Drop for Watchers {
    fn drop(&mut self) {
        for task in &mut self.tasks {
            if let Some(tx) = task.shutdown_tx.take() {
                let _ = tx.send(());
            }
        }
    }
}

type Tick = fn(Arc<CacheStore>) -> BoxFuture<'static, ()>;

impl Watcher {
    fn start(name: &'static str, every: Duration, store: Arc<CacheStore>, tick: Tick) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately.
            interval.tick().await;
            tracing::debug!(
                watcher = name,
                every_ms = saturating_millis(every),
                "watcher started"
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => tick(store.clone()).await,
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Self {
            name,
            shutdown_tx: Some(shutdown_tx),
            handle,
        }
    }
}

impl std::fmt::Debug for Watchers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchers")
            .field("running", &self.running())
            .finish()
    }
}
