use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::traits::RankStore;

/// GC interval used when none is configured.
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(1);

/// Periodically drops expired keys (vote ledgers past their window, stale
/// group views) from the store.
///
/// Reads already treat expired keys as absent, so this task only reclaims
/// memory; correctness never depends on it running.
pub struct TtlGcTask<S> {
    store: Arc<S>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl<S: RankStore> TtlGcTask<S> {
    pub fn new(store: Arc<S>, interval: Duration, shutdown: watch::Receiver<bool>) -> Self {
        TtlGcTask { store, interval, shutdown }
    }

    /// Run the GC loop until shutdown is signalled or the sender is dropped.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.store.purge_expired().await {
                        Ok(0) => {}
                        Ok(purged) => tracing::debug!(purged, "ttl gc pass"),
                        Err(e) => tracing::warn!(error = %e, "ttl gc pass failed"),
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("ttl gc stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemStore;
    use crate::types::{StoreCommand, Transaction};
    use rb_types::ManualClock;

    #[tokio::test]
    async fn gc_purges_and_stops_on_shutdown() {
        let clock = Arc::new(ManualClock::new(0.0));
        let store = Arc::new(MemStore::with_clock(clock.clone()));
        store
            .apply(Transaction::new(vec![
                StoreCommand::SetAdd { key: "voted:1".into(), member: "alice".into() },
                StoreCommand::Expire { key: "voted:1".into(), ttl_secs: 5.0 },
                StoreCommand::SetAdd { key: "group:g".into(), member: "article:1".into() },
            ]))
            .await
            .unwrap();
        clock.advance(6.0);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(TtlGcTask::new(store.clone(), Duration::from_millis(5), rx).run());
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Already purged by the task, so nothing is left for a manual pass.
        assert_eq!(store.purge_expired().await.unwrap(), 0);
        assert!(store.exists("group:g").await.unwrap());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("gc task did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn gc_stops_when_sender_dropped() {
        let store = Arc::new(MemStore::new());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(TtlGcTask::new(store, DEFAULT_GC_INTERVAL, rx).run());
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("gc task did not stop")
            .unwrap();
    }
}
