//! Background expiry sweep for the cache store.
//!
//! The sweeper holds only a weak reference to the store, so dropping the
//! last `Arc<CacheStore>` also ends the task on its next tick.

use std::sync::{Arc, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::store::CacheStore;

pub(crate) struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CacheStore {
    /// Spawn the periodic `cleanup_expired` task on the current runtime.
    ///
    /// Returns `false` without spawning if a sweeper is already running.
    pub fn start_sweeper(self: &Arc<Self>) -> bool {
        let mut slot = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|h| !h.task.is_finished()) {
            return false;
        }

        let period = self.config().sweep_interval;
        let store = Arc::downgrade(self);
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            tracing::info!(interval_secs = period.as_secs(), "Cache sweeper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(store) = store.upgrade() else {
                            break;
                        };
                        let removed = store.cleanup_expired().await;
                        tracing::debug!(removed, "Cache sweep completed");
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::info!("Cache sweeper stopped");
        });

        *slot = Some(SweeperHandle { shutdown, task });
        true
    }

    /// Stop the background sweep. Safe to call repeatedly.
    pub fn destroy(&self) {
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.shutdown.send(true);
        }
    }

    /// Whether a sweeper task is currently running.
    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.task.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::MemoryMirror;
    use clinic_core::{CacheConfig, ManualClock};
    use serde_json::json;
    use std::time::Duration;

    fn sweeping_store(clock: Arc<ManualClock>) -> Arc<CacheStore> {
        let config = CacheConfig::default().with_sweep_interval(Duration::from_secs(60));
        let mirror = Arc::new(MemoryMirror::default());
        Arc::new(CacheStore::new(config, mirror, clock).expect("store creation should succeed"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_removes_expired_entries() {
        let clock = Arc::new(ManualClock::new(0));
        let store = sweeping_store(clock.clone());
        store
            .set("k", json!(1), Some(Duration::from_secs(1)))
            .await
            .expect("set");

        assert!(store.start_sweeper());
        assert!(store.is_sweeping());

        clock.advance(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(store.get_stats().total, 0);
        store.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent_and_destroy_stops() {
        let store = sweeping_store(Arc::new(ManualClock::new(0)));

        assert!(store.start_sweeper());
        assert!(!store.start_sweeper());

        store.destroy();
        store.destroy();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!store.is_sweeping());

        // A stopped sweeper can be started again.
        assert!(store.start_sweeper());
        store.destroy();
    }
}
