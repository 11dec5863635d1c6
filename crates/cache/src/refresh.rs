use crate::Reconciler;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Periodically reconciles the cache until told to stop.
///
/// A failed reconcile is logged and otherwise ignored: the cache keeps its
/// last good state and the next tick simply tries again. Ticks that were
/// missed while a slow reconcile was running are not caught up on.
pub struct RefreshLoop {
    reconciler: Arc<Reconciler>,
    period: Duration,
}

impl RefreshLoop {
    /// Returns `None` for a zero period, which means "load once, never
    /// rescan".
    pub fn new(reconciler: Arc<Reconciler>, period: Duration) -> Option<Self> {
        (!period.is_zero()).then_some(Self { reconciler, period })
    }

    /// Run the loop on the current runtime. The first reconcile happens one
    /// period from now (the initial load is the caller's job).
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(period = ?self.period, "Periodic refresh started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {},
            }
            // Abandoning a reconcile halfway is fine: nothing is committed
            // until its very last step.
            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                result = self.reconciler.reconcile() => result,
            };
            if let Err(e) = result {
                tracing::warn!(error = ?e, "Refresh failed; keeping previous cache state until the next attempt");
            }
        }
        tracing::info!("Periodic refresh stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FileCache;
    use memserve_storage::BackendHandle;
    use memserve_storage::backend::MockBackend;
    use time::OffsetDateTime;

    async fn setup() -> (Arc<MockBackend>, Arc<Reconciler>) {
        let backend = Arc::new(MockBackend::default());
        backend.write_at("a.txt", "hello", OffsetDateTime::UNIX_EPOCH).await;
        let handle: BackendHandle = backend.clone();
        let reconciler = Arc::new(Reconciler::new(handle, Arc::new(FileCache::new())));
        reconciler.reconcile().await.unwrap();
        (backend, reconciler)
    }

    #[tokio::test]
    async fn test_zero_period_disables_refresh() {
        let (_backend, reconciler) = setup().await;
        assert!(RefreshLoop::new(reconciler.clone(), Duration::ZERO).is_none());
        assert!(RefreshLoop::new(reconciler, Duration::from_secs(1)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_picks_up_changes() {
        let (backend, reconciler) = setup().await;
        let cache = reconciler.cache().clone();
        let shutdown = CancellationToken::new();
        let handle = RefreshLoop::new(reconciler, Duration::from_secs(60)).unwrap().spawn(shutdown.clone());

        backend.write_at("b.txt", "new", OffsetDateTime::UNIX_EPOCH).await;
        backend.remove("a.txt").await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(cache.lookup("a.txt").is_some(), "refreshed before the first period elapsed");

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(cache.lookup("a.txt").is_none());
        assert!(cache.lookup("b.txt").is_some());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_keeps_running() {
        let (backend, reconciler) = setup().await;
        let cache = reconciler.cache().clone();
        let shutdown = CancellationToken::new();
        let handle = RefreshLoop::new(reconciler, Duration::from_secs(10)).unwrap().spawn(shutdown.clone());

        backend.fail_listing(true);
        backend.write_at("b.txt", "new", OffsetDateTime::UNIX_EPOCH).await;
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(!handle.is_finished());
        assert_eq!(cache.keys(), vec!["a.txt"]);

        backend.fail_listing(false);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(cache.keys(), vec!["a.txt", "b.txt"]);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_loop() {
        let (_backend, reconciler) = setup().await;
        let shutdown = CancellationToken::new();
        let handle = RefreshLoop::new(reconciler, Duration::from_secs(3600)).unwrap().spawn(shutdown.clone());
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
