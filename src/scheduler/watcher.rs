//! Polls the target registry and keeps the scheduler in step with it.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

use super::Scheduler;
use crate::db::{DbError, TargetRegistry};

pub struct RegistryWatcher {
    registry: Arc<dyn TargetRegistry>,
    scheduler: Arc<Scheduler>,
    period: Duration,
    stop: Mutex<Option<broadcast::Sender<()>>>,
}

impl RegistryWatcher {
    pub fn new(registry: Arc<dyn TargetRegistry>, scheduler: Arc<Scheduler>, period: Duration) -> Self {
        Self {
            registry,
            scheduler,
            period,
            stop: Mutex::new(None),
        }
    }

    /// Reconcile once against the active targets in the registry.
    ///
    /// Runs under the scheduler's lifecycle lock, and each listed target is
    /// read again before it is registered, so a target paused or deleted
    /// after the listing is never brought back.
    pub async fn sync_once(&self) -> Result<usize, DbError> {
        let _lifecycle = self.scheduler.lifecycle().await;
        let listed = self.registry.list_active_targets()?;

        let mut active = Vec::with_capacity(listed.len());
        for target in listed {
            match self.registry.get_target(target.id) {
                Ok(current) if current.is_active() => active.push(current),
                Ok(_) | Err(DbError::NotFound) => {
                    tracing::debug!(target_id = target.id, "Target changed during sync, skipped");
                }
                Err(e) => return Err(e),
            }
        }

        let count = active.len();
        self.scheduler.reconcile(active).await;
        Ok(count)
    }

    /// Poll every period until stopped. The first poll happens immediately.
    pub async fn start(self: &Arc<Self>) {
        let (tx, mut rx) = broadcast::channel(1);
        *self.stop.lock().await = Some(tx);

        let watcher = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(watcher.period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        match watcher.sync_once().await {
                            Ok(count) => tracing::debug!(active = count, "Registry synced"),
                            Err(e) => tracing::error!("RegistryWatcher: Failed to list targets: {}", e),
                        }
                    }
                }
            }
        });
    }

    pub async fn stop(&self) {
        if let Some(tx) = self.stop.lock().await.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CheckStore, MemoryStore, Protocol, Target, TargetConfig, TargetId};
    use crate::incident::IncidentTracker;
    use crate::notify::NotifierGateway;
    use crate::probe::{ProbeError, ProbeOutcome, Prober};
    use crate::scheduler::CheckRunner;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct Reachable;

    #[async_trait]
    impl Prober for Reachable {
        async fn probe(&self, _: &TargetConfig, _: Duration) -> Result<ProbeOutcome, ProbeError> {
            Ok(ProbeOutcome::default())
        }
    }

    fn config(name: &str) -> TargetConfig {
        TargetConfig {
            name: name.to_string(),
            protocol: Protocol::TcpPort,
            address: format!("{}.local:443", name),
            ..Default::default()
        }
    }

    /// Lists a frozen snapshot of active targets; every other call sees
    /// the live store.
    struct FrozenListing {
        live: Arc<MemoryStore>,
        listing: StdMutex<Vec<Target>>,
    }

    impl FrozenListing {
        fn freeze(live: Arc<MemoryStore>) -> Self {
            let listing = StdMutex::new(live.list_active_targets().unwrap());
            Self { live, listing }
        }
    }

    impl TargetRegistry for FrozenListing {
        fn list_targets(&self) -> Result<Vec<Target>, DbError> {
            self.live.list_targets()
        }
        fn list_active_targets(&self) -> Result<Vec<Target>, DbError> {
            Ok(self.listing.lock().unwrap().clone())
        }
        fn get_target(&self, id: TargetId) -> Result<Target, DbError> {
            self.live.get_target(id)
        }
        fn add_target(&self, config: &TargetConfig) -> Result<Target, DbError> {
            self.live.add_target(config)
        }
        fn update_target(&self, id: TargetId, config: &TargetConfig) -> Result<(), DbError> {
            self.live.update_target(id, config)
        }
        fn delete_target(&self, id: TargetId) -> Result<(), DbError> {
            self.live.delete_target(id)
        }
    }

    fn scheduler_for(store: &Arc<MemoryStore>) -> Arc<Scheduler> {
        let tracker = Arc::new(IncidentTracker::new(store.clone(), NotifierGateway::default(), 30));
        let runner = Arc::new(CheckRunner::new(Arc::new(Reachable), store.clone(), tracker, None));
        Arc::new(Scheduler::new(runner, Duration::ZERO))
    }

    fn setup() -> (Arc<MemoryStore>, Arc<Scheduler>, Arc<RegistryWatcher>) {
        let store = Arc::new(MemoryStore::new());
        let scheduler = scheduler_for(&store);
        let watcher = Arc::new(RegistryWatcher::new(
            store.clone(),
            scheduler.clone(),
            Duration::from_secs(30),
        ));
        (store, scheduler, watcher)
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_registers_only_active_targets() {
        let (store, scheduler, watcher) = setup();
        let a = store.add_target(&config("a")).unwrap();
        let mut paused = config("b");
        paused.paused = true;
        store.add_target(&paused).unwrap();

        assert_eq!(watcher.sync_once().await.unwrap(), 1);
        assert_eq!(scheduler.registered_ids().await, vec![a.id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_picks_up_changes() {
        let (store, scheduler, watcher) = setup();
        let a = store.add_target(&config("a")).unwrap();
        watcher.start().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(scheduler.registered_ids().await, vec![a.id]);

        let b = store.add_target(&config("b")).unwrap();
        let mut paused = a.config.clone();
        paused.paused = true;
        store.update_target(a.id, &paused).unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(scheduler.registered_ids().await, vec![b.id]);

        watcher.stop().await;
        store.delete_target(b.id).unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(scheduler.registered_ids().await, vec![b.id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_skips_target_paused_after_listing() {
        let store = Arc::new(MemoryStore::new());
        let target = store.add_target(&config("a")).unwrap();
        let registry = Arc::new(FrozenListing::freeze(store.clone()));

        let mut paused = target.config.clone();
        paused.paused = true;
        store.update_target(target.id, &paused).unwrap();

        let scheduler = scheduler_for(&store);
        let watcher = RegistryWatcher::new(registry, scheduler.clone(), Duration::from_secs(30));
        assert_eq!(watcher.sync_once().await.unwrap(), 0);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(scheduler.registered_ids().await.is_empty());
        assert_eq!(store.read_stats(target.id).unwrap().total_checks, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_skips_target_deleted_after_listing() {
        let store = Arc::new(MemoryStore::new());
        let target = store.add_target(&config("a")).unwrap();
        let registry = Arc::new(FrozenListing::freeze(store.clone()));

        let scheduler = scheduler_for(&store);
        scheduler.forget(target.id).await;
        store.delete_target(target.id).unwrap();

        let watcher = RegistryWatcher::new(registry, scheduler.clone(), Duration::from_secs(30));
        assert_eq!(watcher.sync_once().await.unwrap(), 0);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(scheduler.registered_ids().await.is_empty());
        assert!(!scheduler.has_busy_flag(target.id).await);
    }
}
