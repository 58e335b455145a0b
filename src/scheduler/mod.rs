//! Scheduler module: one timer task per target.
//!
//! Each registered target gets its own interval loop. A per-target busy
//! flag (a single-permit semaphore) keeps checks of one target from
//! overlapping; a tick that finds it taken is skipped, never queued.

mod retention;
mod runner;
mod watcher;

pub use retention::*;
pub use runner::*;
pub use watcher::*;

use crate::db::{Target, TargetConfig, TargetId};
use crate::probe::CheckResult;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, MutexGuard, OwnedSemaphorePermit, RwLock, Semaphore};

struct Registration {
    config: TargetConfig,
    stop: broadcast::Sender<()>,
}

/// Orchestrates per-target check loops.
pub struct Scheduler {
    runner: Arc<CheckRunner>,
    registrations: RwLock<HashMap<TargetId, Registration>>,
    busy: Mutex<HashMap<TargetId, Arc<Semaphore>>>,
    lifecycle: Mutex<()>,
    start_jitter: Duration,
}

impl Scheduler {
    pub fn new(runner: Arc<CheckRunner>, start_jitter: Duration) -> Self {
        Self {
            runner,
            registrations: RwLock::new(HashMap::new()),
            busy: Mutex::new(HashMap::new()),
            lifecycle: Mutex::new(()),
            start_jitter,
        }
    }

    /// Serializes lifecycle changes (create, edit, pause, delete) with
    /// registry polling. Hold it from reading the registry until the
    /// scheduler reflects what was read. Not taken by any method here.
    pub async fn lifecycle(&self) -> MutexGuard<'_, ()> {
        self.lifecycle.lock().await
    }

    /// Begin scheduling a target. A no-op when it is already registered with
    /// the same configuration; otherwise any existing timer is replaced.
    pub async fn register(&self, target: Target) {
        let mut registrations = self.registrations.write().await;

        if let Some(existing) = registrations.get(&target.id) {
            if existing.config == target.config {
                return;
            }
            let _ = existing.stop.send(());
            tracing::info!(target_id = target.id, "Scheduler: Replacing timer for {}", target.config.name);
        } else {
            tracing::info!(target_id = target.id, "Scheduler: Adding target {}", target.config.name);
        }

        let (stop_tx, stop_rx) = broadcast::channel(1);
        registrations.insert(
            target.id,
            Registration {
                config: target.config.clone(),
                stop: stop_tx,
            },
        );
        drop(registrations);

        let busy = self.busy_flag(target.id).await;
        let runner = self.runner.clone();
        let jitter = self.start_jitter;
        tokio::spawn(async move {
            run_schedule(target, runner, busy, jitter, stop_rx).await;
        });
    }

    /// Stop future checks of a target. An in-flight check finishes.
    pub async fn unregister(&self, id: TargetId) {
        if let Some(registration) = self.registrations.write().await.remove(&id) {
            let _ = registration.stop.send(());
            tracing::info!(target_id = id, "Scheduler: Removed target");
        }
    }

    /// Drop all state for a deleted target.
    pub async fn forget(&self, id: TargetId) {
        self.unregister(id).await;
        self.busy.lock().await.remove(&id);
        self.runner.tracker().forget(id);
    }

    /// Run a check now. Returns `None` when a check of the target is
    /// already running.
    pub async fn force_check(&self, target: &Target) -> Option<CheckResult> {
        let permit = self.try_claim(target.id).await?;
        Some(self.run_claimed(target, permit).await)
    }

    /// Take the target's busy flag, or `None` when a check is running.
    pub async fn try_claim(&self, id: TargetId) -> Option<OwnedSemaphorePermit> {
        self.busy_flag(id).await.try_acquire_owned().ok()
    }

    /// Run a check under a permit from [`Scheduler::try_claim`].
    pub async fn run_claimed(&self, target: &Target, permit: OwnedSemaphorePermit) -> CheckResult {
        let _permit = permit;
        tracing::info!(target_id = target.id, "Forced check");
        self.runner.execute(target).await
    }

    /// Make the registered set match `active`.
    pub async fn reconcile(&self, active: Vec<Target>) {
        let wanted: HashSet<TargetId> = active.iter().map(|t| t.id).collect();
        let stale: Vec<TargetId> = self
            .registrations
            .read()
            .await
            .keys()
            .filter(|id| !wanted.contains(id))
            .copied()
            .collect();

        for id in stale {
            self.unregister(id).await;
        }
        for target in active {
            self.register(target).await;
        }
    }

    pub async fn registered_ids(&self) -> Vec<TargetId> {
        let mut ids: Vec<TargetId> = self.registrations.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Stop every timer.
    pub async fn shutdown(&self) {
        let mut registrations = self.registrations.write().await;
        for (_, registration) in registrations.drain() {
            let _ = registration.stop.send(());
        }
    }

    #[cfg(test)]
    pub(crate) async fn has_busy_flag(&self, id: TargetId) -> bool {
        self.busy.lock().await.contains_key(&id)
    }

    /// Busy flags outlive registrations so an in-flight check of an old
    /// configuration still blocks the new one.
    async fn busy_flag(&self, id: TargetId) -> Arc<Semaphore> {
        self.busy
            .lock()
            .await
            .entry(id)
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }
}

/// Run the interval loop for a single target.
async fn run_schedule(
    target: Target,
    runner: Arc<CheckRunner>,
    busy: Arc<Semaphore>,
    jitter: Duration,
    mut stop_rx: broadcast::Receiver<()>,
) {
    // Spread first checks out so a restart doesn't probe everything at once.
    let jitter_ms = jitter.as_millis() as u64;
    if jitter_ms > 0 {
        let delay = Duration::from_millis(rand::random::<u64>() % (jitter_ms + 1));
        tokio::select! {
            _ = stop_rx.recv() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    let mut interval = tokio::time::interval(target.config.interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                break;
            }
            _ = interval.tick() => {
                let permit = match busy.clone().try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => {
                        tracing::warn!(
                            target_id = target.id,
                            "Skipping check for {}: previous check still running",
                            target.config.name
                        );
                        continue;
                    }
                };

                let runner = runner.clone();
                let target = target.clone();
                tokio::spawn(async move {
                    let _permit = permit; // Hold permit until recorded
                    runner.execute(&target).await;
                });
            }
        }
    }

    tracing::debug!(target_id = target.id, "Schedule stopped");
}
