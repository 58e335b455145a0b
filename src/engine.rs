//! Engine facade.
//!
//! Wires storage, probing, recording, incidents and scheduling together and
//! exposes the admin operations on targets.

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use crate::config::ServerConfig;
use crate::db::{
    CheckLogEntry, CheckStatus, CheckStore, ConfigError, DbError, Incident, IncidentStore,
    Status, Target, TargetConfig, TargetId, TargetRegistry,
};
use crate::incident::IncidentTracker;
use crate::notify::NotifierGateway;
use crate::probe::{CertificateSource, CheckResult, Prober};
use crate::recorder::window_uptime;
use crate::scheduler::{CheckRunner, RegistryWatcher, RetentionManager, Scheduler};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("target {0} not found")]
    NotFound(TargetId),
    #[error("a check of target {0} is already running")]
    Busy(TargetId),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Db(DbError),
}

impl From<DbError> for EngineError {
    fn from(e: DbError) -> Self {
        EngineError::Db(e)
    }
}

/// Storage backends usable by the engine.
pub trait EngineStore: TargetRegistry + CheckStore + IncidentStore {}

impl<T: TargetRegistry + CheckStore + IncidentStore> EngineStore for T {}

/// Dashboard summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStats {
    pub total_targets: usize,
    pub up: usize,
    pub down: usize,
    pub pending: usize,
    pub paused: usize,
    /// All-time uptime across every target's counters.
    pub overall_uptime: f64,
    pub open_incidents: usize,
    /// Mean response time of up checks in the last 24 hours.
    pub avg_response_time_ms: Option<f64>,
}

pub struct Engine {
    registry: Arc<dyn TargetRegistry>,
    checks: Arc<dyn CheckStore>,
    incidents: Arc<dyn IncidentStore>,
    scheduler: Arc<Scheduler>,
    watcher: Arc<RegistryWatcher>,
    retention: Arc<RetentionManager>,
}

impl Engine {
    pub fn new<S: EngineStore + 'static>(
        config: &ServerConfig,
        store: Arc<S>,
        prober: Arc<dyn Prober>,
        certificates: Option<Arc<dyn CertificateSource>>,
        gateway: NotifierGateway,
    ) -> Self {
        let registry: Arc<dyn TargetRegistry> = store.clone();
        let checks: Arc<dyn CheckStore> = store.clone();
        let incidents: Arc<dyn IncidentStore> = store;

        let tracker = Arc::new(IncidentTracker::new(
            incidents.clone(),
            gateway,
            config.cert_warning_days,
        ));
        let runner = Arc::new(CheckRunner::new(prober, checks.clone(), tracker, certificates));
        let scheduler = Arc::new(Scheduler::new(runner, config.start_jitter()));
        let watcher = Arc::new(RegistryWatcher::new(
            registry.clone(),
            scheduler.clone(),
            config.registry_poll_interval(),
        ));
        let retention = Arc::new(RetentionManager::new(checks.clone(), config.log_retention()));

        Self {
            registry,
            checks,
            incidents,
            scheduler,
            watcher,
            retention,
        }
    }

    /// Schedule every active target and start the background tasks.
    pub async fn start(&self) -> Result<(), EngineError> {
        let count = self.watcher.sync_once().await?;
        tracing::info!(active = count, "Scheduled active targets");
        self.watcher.start().await;
        self.retention.start();
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.watcher.stop().await;
        self.retention.stop().await;
        self.scheduler.shutdown().await;
    }

    pub fn list_targets(&self) -> Result<Vec<Target>, EngineError> {
        Ok(self.registry.list_targets()?)
    }

    pub fn get_target(&self, id: TargetId) -> Result<Target, EngineError> {
        self.registry.get_target(id).map_err(|e| not_found(e, id))
    }

    pub async fn create_target(&self, config: TargetConfig) -> Result<Target, EngineError> {
        config.validate()?;
        let _lifecycle = self.scheduler.lifecycle().await;
        let target = self.registry.add_target(&config)?;
        tracing::info!(target_id = target.id, "Created target {}", target.config.name);
        if target.is_active() {
            self.scheduler.register(target.clone()).await;
        }
        Ok(target)
    }

    /// Replace a target's configuration. Statistics are kept.
    pub async fn update_target(
        &self,
        id: TargetId,
        config: TargetConfig,
    ) -> Result<Target, EngineError> {
        config.validate()?;
        let _lifecycle = self.scheduler.lifecycle().await;
        self.registry
            .update_target(id, &config)
            .map_err(|e| not_found(e, id))?;
        let target = self.get_target(id)?;
        self.apply_lifecycle(&target).await;
        Ok(target)
    }

    pub async fn pause(&self, id: TargetId) -> Result<Target, EngineError> {
        self.set_paused(id, true).await
    }

    pub async fn resume(&self, id: TargetId) -> Result<Target, EngineError> {
        self.set_paused(id, false).await
    }

    /// Remove a target with its history and incidents. An in-flight check
    /// finishes but its result is discarded.
    pub async fn delete_target(&self, id: TargetId) -> Result<(), EngineError> {
        let _lifecycle = self.scheduler.lifecycle().await;
        self.get_target(id)?;
        self.scheduler.forget(id).await;
        self.registry
            .delete_target(id)
            .map_err(|e| not_found(e, id))?;
        tracing::info!(target_id = id, "Deleted target");
        Ok(())
    }

    /// Check a target now, paused or not.
    pub async fn force_check(&self, id: TargetId) -> Result<CheckResult, EngineError> {
        let (target, permit) = {
            let _lifecycle = self.scheduler.lifecycle().await;
            let target = self.get_target(id)?;
            let permit = self
                .scheduler
                .try_claim(id)
                .await
                .ok_or(EngineError::Busy(id))?;
            (target, permit)
        };
        Ok(self.scheduler.run_claimed(&target, permit).await)
    }

    /// Check log entries since `since`, newest first.
    pub fn history(
        &self,
        id: TargetId,
        since: Option<ChronoDuration>,
        limit: usize,
    ) -> Result<Vec<CheckLogEntry>, EngineError> {
        self.get_target(id)?;
        let since = since.map(|d| Utc::now() - d);
        Ok(self.checks.list_check_logs(id, since, limit)?)
    }

    /// Uptime over the last `last` checks, derived from the log.
    pub fn window_uptime(&self, id: TargetId, last: usize) -> Result<Option<f64>, EngineError> {
        let entries = self.history(id, None, last)?;
        Ok(window_uptime(&entries))
    }

    pub fn incidents(
        &self,
        target_id: Option<TargetId>,
        limit: usize,
    ) -> Result<Vec<Incident>, EngineError> {
        if let Some(id) = target_id {
            self.get_target(id)?;
        }
        Ok(self.incidents.list_incidents(target_id, limit)?)
    }

    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let targets = self.registry.list_targets()?;
        let since = Utc::now() - ChronoDuration::hours(24);

        let mut stats = EngineStats {
            total_targets: targets.len(),
            up: 0,
            down: 0,
            pending: 0,
            paused: 0,
            overall_uptime: 100.0,
            open_incidents: 0,
            avg_response_time_ms: None,
        };
        let (mut successful, mut total) = (0u64, 0u64);
        let (mut response_sum, mut response_count) = (0u64, 0u64);

        for target in &targets {
            if target.config.paused {
                stats.paused += 1;
            } else {
                match target.stats.status {
                    Status::Up => stats.up += 1,
                    Status::Down => stats.down += 1,
                    Status::Pending => stats.pending += 1,
                }
            }
            successful += target.stats.successful_checks;
            total += target.stats.total_checks;

            for entry in self.checks.list_check_logs(target.id, Some(since), 1000)? {
                if entry.status == CheckStatus::Up {
                    response_sum += entry.response_time_ms;
                    response_count += 1;
                }
            }
            stats.open_incidents += self
                .incidents
                .list_incidents(Some(target.id), usize::MAX)?
                .iter()
                .filter(|i| i.is_open())
                .count();
        }

        stats.overall_uptime = crate::db::uptime_percentage(successful, total);
        if response_count > 0 {
            stats.avg_response_time_ms = Some(response_sum as f64 / response_count as f64);
        }
        Ok(stats)
    }

    async fn set_paused(&self, id: TargetId, paused: bool) -> Result<Target, EngineError> {
        let _lifecycle = self.scheduler.lifecycle().await;
        let mut config = self.get_target(id)?.config;
        if config.paused != paused {
            config.paused = paused;
            self.registry
                .update_target(id, &config)
                .map_err(|e| not_found(e, id))?;
            tracing::info!(target_id = id, paused, "Target lifecycle changed");
        }
        let target = self.get_target(id)?;
        self.apply_lifecycle(&target).await;
        Ok(target)
    }

    async fn apply_lifecycle(&self, target: &Target) {
        if target.is_active() {
            self.scheduler.register(target.clone()).await;
        } else {
            self.scheduler.unregister(target.id).await;
        }
    }

    #[cfg(test)]
    async fn scheduled_ids(&self) -> Vec<TargetId> {
        self.scheduler.registered_ids().await
    }
}

fn not_found(e: DbError, id: TargetId) -> EngineError {
    match e {
        DbError::NotFound => EngineError::NotFound(id),
        other => EngineError::Db(other),
    }
}
