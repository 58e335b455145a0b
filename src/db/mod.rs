//! Database module for UpTrail.
//!
//! The engine talks to storage through the [`TargetRegistry`], [`CheckStore`]
//! and [`IncidentStore`] traits. [`Store`] backs them with SQLite,
//! [`MemoryStore`] with an in-process arena.

mod memory;
mod models;
mod store;

pub use memory::*;
pub use models::*;
pub use store::*;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Corrupt row: {0}")]
    Corrupt(String),
    #[error("Storage lock poisoned")]
    Poisoned,
    #[error("Not found")]
    NotFound,
}

/// Read/write view of target configurations.
pub trait TargetRegistry: Send + Sync {
    fn list_targets(&self) -> Result<Vec<Target>, DbError>;

    /// Targets that are not paused.
    fn list_active_targets(&self) -> Result<Vec<Target>, DbError> {
        Ok(self
            .list_targets()?
            .into_iter()
            .filter(Target::is_active)
            .collect())
    }

    fn get_target(&self, id: TargetId) -> Result<Target, DbError>;

    /// Persist a new target with pending status and zeroed counters.
    fn add_target(&self, config: &TargetConfig) -> Result<Target, DbError>;

    /// Replace the configuration of a target. Statistics are left untouched.
    fn update_target(&self, id: TargetId, config: &TargetConfig) -> Result<(), DbError>;

    /// Delete a target together with its check history and incidents.
    fn delete_target(&self, id: TargetId) -> Result<(), DbError>;
}

/// Durable record of checks and per-target statistics.
pub trait CheckStore: Send + Sync {
    fn append_check_log(&self, entry: &CheckLogEntry) -> Result<i64, DbError>;

    fn update_target_stats(&self, id: TargetId, stats: &TargetStats) -> Result<(), DbError>;

    /// Last durably recorded status and counters of a target.
    fn read_stats(&self, id: TargetId) -> Result<TargetStats, DbError>;

    /// Append the log entry and update the statistics as one unit.
    fn commit_check(
        &self,
        entry: &CheckLogEntry,
        stats: &TargetStats,
    ) -> Result<(), DbError> {
        self.append_check_log(entry)?;
        self.update_target_stats(entry.target_id, stats)
    }

    /// Most recent entries first.
    fn list_check_logs(
        &self,
        id: TargetId,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<CheckLogEntry>, DbError>;

    /// Delete log entries older than `cutoff`, returning how many were removed.
    fn purge_check_logs_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError>;
}

/// Durable record of incidents.
pub trait IncidentStore: Send + Sync {
    fn get_open_incident(
        &self,
        target_id: TargetId,
        kind: IncidentKind,
    ) -> Result<Option<Incident>, DbError>;

    fn create_incident(&self, incident: &NewIncident) -> Result<Incident, DbError>;

    /// Resolve an incident, computing its duration from `ended_at`.
    fn close_incident(&self, id: i64, ended_at: DateTime<Utc>) -> Result<Incident, DbError>;

    /// Append channel names to the incident's list of fired notifications.
    fn mark_notified(&self, id: i64, channels: &[String]) -> Result<(), DbError>;

    /// Most recent incidents first, optionally for one target.
    fn list_incidents(
        &self,
        target_id: Option<TargetId>,
        limit: usize,
    ) -> Result<Vec<Incident>, DbError>;
}
