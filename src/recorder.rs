//! Applies check results to a target's durable statistics and log.
//!
//! The recorder is the only writer of [`TargetStats`]. Transition detection
//! reads the last durably recorded status, so it survives restarts.

use std::sync::Arc;

use crate::db::{
    uptime_percentage, CheckLogEntry, CheckStatus, CheckStore, DbError, Status, TargetId,
    TargetStats,
};
use crate::probe::CheckResult;

/// A change of recorded status between consecutive checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    WentDown,
    Recovered,
}

impl Transition {
    /// Status the target must still have for this transition to apply.
    pub fn status(&self) -> Status {
        match self {
            Transition::WentDown => Status::Down,
            Transition::Recovered => Status::Up,
        }
    }
}

/// What one recorded check changed.
#[derive(Debug, Clone)]
pub struct RecordOutcome {
    pub previous: Status,
    pub stats: TargetStats,
    pub entry: CheckLogEntry,
    pub transition: Option<Transition>,
}

/// Up or pending to down is a failure; only down to up is a recovery.
pub fn detect_transition(previous: Status, current: CheckStatus) -> Option<Transition> {
    match (previous, current) {
        (Status::Up | Status::Pending, CheckStatus::Down) => Some(Transition::WentDown),
        (Status::Down, CheckStatus::Up) => Some(Transition::Recovered),
        _ => None,
    }
}

/// New statistics after one result. Uptime is always recomputed from the counters.
pub fn apply_result(previous: &TargetStats, result: &CheckResult) -> TargetStats {
    let total_checks = previous.total_checks + 1;
    let (successful_checks, failed_checks) = match result.status {
        CheckStatus::Up => (previous.successful_checks + 1, previous.failed_checks),
        CheckStatus::Down => (previous.successful_checks, previous.failed_checks + 1),
    };

    TargetStats {
        status: result.status.into(),
        last_checked: Some(result.timestamp),
        response_time_ms: Some(result.response_time_ms()),
        total_checks,
        successful_checks,
        failed_checks,
        uptime: uptime_percentage(successful_checks, total_checks),
    }
}

/// Uptime over a slice of log entries; `None` when the slice is empty.
///
/// A reporting view only. The counters stay authoritative.
pub fn window_uptime(entries: &[CheckLogEntry]) -> Option<f64> {
    if entries.is_empty() {
        return None;
    }
    let up = entries
        .iter()
        .filter(|e| e.status == CheckStatus::Up)
        .count() as u64;
    Some(uptime_percentage(up, entries.len() as u64))
}

pub struct ResultRecorder {
    store: Arc<dyn CheckStore>,
}

impl ResultRecorder {
    pub fn new(store: Arc<dyn CheckStore>) -> Self {
        Self { store }
    }

    /// Record one result. Returns `None` when the target no longer exists,
    /// in which case nothing is written.
    pub fn record(
        &self,
        target_id: TargetId,
        result: &CheckResult,
    ) -> Result<Option<RecordOutcome>, DbError> {
        let previous = match self.store.read_stats(target_id) {
            Ok(stats) => stats,
            Err(DbError::NotFound) => {
                tracing::debug!(target_id, "Discarding result for deleted target");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let stats = apply_result(&previous, result);
        let entry = CheckLogEntry {
            id: 0,
            target_id,
            status: result.status,
            response_time_ms: result.response_time_ms(),
            status_code: result.status_code,
            error: result.error.clone(),
            checked_at: result.timestamp,
        };

        match self.store.commit_check(&entry, &stats) {
            Ok(()) => {}
            Err(DbError::NotFound) => {
                tracing::debug!(target_id, "Target deleted while recording, result discarded");
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        let transition = detect_transition(previous.status, result.status);
        tracing::debug!(
            target_id,
            status = result.status.as_str(),
            elapsed_ms = entry.response_time_ms,
            uptime = stats.uptime,
            "Recorded check"
        );

        Ok(Some(RecordOutcome {
            previous: previous.status,
            stats,
            entry,
            transition,
        }))
    }
}
