//! In-process store used by tests and embedders that do not need durability.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::models::*;
use super::{CheckStore, DbError, IncidentStore, TargetRegistry};

#[derive(Default)]
struct Inner {
    next_target: TargetId,
    next_log: i64,
    next_incident: i64,
    targets: BTreeMap<TargetId, Target>,
    logs: Vec<CheckLogEntry>,
    incidents: BTreeMap<i64, Incident>,
}

/// Id-addressed arena implementing every storage trait.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, DbError> {
        self.inner.lock().map_err(|_| DbError::Poisoned)
    }
}

impl TargetRegistry for MemoryStore {
    fn list_targets(&self) -> Result<Vec<Target>, DbError> {
        Ok(self.lock()?.targets.values().cloned().collect())
    }

    fn get_target(&self, id: TargetId) -> Result<Target, DbError> {
        self.lock()?.targets.get(&id).cloned().ok_or(DbError::NotFound)
    }

    fn add_target(&self, config: &TargetConfig) -> Result<Target, DbError> {
        let mut inner = self.lock()?;
        inner.next_target += 1;
        let target = Target {
            id: inner.next_target,
            config: TargetConfig {
                method: config.method.to_uppercase(),
                ..config.clone()
            },
            stats: TargetStats::default(),
            created_at: Utc::now(),
        };
        inner.targets.insert(target.id, target.clone());
        Ok(target)
    }

    fn update_target(&self, id: TargetId, config: &TargetConfig) -> Result<(), DbError> {
        let mut inner = self.lock()?;
        let target = inner.targets.get_mut(&id).ok_or(DbError::NotFound)?;
        target.config = TargetConfig {
            method: config.method.to_uppercase(),
            ..config.clone()
        };
        Ok(())
    }

    fn delete_target(&self, id: TargetId) -> Result<(), DbError> {
        let mut inner = self.lock()?;
        inner.targets.remove(&id).ok_or(DbError::NotFound)?;
        inner.logs.retain(|l| l.target_id != id);
        inner.incidents.retain(|_, i| i.target_id != id);
        Ok(())
    }
}

impl CheckStore for MemoryStore {
    fn append_check_log(&self, entry: &CheckLogEntry) -> Result<i64, DbError> {
        let mut inner = self.lock()?;
        if !inner.targets.contains_key(&entry.target_id) {
            return Err(DbError::NotFound);
        }
        inner.next_log += 1;
        let id = inner.next_log;
        inner.logs.push(CheckLogEntry {
            id,
            ..entry.clone()
        });
        Ok(id)
    }

    fn update_target_stats(&self, id: TargetId, stats: &TargetStats) -> Result<(), DbError> {
        let mut inner = self.lock()?;
        let target = inner.targets.get_mut(&id).ok_or(DbError::NotFound)?;
        target.stats = stats.clone();
        Ok(())
    }

    fn read_stats(&self, id: TargetId) -> Result<TargetStats, DbError> {
        let inner = self.lock()?;
        inner
            .targets
            .get(&id)
            .map(|t| t.stats.clone())
            .ok_or(DbError::NotFound)
    }

    fn commit_check(&self, entry: &CheckLogEntry, stats: &TargetStats) -> Result<(), DbError> {
        let mut inner = self.lock()?;
        let target = inner
            .targets
            .get_mut(&entry.target_id)
            .ok_or(DbError::NotFound)?;
        target.stats = stats.clone();
        inner.next_log += 1;
        let id = inner.next_log;
        inner.logs.push(CheckLogEntry {
            id,
            ..entry.clone()
        });
        Ok(())
    }

    fn list_check_logs(
        &self,
        id: TargetId,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<CheckLogEntry>, DbError> {
        let inner = self.lock()?;
        let mut logs: Vec<CheckLogEntry> = inner
            .logs
            .iter()
            .filter(|l| l.target_id == id)
            .filter(|l| since.map_or(true, |s| l.checked_at >= s))
            .cloned()
            .collect();
        logs.sort_by(|a, b| b.checked_at.cmp(&a.checked_at).then(b.id.cmp(&a.id)));
        logs.truncate(limit);
        Ok(logs)
    }

    fn purge_check_logs_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let mut inner = self.lock()?;
        let before = inner.logs.len();
        inner.logs.retain(|l| l.checked_at >= cutoff);
        Ok(before - inner.logs.len())
    }
}

impl IncidentStore for MemoryStore {
    fn get_open_incident(
        &self,
        target_id: TargetId,
        kind: IncidentKind,
    ) -> Result<Option<Incident>, DbError> {
        let inner = self.lock()?;
        Ok(inner
            .incidents
            .values()
            .find(|i| i.target_id == target_id && i.kind == kind && i.is_open())
            .cloned())
    }

    fn create_incident(&self, incident: &NewIncident) -> Result<Incident, DbError> {
        let mut inner = self.lock()?;
        if !inner.targets.contains_key(&incident.target_id) {
            return Err(DbError::NotFound);
        }
        let duplicate = inner.incidents.values().any(|i| {
            i.target_id == incident.target_id && i.kind == incident.kind && i.is_open()
        });
        if duplicate {
            return Err(DbError::Corrupt(format!(
                "target {} already has an open {} incident",
                incident.target_id,
                incident.kind.as_str()
            )));
        }

        inner.next_incident += 1;
        let created = Incident {
            id: inner.next_incident,
            target_id: incident.target_id,
            kind: incident.kind,
            started_at: incident.started_at,
            ended_at: None,
            duration_secs: None,
            resolved: false,
            detail: incident.detail.clone(),
            notifications_sent: Vec::new(),
        };
        inner.incidents.insert(created.id, created.clone());
        Ok(created)
    }

    fn close_incident(&self, id: i64, ended_at: DateTime<Utc>) -> Result<Incident, DbError> {
        let mut inner = self.lock()?;
        let incident = inner.incidents.get_mut(&id).ok_or(DbError::NotFound)?;
        incident.resolved = true;
        incident.ended_at = Some(ended_at);
        incident.duration_secs = Some((ended_at - incident.started_at).num_seconds().max(0));
        Ok(incident.clone())
    }

    fn mark_notified(&self, id: i64, channels: &[String]) -> Result<(), DbError> {
        let mut inner = self.lock()?;
        let incident = inner.incidents.get_mut(&id).ok_or(DbError::NotFound)?;
        incident.notifications_sent.extend(channels.iter().cloned());
        Ok(())
    }

    fn list_incidents(
        &self,
        target_id: Option<TargetId>,
        limit: usize,
    ) -> Result<Vec<Incident>, DbError> {
        let inner = self.lock()?;
        let mut incidents: Vec<Incident> = inner
            .incidents
            .values()
            .filter(|i| target_id.map_or(true, |t| i.target_id == t))
            .cloned()
            .collect();
        incidents.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        incidents.truncate(limit);
        Ok(incidents)
    }
}
