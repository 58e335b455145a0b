//! Incident tracking.
//!
//! Turns recorded transitions into outage incidents and certificate checks
//! into certificate-expiry incidents. Bookkeeping here is best effort: the
//! statistics are already committed when the tracker runs, and a failed
//! transition is retried on the target's next check while its status still
//! matches.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::db::{DbError, Incident, IncidentKind, IncidentStore, NewIncident, TargetId};
use crate::notify::{NotifierGateway, NotifyEvent, NotifyKind};
use crate::recorder::{RecordOutcome, Transition};

#[derive(Debug, Clone)]
struct PendingTransition {
    transition: Transition,
    at: DateTime<Utc>,
    detail: String,
}

pub struct IncidentTracker {
    store: Arc<dyn IncidentStore>,
    gateway: NotifierGateway,
    cert_warning_days: i64,
    pending: Mutex<HashMap<TargetId, PendingTransition>>,
}

impl IncidentTracker {
    pub fn new(
        store: Arc<dyn IncidentStore>,
        gateway: NotifierGateway,
        cert_warning_days: i64,
    ) -> Self {
        Self {
            store,
            gateway,
            cert_warning_days,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn cert_warning_days(&self) -> i64 {
        self.cert_warning_days
    }

    /// Act on one recorded check.
    pub fn observe(&self, target_id: TargetId, target_name: &str, outcome: &RecordOutcome) {
        let job = match outcome.transition {
            Some(transition) => Some(PendingTransition {
                transition,
                at: outcome.entry.checked_at,
                detail: outcome
                    .entry
                    .error
                    .clone()
                    .unwrap_or_else(|| "check failed".to_string()),
            }),
            None => self.take_pending(target_id).filter(|p| {
                let still_relevant = p.transition.status() == outcome.stats.status;
                if still_relevant {
                    tracing::info!(target_id, "Retrying incident update for {:?}", p.transition);
                }
                still_relevant
            }),
        };

        let Some(job) = job else {
            return;
        };
        // A newer transition replaces anything still pending.
        self.take_pending(target_id);

        if let Err(e) = self.apply(target_id, target_name, &job) {
            tracing::warn!(target_id, "Incident update failed, will retry on next check: {}", e);
            if let Ok(mut pending) = self.pending.lock() {
                pending.insert(target_id, job);
            }
        }
    }

    /// Act on a certificate side-check result.
    pub fn observe_certificate(
        &self,
        target_id: TargetId,
        target_name: &str,
        days_until_expiry: i64,
        at: DateTime<Utc>,
    ) {
        if let Err(e) = self.apply_certificate(target_id, target_name, days_until_expiry, at) {
            tracing::warn!(target_id, "Certificate incident update failed: {}", e);
        }
    }

    /// Drop retry state for a deleted target.
    pub fn forget(&self, target_id: TargetId) {
        self.take_pending(target_id);
    }

    fn take_pending(&self, target_id: TargetId) -> Option<PendingTransition> {
        self.pending.lock().ok()?.remove(&target_id)
    }

    fn apply(
        &self,
        target_id: TargetId,
        target_name: &str,
        job: &PendingTransition,
    ) -> Result<(), DbError> {
        let open = self.store.get_open_incident(target_id, IncidentKind::Outage)?;
        match (job.transition, open) {
            (Transition::WentDown, Some(existing)) => {
                tracing::debug!(target_id, incident_id = existing.id, "Outage already open");
            }
            (Transition::WentDown, None) => {
                let incident = self.store.create_incident(&NewIncident {
                    target_id,
                    kind: IncidentKind::Outage,
                    started_at: job.at,
                    detail: job.detail.clone(),
                })?;
                tracing::info!(target_id, incident_id = incident.id, "Target went down: {}", job.detail);
                self.announce(&incident, target_name, NotifyKind::Down, job.detail.clone(), job.at);
            }
            (Transition::Recovered, Some(open)) => {
                let closed = self.store.close_incident(open.id, job.at)?;
                let minutes = closed.duration_secs.unwrap_or(0) / 60;
                tracing::info!(target_id, incident_id = closed.id, minutes, "Target recovered");
                let detail = format!("recovered after {} minute(s) of downtime", minutes);
                self.announce(&closed, target_name, NotifyKind::Recovered, detail, job.at);
            }
            (Transition::Recovered, None) => {
                tracing::debug!(target_id, "Recovered with no open outage");
            }
        }
        Ok(())
    }

    fn apply_certificate(
        &self,
        target_id: TargetId,
        target_name: &str,
        days_until_expiry: i64,
        at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let open = self
            .store
            .get_open_incident(target_id, IncidentKind::CertificateExpiry)?;

        if days_until_expiry < self.cert_warning_days {
            if open.is_none() {
                let detail = if days_until_expiry < 0 {
                    format!("certificate expired {} day(s) ago", -days_until_expiry)
                } else {
                    format!("certificate expires in {} day(s)", days_until_expiry)
                };
                let incident = self.store.create_incident(&NewIncident {
                    target_id,
                    kind: IncidentKind::CertificateExpiry,
                    started_at: at,
                    detail: detail.clone(),
                })?;
                tracing::info!(target_id, days_until_expiry, "Certificate expiry incident opened");
                self.announce(&incident, target_name, NotifyKind::CertificateExpiry, detail, at);
            }
        } else if let Some(open) = open {
            self.store.close_incident(open.id, at)?;
            tracing::info!(target_id, days_until_expiry, "Certificate expiry incident resolved");
        }
        Ok(())
    }

    fn announce(
        &self,
        incident: &Incident,
        target_name: &str,
        kind: NotifyKind,
        detail: String,
        at: DateTime<Utc>,
    ) {
        let channels = self.gateway.notify(NotifyEvent {
            target_id: incident.target_id,
            target_name: target_name.to_string(),
            kind,
            detail,
            timestamp: at,
        });
        if let Err(e) = self.store.mark_notified(incident.id, &channels) {
            tracing::warn!(incident_id = incident.id, "Failed to record notifications: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{
        CheckLogEntry, CheckStatus, MemoryStore, Protocol, Status, TargetConfig, TargetRegistry,
        TargetStats,
    };
    use crate::notify::testing::RecordingNotifier;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` incident creations.
    struct FlakyIncidents {
        inner: Arc<MemoryStore>,
        failures: AtomicU32,
    }

    impl IncidentStore for FlakyIncidents {
        fn get_open_incident(
            &self,
            target_id: TargetId,
            kind: IncidentKind,
        ) -> Result<Option<Incident>, DbError> {
            self.inner.get_open_incident(target_id, kind)
        }

        fn create_incident(&self, incident: &NewIncident) -> Result<Incident, DbError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(DbError::Poisoned);
            }
            self.inner.create_incident(incident)
        }

        fn close_incident(&self, id: i64, ended_at: DateTime<Utc>) -> Result<Incident, DbError> {
            self.inner.close_incident(id, ended_at)
        }

        fn mark_notified(&self, id: i64, channels: &[String]) -> Result<(), DbError> {
            self.inner.mark_notified(id, channels)
        }

        fn list_incidents(
            &self,
            target_id: Option<TargetId>,
            limit: usize,
        ) -> Result<Vec<Incident>, DbError> {
            self.inner.list_incidents(target_id, limit)
        }
    }

    fn setup_with(
        failures: u32,
    ) -> (Arc<MemoryStore>, IncidentTracker, Arc<RecordingNotifier>, TargetId) {
        let store = Arc::new(MemoryStore::new());
        let target = store
            .add_target(&TargetConfig {
                name: "shop".to_string(),
                protocol: Protocol::Https,
                address: "https://shop.example.com".to_string(),
                ..Default::default()
            })
            .unwrap();
        let recording = Arc::new(RecordingNotifier::default());
        let flaky = Arc::new(FlakyIncidents {
            inner: store.clone(),
            failures: AtomicU32::new(failures),
        });
        let tracker = IncidentTracker::new(
            flaky,
            NotifierGateway::new(vec![recording.clone()]),
            30,
        );
        (store, tracker, recording, target.id)
    }

    fn outcome(
        id: TargetId,
        status: Status,
        transition: Option<Transition>,
        at: DateTime<Utc>,
    ) -> RecordOutcome {
        let check = if status == Status::Up {
            CheckStatus::Up
        } else {
            CheckStatus::Down
        };
        RecordOutcome {
            previous: Status::Pending,
            stats: TargetStats {
                status,
                ..Default::default()
            },
            entry: CheckLogEntry {
                id: 1,
                target_id: id,
                status: check,
                response_time_ms: 10,
                status_code: None,
                error: (check == CheckStatus::Down).then(|| "connection refused".to_string()),
                checked_at: at,
            },
            transition,
        }
    }

    async fn settle() {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_outage_opens_once_and_closes_with_duration() {
        let (store, tracker, recording, id) = setup_with(0);
        let start = Utc::now();

        tracker.observe(id, "shop", &outcome(id, Status::Down, Some(Transition::WentDown), start));
        // Repeated down results carry no transition.
        tracker.observe(id, "shop", &outcome(id, Status::Down, None, start + ChronoDuration::minutes(1)));
        // A stray went-down must not duplicate.
        tracker.observe(id, "shop", &outcome(id, Status::Down, Some(Transition::WentDown), start + ChronoDuration::minutes(2)));
        assert_eq!(store.list_incidents(Some(id), 10).unwrap().len(), 1);

        let end = start + ChronoDuration::minutes(5);
        tracker.observe(id, "shop", &outcome(id, Status::Up, Some(Transition::Recovered), end));

        let incidents = store.list_incidents(Some(id), 10).unwrap();
        assert_eq!(incidents.len(), 1);
        assert!(incidents[0].resolved);
        assert_eq!(incidents[0].ended_at, Some(end));
        assert_eq!(incidents[0].duration_secs, Some(300));
        assert_eq!(incidents[0].notifications_sent, vec!["recording", "recording"]);

        settle().await;
        assert_eq!(recording.kinds(), vec![NotifyKind::Down, NotifyKind::Recovered]);
        let events = recording.events.lock().unwrap();
        assert!(events[1].detail.contains("5 minute"));
    }

    #[tokio::test]
    async fn test_recovery_without_open_incident_is_noop() {
        let (store, tracker, recording, id) = setup_with(0);
        tracker.observe(id, "shop", &outcome(id, Status::Up, Some(Transition::Recovered), Utc::now()));
        assert!(store.list_incidents(Some(id), 10).unwrap().is_empty());
        settle().await;
        assert!(recording.kinds().is_empty());
    }

    #[tokio::test]
    async fn test_failed_open_is_retried_while_still_down() {
        let (store, tracker, _recording, id) = setup_with(1);
        let start = Utc::now();

        tracker.observe(id, "shop", &outcome(id, Status::Down, Some(Transition::WentDown), start));
        assert!(store.list_incidents(Some(id), 10).unwrap().is_empty());

        tracker.observe(id, "shop", &outcome(id, Status::Down, None, start + ChronoDuration::minutes(1)));
        let incidents = store.list_incidents(Some(id), 10).unwrap();
        assert_eq!(incidents.len(), 1);
        // The retry keeps the original transition time.
        assert_eq!(incidents[0].started_at, start);
    }

    #[tokio::test]
    async fn test_pending_retry_dropped_once_status_moves_on() {
        let (store, tracker, _recording, id) = setup_with(1);
        let start = Utc::now();

        tracker.observe(id, "shop", &outcome(id, Status::Down, Some(Transition::WentDown), start));
        tracker.observe(id, "shop", &outcome(id, Status::Up, None, start + ChronoDuration::minutes(1)));
        tracker.observe(id, "shop", &outcome(id, Status::Up, None, start + ChronoDuration::minutes(2)));
        assert!(store.list_incidents(Some(id), 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_certificate_incident_lifecycle() {
        let (store, tracker, recording, id) = setup_with(0);
        let now = Utc::now();

        tracker.observe_certificate(id, "shop", 12, now);
        tracker.observe_certificate(id, "shop", 11, now + ChronoDuration::days(1));
        let open = store
            .get_open_incident(id, IncidentKind::CertificateExpiry)
            .unwrap()
            .unwrap();
        assert!(open.detail.contains("12 day"));
        assert_eq!(store.list_incidents(Some(id), 10).unwrap().len(), 1);

        // Outage transitions leave certificate incidents alone.
        tracker.observe(id, "shop", &outcome(id, Status::Up, Some(Transition::Recovered), now));
        assert!(store
            .get_open_incident(id, IncidentKind::CertificateExpiry)
            .unwrap()
            .is_some());

        tracker.observe_certificate(id, "shop", 89, now + ChronoDuration::days(2));
        assert!(store
            .get_open_incident(id, IncidentKind::CertificateExpiry)
            .unwrap()
            .is_none());

        settle().await;
        assert_eq!(recording.kinds(), vec![NotifyKind::CertificateExpiry]);
    }

    #[tokio::test]
    async fn test_certificate_threshold_is_exclusive() {
        let (store, tracker, _recording, id) = setup_with(0);
        tracker.observe_certificate(id, "shop", 30, Utc::now());
        assert!(store.list_incidents(Some(id), 10).unwrap().is_empty());
        tracker.observe_certificate(id, "shop", 29, Utc::now());
        assert_eq!(store.list_incidents(Some(id), 10).unwrap().len(), 1);
    }
}
