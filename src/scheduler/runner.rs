//! One check, end to end: probe, record, incidents, certificate side-check.

use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use crate::db::{CheckStore, Target};
use crate::incident::IncidentTracker;
use crate::probe::{panic_message, run_probe, CertificateSource, CheckResult, ProbeError, Prober};
use crate::recorder::ResultRecorder;

pub struct CheckRunner {
    prober: Arc<dyn Prober>,
    recorder: ResultRecorder,
    tracker: Arc<IncidentTracker>,
    certificates: Option<Arc<dyn CertificateSource>>,
}

impl CheckRunner {
    pub fn new(
        prober: Arc<dyn Prober>,
        checks: Arc<dyn CheckStore>,
        tracker: Arc<IncidentTracker>,
        certificates: Option<Arc<dyn CertificateSource>>,
    ) -> Self {
        Self {
            prober,
            recorder: ResultRecorder::new(checks),
            tracker,
            certificates,
        }
    }

    pub fn tracker(&self) -> &Arc<IncidentTracker> {
        &self.tracker
    }

    /// Run the whole pipeline for `target`. Never fails and never panics;
    /// the caller holds the target's busy permit for the duration.
    pub async fn execute(&self, target: &Target) -> CheckResult {
        match AssertUnwindSafe(self.pipeline(target)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(&*panic);
                tracing::error!(target_id = target.id, "Check pipeline failed: {}", message);
                CheckResult::down(
                    Duration::ZERO,
                    &ProbeError::Internal("unexpected failure during check".to_string()),
                )
            }
        }
    }

    async fn pipeline(&self, target: &Target) -> CheckResult {
        let result = run_probe(self.prober.as_ref(), &target.config).await;
        tracing::debug!(
            target_id = target.id,
            status = result.status.as_str(),
            elapsed_ms = result.response_time_ms(),
            "Probe finished"
        );

        let outcome = match self.recorder.record(target.id, &result) {
            Ok(Some(outcome)) => outcome,
            Ok(None) => return result,
            Err(e) => {
                tracing::error!(target_id = target.id, "Failed to record check: {}", e);
                return result;
            }
        };

        if let Some(transition) = outcome.transition {
            tracing::info!(target_id = target.id, "Transition {:?}", transition);
        }
        self.tracker.observe(target.id, &target.config.name, &outcome);

        self.check_certificate(target).await;
        result
    }

    /// Failures here are logged and change nothing.
    async fn check_certificate(&self, target: &Target) {
        let Some(source) = &self.certificates else {
            return;
        };
        let Some((host, port)) = target.config.certificate_endpoint() else {
            return;
        };

        match source.inspect(&host, port, target.config.timeout()).await {
            Ok(info) => {
                tracing::debug!(
                    target_id = target.id,
                    days_until_expiry = info.days_until_expiry,
                    "Certificate checked"
                );
                self.tracker.observe_certificate(
                    target.id,
                    &target.config.name,
                    info.days_until_expiry,
                    Utc::now(),
                );
            }
            Err(e) => {
                tracing::warn!(target_id = target.id, "Certificate check failed: {}", e);
            }
        }
    }
}
