//! Notifier gateway.
//!
//! Incident events are handed to every configured channel on its own task.
//! Delivery never blocks or fails the check pipeline.

mod webhook;

pub use webhook::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use crate::db::TargetId;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("endpoint returned HTTP {0}")]
    Status(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotifyKind {
    Down,
    Recovered,
    CertificateExpiry,
}

impl NotifyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyKind::Down => "down",
            NotifyKind::Recovered => "recovered",
            NotifyKind::CertificateExpiry => "certificate-expiry",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotifyEvent {
    pub target_id: TargetId,
    pub target_name: String,
    pub kind: NotifyKind,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

/// One delivery channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn channel(&self) -> &str;

    async fn deliver(&self, event: &NotifyEvent) -> Result<(), NotifyError>;
}

/// Writes events to the log. Always enabled.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn channel(&self) -> &str {
        "log"
    }

    async fn deliver(&self, event: &NotifyEvent) -> Result<(), NotifyError> {
        tracing::info!(
            target_id = event.target_id,
            kind = event.kind.as_str(),
            "[{}] {}: {}",
            event.target_name,
            event.kind.as_str(),
            event.detail
        );
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct NotifierGateway {
    channels: Vec<Arc<dyn Notifier>>,
}

impl NotifierGateway {
    pub fn new(channels: Vec<Arc<dyn Notifier>>) -> Self {
        Self { channels }
    }

    /// Log channel plus a webhook when one is configured.
    pub fn from_config(webhook_url: Option<&str>) -> Self {
        let mut channels: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
        if let Some(url) = webhook_url {
            channels.push(Arc::new(WebhookNotifier::new(url)));
        }
        Self::new(channels)
    }

    /// Dispatch `event` to every channel and return the names dispatched to.
    ///
    /// Must be called from within a tokio runtime.
    pub fn notify(&self, event: NotifyEvent) -> Vec<String> {
        let event = Arc::new(event);
        self.channels
            .iter()
            .map(|channel| {
                let channel = channel.clone();
                let event = event.clone();
                let name = channel.channel().to_string();
                tokio::spawn(async move {
                    if let Err(e) = channel.deliver(&event).await {
                        tracing::warn!(
                            target_id = event.target_id,
                            channel = channel.channel(),
                            "Notification delivery failed: {}",
                            e
                        );
                    }
                });
                name
            })
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn event() -> NotifyEvent {
        NotifyEvent {
            target_id: 1,
            target_name: "api".to_string(),
            kind: NotifyKind::Down,
            detail: "connection refused".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_notify_returns_channel_names() {
        let recording = Arc::new(RecordingNotifier::default());
        let gateway = NotifierGateway::new(vec![Arc::new(LogNotifier), recording.clone()]);

        let sent = gateway.notify(event());
        assert_eq!(sent, vec!["log".to_string(), "recording".to_string()]);

        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(recording.kinds(), vec![NotifyKind::Down]);
    }

    #[tokio::test]
    async fn test_failed_delivery_does_not_reach_caller() {
        let recording = Arc::new(RecordingNotifier::default());
        let gateway = NotifierGateway::new(vec![Arc::new(FailingNotifier), recording.clone()]);

        let sent = gateway.notify(event());
        assert_eq!(sent.len(), 2);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(recording.kinds().len(), 1);
    }

    #[test]
    fn test_from_config() {
        assert_eq!(NotifierGateway::from_config(None).channels.len(), 1);
        assert_eq!(
            NotifierGateway::from_config(Some("http://hooks.local/x")).channels.len(),
            2
        );
    }

    #[test]
    fn test_event_serializes_kind_in_kebab_case() {
        let mut e = event();
        e.kind = NotifyKind::CertificateExpiry;
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["kind"], "certificate-expiry");
    }
}
