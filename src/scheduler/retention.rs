//! Retention manager for cleaning up old check logs.

use crate::db::{CheckStore, DbError};

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Manager for deleting check logs past the retention horizon.
pub struct RetentionManager {
    store: Arc<dyn CheckStore>,
    horizon: chrono::Duration,
    period: Duration,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl RetentionManager {
    pub fn new(store: Arc<dyn CheckStore>, horizon: chrono::Duration) -> Self {
        Self {
            store,
            horizon,
            period: Duration::from_secs(3600),
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the retention manager background task.
    pub fn start(self: &Arc<Self>) {
        let manager = self.clone();

        tokio::spawn(async move {
            let (tx, _) = tokio::sync::broadcast::channel(1);
            {
                let mut stop_guard = manager.stop.lock().await;
                *stop_guard = Some(tx.clone());
            }

            let mut rx = tx.subscribe();
            let mut interval = tokio::time::interval(manager.period);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        if let Err(e) = manager.purge_once() {
                            tracing::error!("RetentionManager: Failed to purge check logs: {}", e);
                        }
                    }
                }
            }
        });
    }

    /// Stop the retention manager.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }

    /// Delete everything older than the horizon. Counters are not touched.
    pub fn purge_once(&self) -> Result<usize, DbError> {
        let cutoff = Utc::now() - self.horizon;
        let removed = self.store.purge_check_logs_before(cutoff)?;
        if removed > 0 {
            tracing::info!(removed, "RetentionManager: Purged check logs before {}", cutoff);
        }
        Ok(removed)
    }
}
