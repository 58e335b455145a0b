//! JSON webhook channel.

use async_trait::async_trait;
use std::time::Duration;

use super::{NotifyError, NotifyEvent, Notifier};

const ATTEMPTS: u32 = 3;

pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn post_once(&self, event: &NotifyEvent) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .timeout(Duration::from_secs(10))
            .json(event)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn channel(&self) -> &str {
        "webhook"
    }

    /// Up to three attempts with 100ms then 200ms backoff.
    async fn deliver(&self, event: &NotifyEvent) -> Result<(), NotifyError> {
        let mut attempt = 0;
        loop {
            match self.post_once(event).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 < ATTEMPTS => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        target_id = event.target_id,
                        "Webhook send failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(100 * 2u64.pow(attempt))).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotifyKind;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/hook", addr)
    }

    fn event() -> NotifyEvent {
        NotifyEvent {
            target_id: 7,
            target_name: "shop".to_string(),
            kind: NotifyKind::Recovered,
            detail: "back up after 3 minutes".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let hits = Arc::new(AtomicU32::new(0));
        let router = Router::new()
            .route(
                "/hook",
                post(
                    |State(hits): State<Arc<AtomicU32>>, Json(body): Json<serde_json::Value>| async move {
                        assert_eq!(body["kind"], "recovered");
                        if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                            StatusCode::BAD_GATEWAY
                        } else {
                            StatusCode::OK
                        }
                    },
                ),
            )
            .with_state(hits.clone());
        let url = serve(router).await;

        WebhookNotifier::new(&url).deliver(&event()).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_three_attempts() {
        let hits = Arc::new(AtomicU32::new(0));
        let router = Router::new()
            .route(
                "/hook",
                post(|State(hits): State<Arc<AtomicU32>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    StatusCode::INTERNAL_SERVER_ERROR
                }),
            )
            .with_state(hits.clone());
        let url = serve(router).await;

        let err = WebhookNotifier::new(&url).deliver(&event()).await.unwrap_err();
        assert!(matches!(err, NotifyError::Status(500)));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
