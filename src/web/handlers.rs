//! HTTP request handlers.

use super::AppState;
use crate::db::{TargetConfig, TargetId};
use crate::engine::EngineError;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

fn error_response(e: EngineError) -> Response {
    let status = match &e {
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Busy(_) => StatusCode::CONFLICT,
        EngineError::Config(_) => StatusCode::BAD_REQUEST,
        EngineError::Db(err) => {
            tracing::error!("Storage failure: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, e.to_string()).into_response()
}

fn respond<T: Serialize>(result: Result<T, EngineError>) -> Response {
    match result {
        Ok(value) => Json(value).into_response(),
        Err(e) => error_response(e),
    }
}

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

// ============================================================================
// API: Targets
// ============================================================================

pub async fn handle_list_targets(State(state): State<AppState>) -> Response {
    respond(state.engine.list_targets())
}

pub async fn handle_get_target(
    State(state): State<AppState>,
    Path(id): Path<TargetId>,
) -> Response {
    respond(state.engine.get_target(id))
}

pub async fn handle_create_target(
    State(state): State<AppState>,
    Json(config): Json<TargetConfig>,
) -> Response {
    match state.engine.create_target(config).await {
        Ok(target) => (StatusCode::CREATED, Json(target)).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn handle_update_target(
    State(state): State<AppState>,
    Path(id): Path<TargetId>,
    Json(config): Json<TargetConfig>,
) -> Response {
    respond(state.engine.update_target(id, config).await)
}

pub async fn handle_delete_target(
    State(state): State<AppState>,
    Path(id): Path<TargetId>,
) -> Response {
    match state.engine.delete_target(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn handle_pause_target(
    State(state): State<AppState>,
    Path(id): Path<TargetId>,
) -> Response {
    respond(state.engine.pause(id).await)
}

pub async fn handle_resume_target(
    State(state): State<AppState>,
    Path(id): Path<TargetId>,
) -> Response {
    respond(state.engine.resume(id).await)
}

pub async fn handle_force_check(
    State(state): State<AppState>,
    Path(id): Path<TargetId>,
) -> Response {
    respond(state.engine.force_check(id).await)
}

// ============================================================================
// API: History
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub period: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// `24h`, `7d` or `30d`.
pub fn parse_period(period: &str) -> Option<ChronoDuration> {
    match period {
        "24h" => Some(ChronoDuration::hours(24)),
        "7d" => Some(ChronoDuration::days(7)),
        "30d" => Some(ChronoDuration::days(30)),
        _ => None,
    }
}

pub async fn handle_history(
    State(state): State<AppState>,
    Path(id): Path<TargetId>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let since = match query.period.as_deref().map(parse_period) {
        None => Some(ChronoDuration::hours(24)),
        Some(Some(d)) => Some(d),
        Some(None) => {
            return (StatusCode::BAD_REQUEST, "period must be one of 24h, 7d, 30d").into_response()
        }
    };
    respond(state.engine.history(id, since, clamp_limit(query.limit)))
}

#[derive(Debug, Deserialize)]
pub struct UptimeQuery {
    #[serde(default)]
    pub last: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct UptimeResponse {
    pub target_id: TargetId,
    pub window: usize,
    /// Rolling uptime over the last `window` checks; absent before the first check.
    pub window_uptime: Option<f64>,
    /// All-time uptime from the counters.
    pub uptime: f64,
}

pub async fn handle_uptime(
    State(state): State<AppState>,
    Path(id): Path<TargetId>,
    Query(query): Query<UptimeQuery>,
) -> Response {
    let window = clamp_limit(query.last);
    let result = state.engine.get_target(id).and_then(|target| {
        Ok(UptimeResponse {
            target_id: id,
            window,
            window_uptime: state.engine.window_uptime(id, window)?,
            uptime: target.stats.uptime,
        })
    });
    respond(result)
}

// ============================================================================
// API: Incidents and stats
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct IncidentsQuery {
    #[serde(default)]
    pub target_id: Option<TargetId>,
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn handle_incidents(
    State(state): State<AppState>,
    Query(query): Query<IncidentsQuery>,
) -> Response {
    respond(state.engine.incidents(query.target_id, clamp_limit(query.limit)))
}

pub async fn handle_stats(State(state): State<AppState>) -> Response {
    respond(state.engine.stats())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::db::{MemoryStore, Protocol};
    use crate::engine::Engine;
    use crate::notify::NotifierGateway;
    use crate::probe::{ProbeError, ProbeOutcome, Prober};
    use crate::web::Server;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;

    struct Reachable;

    #[async_trait]
    impl Prober for Reachable {
        async fn probe(&self, _: &TargetConfig, _: Duration) -> Result<ProbeOutcome, ProbeError> {
            Ok(ProbeOutcome {
                status_code: Some(204),
            })
        }
    }

    async fn spawn_api() -> String {
        let config = ServerConfig {
            start_jitter_ms: 0,
            ..Default::default()
        };
        let engine = Arc::new(Engine::new(
            &config,
            Arc::new(MemoryStore::new()),
            Arc::new(Reachable),
            None,
            NotifierGateway::default(),
        ));
        let router = Server::new(engine, 0).routes();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn body() -> Value {
        json!({
            "name": "docs",
            "protocol": "https",
            "address": "https://docs.example.com",
            "paused": true
        })
    }

    #[test]
    fn test_parse_period() {
        assert_eq!(parse_period("7d"), Some(ChronoDuration::days(7)));
        assert_eq!(parse_period("1y"), None);
    }

    #[test]
    fn test_clamp_limit() {
        assert_eq!(clamp_limit(None), DEFAULT_LIMIT);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(50_000)), MAX_LIMIT);
    }

    #[tokio::test]
    async fn test_target_lifecycle_over_http() {
        let base = spawn_api().await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{}/api/targets", base))
            .json(&body())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created: Value = response.json().await.unwrap();
        assert_eq!(created["status"], "pending");
        assert_eq!(created["protocol"], Protocol::Https.as_str());
        let id = created["id"].as_i64().unwrap();

        let checked: Value = client
            .post(format!("{}/api/targets/{}/check", base, id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(checked["status"], "up");
        assert_eq!(checked["status_code"], 204);

        let history: Vec<Value> = client
            .get(format!("{}/api/targets/{}/history?period=7d", base, id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(history.len(), 1);

        let uptime: Value = client
            .get(format!("{}/api/targets/{}/uptime?last=10", base, id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(uptime["window_uptime"], 100.0);

        let stats: Value = client
            .get(format!("{}/api/stats", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stats["total_targets"], 1);

        let deleted = client
            .delete(format!("{}/api/targets/{}", base, id))
            .send()
            .await
            .unwrap();
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

        let missing = client
            .get(format!("{}/api/targets/{}", base, id))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bad_requests() {
        let base = spawn_api().await;
        let client = reqwest::Client::new();

        let mut invalid = body();
        invalid["interval_secs"] = json!(10);
        let response = client
            .post(format!("{}/api/targets", base))
            .json(&invalid)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let created: Value = client
            .post(format!("{}/api/targets", base))
            .json(&body())
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let response = client
            .get(format!("{}/api/targets/{}/history?period=1y", base, created["id"]))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = client
            .post(format!("{}/api/targets/999/pause", base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
