//! Admin HTTP surface.

mod handlers;

pub use handlers::*;

use crate::engine::Engine;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

pub struct Server {
    state: AppState,
    port: u16,
}

impl Server {
    pub fn new(engine: Arc<Engine>, port: u16) -> Self {
        Self {
            state: AppState { engine },
            port,
        }
    }

    /// Build the router with all routes.
    pub fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

        Router::new()
            .route(
                "/api/targets",
                get(handlers::handle_list_targets).post(handlers::handle_create_target),
            )
            .route(
                "/api/targets/{id}",
                get(handlers::handle_get_target)
                    .put(handlers::handle_update_target)
                    .delete(handlers::handle_delete_target),
            )
            .route("/api/targets/{id}/pause", post(handlers::handle_pause_target))
            .route("/api/targets/{id}/resume", post(handlers::handle_resume_target))
            .route("/api/targets/{id}/check", post(handlers::handle_force_check))
            .route("/api/targets/{id}/history", get(handlers::handle_history))
            .route("/api/targets/{id}/uptime", get(handlers::handle_uptime))
            .route("/api/incidents", get(handlers::handle_incidents))
            .route("/api/stats", get(handlers::handle_stats))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), std::io::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
    }
}
