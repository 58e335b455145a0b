//! UpTrail - Uptime Monitoring Service

use uptrail::config::ServerConfig;
use uptrail::db::Store;
use uptrail::engine::Engine;
use uptrail::notify::NotifierGateway;
use uptrail::probe::{CertificateSource, ProtocolProber, TlsInspector};
use uptrail::web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("uptrail=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting UpTrail on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let prober = Arc::new(ProtocolProber::new()?);
    let certificates: Arc<dyn CertificateSource> = Arc::new(TlsInspector::new()?);
    let gateway = NotifierGateway::from_config(cfg.webhook_url.as_deref());
    if cfg.webhook_url.is_some() {
        tracing::info!("Webhook notifications enabled");
    }

    let engine = Arc::new(Engine::new(&cfg, store, prober, Some(certificates), gateway));
    engine.start().await?;

    // Start web server
    let server = Server::new(engine.clone(), cfg.http_port);
    server
        .start(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    tracing::info!("Shutting down");
    engine.shutdown().await;

    Ok(())
}
