//! Configuration module for UpTrail.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the admin API (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "uptrail.db")
    pub db_path: String,
    /// Check log entries older than this many days are purged (default: 30)
    pub log_retention_days: i64,
    /// Raise a certificate-expiry incident below this many days (default: 30)
    pub cert_warning_days: i64,
    /// How often the target registry is polled for changes (default: 30s)
    pub registry_poll_secs: u64,
    /// Upper bound of the random delay before a target's first check (default: 1000ms)
    pub start_jitter_ms: u64,
    /// Optional webhook receiving incident notifications
    pub webhook_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "uptrail.db".to_string(),
            log_retention_days: 30,
            cert_warning_days: 30,
            registry_poll_secs: 30,
            start_jitter_ms: 1000,
            webhook_url: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `UPTRAIL_HTTP_PORT`: HTTP port (default: 8080)
    /// - `UPTRAIL_DB_PATH`: Database file path (default: "uptrail.db")
    /// - `UPTRAIL_LOG_RETENTION_DAYS`: Check log horizon in days (default: 30)
    /// - `UPTRAIL_CERT_WARNING_DAYS`: Certificate expiry threshold in days (default: 30)
    /// - `UPTRAIL_REGISTRY_POLL_SECS`: Registry polling period (default: 30)
    /// - `UPTRAIL_START_JITTER_MS`: Maximum start jitter per target (default: 1000)
    /// - `UPTRAIL_WEBHOOK_URL`: Webhook endpoint for notifications (default: unset)
    pub fn load() -> Self {
        let mut cfg = Self::default();

        override_from_env("UPTRAIL_HTTP_PORT", &mut cfg.http_port);
        override_from_env("UPTRAIL_LOG_RETENTION_DAYS", &mut cfg.log_retention_days);
        override_from_env("UPTRAIL_CERT_WARNING_DAYS", &mut cfg.cert_warning_days);
        override_from_env("UPTRAIL_REGISTRY_POLL_SECS", &mut cfg.registry_poll_secs);
        override_from_env("UPTRAIL_START_JITTER_MS", &mut cfg.start_jitter_ms);

        if let Ok(db_path) = env::var("UPTRAIL_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Ok(url) = env::var("UPTRAIL_WEBHOOK_URL") {
            if !url.trim().is_empty() {
                cfg.webhook_url = Some(url);
            }
        }

        cfg
    }

    pub fn registry_poll_interval(&self) -> Duration {
        Duration::from_secs(self.registry_poll_secs.max(1))
    }

    pub fn start_jitter(&self) -> Duration {
        Duration::from_millis(self.start_jitter_ms)
    }

    pub fn log_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.log_retention_days.max(1))
    }
}

/// Replace `slot` with the parsed value of `key`, keeping the default when
/// the variable is unset or unparseable.
fn override_from_env<T: FromStr>(key: &str, slot: &mut T) {
    if let Ok(raw) = env::var(key) {
        match raw.trim().parse() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!("Ignoring unparseable {}={:?}", key, raw),
        }
    }
}
