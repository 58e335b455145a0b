//! Database model types.

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub type TargetId = i64;

pub const MIN_INTERVAL_SECS: u64 = 60;
pub const MIN_TIMEOUT_SECS: u64 = 5;
pub const MAX_TIMEOUT_SECS: u64 = 300;

const HTTP_METHODS: &[&str] = &["GET", "HEAD", "POST", "PUT", "DELETE", "PATCH", "OPTIONS"];

/// How a target is probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    Http,
    Https,
    Ws,
    Wss,
    TcpPort,
    Ping,
    Keyword,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Ws => "ws",
            Protocol::Wss => "wss",
            Protocol::TcpPort => "tcp-port",
            Protocol::Ping => "ping",
            Protocol::Keyword => "keyword",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            "ws" => Ok(Protocol::Ws),
            "wss" => Ok(Protocol::Wss),
            "tcp-port" => Ok(Protocol::TcpPort),
            "ping" => Ok(Protocol::Ping),
            "keyword" => Ok(Protocol::Keyword),
            other => Err(ConfigError::Protocol(other.to_string())),
        }
    }
}

/// Last recorded status of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Pending,
    Up,
    Down,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Up => "up",
            Status::Down => "down",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Status::Pending),
            "up" => Some(Status::Up),
            "down" => Some(Status::Down),
            _ => None,
        }
    }
}

/// Outcome of a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Up,
    Down,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Up => "up",
            CheckStatus::Down => "down",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "up" => Some(CheckStatus::Up),
            "down" => Some(CheckStatus::Down),
            _ => None,
        }
    }
}

impl From<CheckStatus> for Status {
    fn from(status: CheckStatus) -> Self {
        match status {
            CheckStatus::Up => Status::Up,
            CheckStatus::Down => Status::Down,
        }
    }
}

/// Target configuration error, raised when a target is created or edited.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("name must not be empty")]
    EmptyName,
    #[error("unsupported protocol {0:?}")]
    Protocol(String),
    #[error("invalid address {address:?}: {reason}")]
    Address { address: String, reason: String },
    #[error("unsupported HTTP method {0:?}")]
    Method(String),
    #[error("invalid header {0:?}")]
    Header(String),
    #[error("keyword checks need a non-empty keyword")]
    MissingKeyword,
    #[error("keyword checks cannot use HEAD, which returns no body")]
    KeywordWithHead,
    #[error("expected status {0} is not a valid HTTP status")]
    ExpectedStatus(u16),
    #[error("interval must be at least 60s, got {0}s")]
    Interval(u64),
    #[error("timeout must be between 5s and 300s and below the interval, got {0}s")]
    Timeout(u64),
}

fn address_error(address: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Address {
        address: address.to_string(),
        reason: reason.into(),
    }
}

fn default_interval() -> u64 {
    300
}

fn default_timeout() -> u64 {
    30
}

fn default_expected_status() -> u16 {
    200
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_true() -> bool {
    true
}

/// Everything the admin side may edit about a target. Statistics live in
/// [`TargetStats`] and are never part of the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    pub protocol: Protocol,
    /// URL for http/https/ws/wss/keyword, `host:port` for tcp-port, bare host for ping.
    pub address: String,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,
    #[serde(default)]
    pub keyword: Option<String>,
    /// Overrides the port taken from the address.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default = "default_true")]
    pub follow_redirects: bool,
    /// Inspect the TLS certificate expiry of https targets.
    #[serde(default)]
    pub cert_check: bool,
    /// Perform a full WebSocket upgrade instead of a transport connect.
    #[serde(default)]
    pub ws_handshake: bool,
    #[serde(default)]
    pub paused: bool,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            protocol: Protocol::Https,
            address: String::new(),
            interval_secs: default_interval(),
            timeout_secs: default_timeout(),
            expected_status: default_expected_status(),
            keyword: None,
            port: None,
            method: default_method(),
            headers: BTreeMap::new(),
            body: None,
            follow_redirects: true,
            cert_check: false,
            ws_handshake: false,
            paused: false,
        }
    }
}

impl TargetConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Reject configurations that could never be checked.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }

        if self.interval_secs < MIN_INTERVAL_SECS {
            return Err(ConfigError::Interval(self.interval_secs));
        }

        if self.timeout_secs < MIN_TIMEOUT_SECS
            || self.timeout_secs > MAX_TIMEOUT_SECS
            || self.timeout_secs >= self.interval_secs
        {
            return Err(ConfigError::Timeout(self.timeout_secs));
        }

        match self.protocol {
            Protocol::Http | Protocol::Https | Protocol::Keyword => {
                self.http_url()?;
                self.validate_http_options()?;
            }
            Protocol::Ws | Protocol::Wss | Protocol::TcpPort => {
                self.socket_endpoint()?;
            }
            Protocol::Ping => {
                self.ping_host()?;
            }
        }

        if self.protocol == Protocol::Keyword
            && self.keyword.as_deref().map_or(true, |k| k.is_empty())
        {
            return Err(ConfigError::MissingKeyword);
        }

        Ok(())
    }

    fn validate_http_options(&self) -> Result<(), ConfigError> {
        if !HTTP_METHODS.contains(&self.method.to_uppercase().as_str()) {
            return Err(ConfigError::Method(self.method.clone()));
        }

        if !(100..=599).contains(&self.expected_status) {
            return Err(ConfigError::ExpectedStatus(self.expected_status));
        }

        let wants_keyword = self.protocol == Protocol::Keyword
            || self.keyword.as_deref().is_some_and(|k| !k.is_empty());
        if wants_keyword && self.method.eq_ignore_ascii_case("HEAD") {
            return Err(ConfigError::KeywordWithHead);
        }

        for (name, value) in &self.headers {
            if HeaderName::from_bytes(name.as_bytes()).is_err()
                || HeaderValue::from_str(value).is_err()
            {
                return Err(ConfigError::Header(name.clone()));
            }
        }

        Ok(())
    }

    /// Parse the address as the URL an HTTP-based probe requests.
    pub fn http_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(self.address.trim())
            .map_err(|e| address_error(&self.address, e.to_string()))?;

        let scheme_ok = match self.protocol {
            Protocol::Http => url.scheme() == "http",
            Protocol::Https => url.scheme() == "https",
            Protocol::Keyword => matches!(url.scheme(), "http" | "https"),
            Protocol::Ws => url.scheme() == "ws",
            Protocol::Wss => url.scheme() == "wss",
            Protocol::TcpPort | Protocol::Ping => false,
        };
        if !scheme_ok {
            return Err(address_error(
                &self.address,
                format!("scheme {:?} does not match protocol {}", url.scheme(), self.protocol),
            ));
        }

        if url.host_str().map_or(true, str::is_empty) {
            return Err(address_error(&self.address, "missing host"));
        }

        Ok(url)
    }

    /// Host and port a transport-level probe connects to.
    ///
    /// The `port` override wins over the address; WebSocket URLs without a
    /// port fall back to 80/443.
    pub fn socket_endpoint(&self) -> Result<(String, u16), ConfigError> {
        match self.protocol {
            Protocol::Ws | Protocol::Wss => {
                let url = self.http_url()?;
                let host = url
                    .host_str()
                    .map(|h| h.trim_matches(|c| c == '[' || c == ']').to_string())
                    .ok_or_else(|| address_error(&self.address, "missing host"))?;
                let port = self
                    .port
                    .or_else(|| url.port_or_known_default())
                    .ok_or_else(|| address_error(&self.address, "missing port"))?;
                Ok((host, port))
            }
            Protocol::TcpPort => {
                let (host, port) = split_host_port(self.address.trim())
                    .map_err(|reason| address_error(&self.address, reason))?;
                let port = self
                    .port
                    .or(port)
                    .ok_or_else(|| address_error(&self.address, "missing port"))?;
                if port == 0 {
                    return Err(address_error(&self.address, "port 0"));
                }
                Ok((host, port))
            }
            _ => Err(address_error(
                &self.address,
                format!("protocol {} has no socket endpoint", self.protocol),
            )),
        }
    }

    /// Bare host for ICMP checks.
    pub fn ping_host(&self) -> Result<String, ConfigError> {
        let host = self.address.trim();
        if host.is_empty() {
            return Err(address_error(&self.address, "empty host"));
        }
        if host.parse::<IpAddr>().is_ok() {
            return Ok(host.to_string());
        }
        if host.contains("://") || host.contains('/') || host.contains(':') || host.contains(' ') {
            return Err(address_error(&self.address, "ping expects a bare host"));
        }
        Ok(host.to_string())
    }

    /// Host and port whose certificate is inspected, if this target asks for it.
    pub fn certificate_endpoint(&self) -> Option<(String, u16)> {
        if !self.cert_check {
            return None;
        }
        if !matches!(self.protocol, Protocol::Https | Protocol::Keyword) {
            return None;
        }
        let url = self.http_url().ok()?;
        if url.scheme() != "https" {
            return None;
        }
        let host = url.host_str()?.trim_matches(|c| c == '[' || c == ']').to_string();
        Some((host, url.port_or_known_default().unwrap_or(443)))
    }
}

/// Split `host:port`, `host` or `[v6]:port`.
fn split_host_port(address: &str) -> Result<(String, Option<u16>), String> {
    if address.is_empty() {
        return Err("empty address".to_string());
    }

    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| "unterminated IPv6 literal".to_string())?;
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(p.parse::<u16>().map_err(|e| format!("bad port: {}", e))?),
            None if tail.is_empty() => None,
            None => return Err("unexpected characters after IPv6 literal".to_string()),
        };
        return Ok((host.to_string(), port));
    }

    if address.parse::<IpAddr>().is_ok() {
        return Ok((address.to_string(), None));
    }

    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port.parse::<u16>().map_err(|e| format!("bad port: {}", e))?;
            Ok((host.to_string(), Some(port)))
        }
        Some(_) => Err("missing host".to_string()),
        None => Ok((address.to_string(), None)),
    }
}

/// Rolling statistics of a target. Only the result recorder writes these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetStats {
    pub status: Status,
    pub last_checked: Option<DateTime<Utc>>,
    pub response_time_ms: Option<u64>,
    pub total_checks: u64,
    pub successful_checks: u64,
    pub failed_checks: u64,
    pub uptime: f64,
}

impl Default for TargetStats {
    fn default() -> Self {
        Self {
            status: Status::Pending,
            last_checked: None,
            response_time_ms: None,
            total_checks: 0,
            successful_checks: 0,
            failed_checks: 0,
            uptime: 100.0,
        }
    }
}

/// Uptime percentage over all recorded checks; 100 before the first check.
pub fn uptime_percentage(successful: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        successful as f64 / total as f64 * 100.0
    }
}

/// A monitored target: configuration plus recorded statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    #[serde(flatten)]
    pub config: TargetConfig,
    #[serde(flatten)]
    pub stats: TargetStats,
    pub created_at: DateTime<Utc>,
}

impl Target {
    pub fn is_active(&self) -> bool {
        !self.config.paused
    }
}

/// One executed check. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckLogEntry {
    pub id: i64,
    pub target_id: TargetId,
    pub status: CheckStatus,
    pub response_time_ms: u64,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IncidentKind {
    Outage,
    Degraded,
    CertificateExpiry,
}

impl IncidentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentKind::Outage => "outage",
            IncidentKind::Degraded => "degraded",
            IncidentKind::CertificateExpiry => "certificate-expiry",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "outage" => Some(IncidentKind::Outage),
            "degraded" => Some(IncidentKind::Degraded),
            "certificate-expiry" => Some(IncidentKind::CertificateExpiry),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: i64,
    pub target_id: TargetId,
    pub kind: IncidentKind,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub resolved: bool,
    pub detail: String,
    pub notifications_sent: Vec<String>,
}

impl Incident {
    pub fn is_open(&self) -> bool {
        !self.resolved
    }
}

#[derive(Debug, Clone)]
pub struct NewIncident {
    pub target_id: TargetId,
    pub kind: IncidentKind,
    pub started_at: DateTime<Utc>,
    pub detail: String,
}
