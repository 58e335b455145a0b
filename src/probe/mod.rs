//! Probe module for uptime checks.
//!
//! One prober per protocol family behind the [`Prober`] trait. [`run_probe`]
//! turns any prober into a [`CheckResult`] and never fails.

mod http;
mod ping;
mod tcp;
mod tls;
mod websocket;

pub use http::*;
pub use ping::*;
pub use tcp::*;
pub use tls::*;
pub use websocket::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::db::{CheckStatus, ConfigError, Protocol, TargetConfig};

/// Probe error types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error("timeout: no response within {0:?}")]
    Timeout(Duration),
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("expected status {expected}, received {received}")]
    UnexpectedStatus { expected: u16, received: u16 },
    #[error("keyword not found: {0:?}")]
    KeywordNotFound(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ConfigError> for ProbeError {
    fn from(e: ConfigError) -> Self {
        ProbeError::Config(e.to_string())
    }
}

impl ProbeError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ProbeError::Timeout(_) => FailureKind::Timeout,
            ProbeError::Refused(_) => FailureKind::Refused,
            ProbeError::Network(_) | ProbeError::Tls(_) | ProbeError::Command(_) => {
                FailureKind::Transport
            }
            ProbeError::UnexpectedStatus { .. } | ProbeError::KeywordNotFound(_) => {
                FailureKind::Expectation
            }
            ProbeError::Config(_) | ProbeError::Internal(_) => FailureKind::Internal,
        }
    }

    /// Classify an I/O error from a connect attempt.
    pub fn from_io(e: &std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::ConnectionRefused => ProbeError::Refused(e.to_string()),
            _ => ProbeError::Network(e.to_string()),
        }
    }
}

/// Why a check came back down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Timeout,
    Refused,
    Transport,
    Expectation,
    Internal,
}

/// What a successful probe observed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeOutcome {
    pub status_code: Option<u16>,
}

/// Result of one check attempt. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub status: CheckStatus,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
    pub timestamp: DateTime<Utc>,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl CheckResult {
    pub fn up(elapsed: Duration, status_code: Option<u16>) -> Self {
        Self {
            status: CheckStatus::Up,
            elapsed,
            status_code,
            error: None,
            failure: None,
            timestamp: Utc::now(),
        }
    }

    pub fn down(elapsed: Duration, error: &ProbeError) -> Self {
        let status_code = match error {
            ProbeError::UnexpectedStatus { received, .. } => Some(*received),
            _ => None,
        };
        Self {
            status: CheckStatus::Down,
            elapsed,
            status_code,
            error: Some(error.to_string()),
            failure: Some(error.kind()),
            timestamp: Utc::now(),
        }
    }

    pub fn is_up(&self) -> bool {
        self.status == CheckStatus::Up
    }

    pub fn response_time_ms(&self) -> u64 {
        self.elapsed.as_millis() as u64
    }
}

/// Executes exactly one check attempt. Implementations never retry.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(
        &self,
        target: &TargetConfig,
        timeout: Duration,
    ) -> Result<ProbeOutcome, ProbeError>;
}

/// Run one probe under the target's timeout.
///
/// Panics and deadline overruns become down results. A response whose
/// elapsed time reaches the timeout counts as a timeout.
pub async fn run_probe(prober: &dyn Prober, target: &TargetConfig) -> CheckResult {
    let timeout = target.timeout();
    let start = Instant::now();

    let attempt = AssertUnwindSafe(prober.probe(target, timeout)).catch_unwind();
    let result = match tokio::time::timeout(timeout, attempt).await {
        Err(_) => Err(ProbeError::Timeout(timeout)),
        Ok(Err(panic)) => Err(ProbeError::Internal(panic_message(&*panic))),
        Ok(Ok(result)) => result,
    };
    let elapsed = start.elapsed();

    match result {
        Ok(_) if elapsed >= timeout => CheckResult::down(elapsed, &ProbeError::Timeout(timeout)),
        Ok(outcome) => CheckResult::up(elapsed, outcome.status_code),
        Err(e) => CheckResult::down(elapsed, &e),
    }
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("probe panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("probe panicked: {}", s)
    } else {
        "probe panicked".to_string()
    }
}

/// Dispatches on the target's protocol tag.
pub struct ProtocolProber {
    http: HttpProber,
    tcp: TcpProber,
    websocket: WebSocketProber,
    ping: PingProber,
}

impl ProtocolProber {
    pub fn new() -> Result<Self, ProbeError> {
        Ok(Self {
            http: HttpProber::new()?,
            tcp: TcpProber,
            websocket: WebSocketProber::new()?,
            ping: PingProber,
        })
    }
}

#[async_trait]
impl Prober for ProtocolProber {
    async fn probe(
        &self,
        target: &TargetConfig,
        timeout: Duration,
    ) -> Result<ProbeOutcome, ProbeError> {
        match target.protocol {
            Protocol::Http | Protocol::Https | Protocol::Keyword => {
                self.http.probe(target, timeout).await
            }
            Protocol::TcpPort => self.tcp.probe(target, timeout).await,
            Protocol::Ws | Protocol::Wss => self.websocket.probe(target, timeout).await,
            Protocol::Ping => self.ping.probe(target, timeout).await,
        }
    }
}
