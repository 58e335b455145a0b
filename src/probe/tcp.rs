//! TCP port probe.

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;

use super::{ProbeError, ProbeOutcome, Prober};
use crate::db::TargetConfig;

/// Open a TCP connection to `host:port`, bounded by `timeout`.
pub async fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, ProbeError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::from_io(&e))?;
    // Probes exchange a handful of bytes; don't wait on Nagle.
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// A successful connect means up.
pub struct TcpProber;

#[async_trait]
impl Prober for TcpProber {
    async fn probe(
        &self,
        target: &TargetConfig,
        timeout: Duration,
    ) -> Result<ProbeOutcome, ProbeError> {
        let (host, port) = target.socket_endpoint()?;
        let stream = connect_tcp(&host, port, timeout).await?;
        drop(stream);
        Ok(ProbeOutcome::default())
    }
}
