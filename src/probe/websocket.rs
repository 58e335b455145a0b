//! WebSocket probe.
//!
//! By default reachability is a transport connect: TCP for ws, TCP plus a
//! completed TLS handshake for wss. Targets with `ws_handshake` set also
//! perform the HTTP upgrade.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::Error as WsError;

use super::{connect_tcp, tls_handshake, verified_connector, ProbeError, ProbeOutcome, Prober};
use crate::db::{Protocol, TargetConfig};

pub struct WebSocketProber {
    connector: TlsConnector,
}

impl WebSocketProber {
    pub fn new() -> Result<Self, ProbeError> {
        Ok(Self {
            connector: verified_connector()?,
        })
    }
}

#[async_trait]
impl Prober for WebSocketProber {
    async fn probe(
        &self,
        target: &TargetConfig,
        timeout: Duration,
    ) -> Result<ProbeOutcome, ProbeError> {
        let (host, port) = target.socket_endpoint()?;
        let tcp = connect_tcp(&host, port, timeout).await?;

        if target.protocol == Protocol::Wss {
            let tls = tls_handshake(&self.connector, &host, tcp, timeout).await?;
            if target.ws_handshake {
                return upgrade(target, tls).await;
            }
        } else if target.ws_handshake {
            return upgrade(target, tcp).await;
        }

        Ok(ProbeOutcome::default())
    }
}

/// Perform the WebSocket upgrade over an already connected stream.
async fn upgrade<S>(target: &TargetConfig, stream: S) -> Result<ProbeOutcome, ProbeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let url = target.http_url()?;
    match tokio_tungstenite::client_async(url.as_str(), stream).await {
        Ok((mut ws, response)) => {
            let _ = ws.close(None).await;
            Ok(ProbeOutcome {
                status_code: Some(response.status().as_u16()),
            })
        }
        Err(WsError::Http(response)) => Err(ProbeError::UnexpectedStatus {
            expected: 101,
            received: response.status().as_u16(),
        }),
        Err(WsError::Io(e)) => Err(ProbeError::from_io(&e)),
        Err(e) => Err(ProbeError::Network(format!("websocket upgrade failed: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::CheckStatus;
    use crate::probe::{run_probe, FailureKind};
    use tokio::net::TcpListener;

    fn target(protocol: Protocol, address: String) -> TargetConfig {
        TargetConfig {
            name: "socket".to_string(),
            protocol,
            address,
            timeout_secs: 5,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_ws_transport_connect_is_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let prober = WebSocketProber::new().unwrap();
        let cfg = target(Protocol::Ws, format!("ws://{}/feed", addr));
        assert_eq!(run_probe(&prober, &cfg).await.status, CheckStatus::Up);
    }

    #[tokio::test]
    async fn test_ws_closed_port_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let prober = WebSocketProber::new().unwrap();
        let result = run_probe(&prober, &target(Protocol::Ws, format!("ws://{}/", addr))).await;
        assert_eq!(result.status, CheckStatus::Down);
        assert_eq!(result.failure, Some(FailureKind::Refused));
    }

    #[tokio::test]
    async fn test_strict_handshake_completes_upgrade() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((socket, _)) = listener.accept().await {
                if let Ok(mut ws) = tokio_tungstenite::accept_async(socket).await {
                    let _ = ws.close(None).await;
                }
            }
        });

        let prober = WebSocketProber::new().unwrap();
        let mut cfg = target(Protocol::Ws, format!("ws://{}/feed", addr));
        cfg.ws_handshake = true;
        let result = run_probe(&prober, &cfg).await;
        assert_eq!(result.status, CheckStatus::Up);
        assert_eq!(result.status_code, Some(101));
    }

    #[tokio::test]
    async fn test_wss_needs_completed_tls_handshake() {
        // Plain TCP listener that closes immediately: the transport connects,
        // the TLS handshake cannot.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });

        let prober = WebSocketProber::new().unwrap();
        let mut cfg = target(Protocol::Wss, "wss://localhost/feed".to_string());
        cfg.port = Some(addr.port());
        let result = run_probe(&prober, &cfg).await;
        assert_eq!(result.status, CheckStatus::Down);
        assert_eq!(result.failure, Some(FailureKind::Transport));
    }
}
