//! HTTP probe implementation.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{redirect, Client, Method, Response};
use std::time::Duration;

use super::{ProbeError, ProbeOutcome, Prober};
use crate::db::{Protocol, TargetConfig};

const MAX_REDIRECTS: usize = 10;

/// Bodies are read up to this size; the rest is never downloaded.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Probes http, https and keyword targets.
///
/// Holds one client that follows redirects and one that does not; the
/// target picks between them.
pub struct HttpProber {
    following: Client,
    direct: Client,
}

impl HttpProber {
    pub fn new() -> Result<Self, ProbeError> {
        let build = |policy: redirect::Policy| {
            Client::builder()
                .redirect(policy)
                .user_agent(concat!("uptrail/", env!("CARGO_PKG_VERSION")))
                .build()
                .map_err(|e| ProbeError::Config(e.to_string()))
        };
        Ok(Self {
            following: build(redirect::Policy::limited(MAX_REDIRECTS))?,
            direct: build(redirect::Policy::none())?,
        })
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(
        &self,
        target: &TargetConfig,
        timeout: Duration,
    ) -> Result<ProbeOutcome, ProbeError> {
        let url = target.http_url()?;
        let method = Method::from_bytes(target.method.to_uppercase().as_bytes())
            .map_err(|_| ProbeError::Config(format!("bad method {:?}", target.method)))?;
        let headers = header_map(target)?;

        let client = if target.follow_redirects {
            &self.following
        } else {
            &self.direct
        };

        let sends_body = matches!(method, Method::POST | Method::PUT | Method::PATCH);
        let mut request = client.request(method, url).headers(headers).timeout(timeout);
        if sends_body {
            if let Some(body) = &target.body {
                request = request.body(body.clone());
            }
        }

        let response = request.send().await.map_err(|e| map_reqwest_error(e, timeout))?;
        let status = response.status().as_u16();

        let keyword = target.keyword.as_deref().filter(|k| !k.is_empty());
        let found = read_body(response, keyword, timeout).await?;

        // Keyword targets only need a response; the body decides.
        if target.protocol != Protocol::Keyword && status != target.expected_status {
            return Err(ProbeError::UnexpectedStatus {
                expected: target.expected_status,
                received: status,
            });
        }

        if let Some(keyword) = keyword {
            if !found {
                return Err(ProbeError::KeywordNotFound(keyword.to_string()));
            }
        }

        Ok(ProbeOutcome {
            status_code: Some(status),
        })
    }
}

/// Stream the body so transfer time is measured, up to [`MAX_BODY_BYTES`].
/// Stops early once `keyword` is seen and reports whether it was.
async fn read_body(
    mut response: Response,
    keyword: Option<&str>,
    timeout: Duration,
) -> Result<bool, ProbeError> {
    let needle = keyword.map(str::as_bytes);
    let mut seen = Vec::new();
    let mut total = 0;

    while total < MAX_BODY_BYTES {
        let chunk = match response
            .chunk()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?
        {
            Some(chunk) => chunk,
            None => break,
        };
        let take = chunk.len().min(MAX_BODY_BYTES - total);
        total += take;

        if let Some(needle) = needle {
            // Re-scan the tail of the previous chunk for matches across the boundary.
            let from = seen.len().saturating_sub(needle.len() - 1);
            seen.extend_from_slice(&chunk[..take]);
            if contains(&seen[from..], needle) {
                return Ok(true);
            }
        }
    }

    if total == MAX_BODY_BYTES {
        tracing::debug!(limit = MAX_BODY_BYTES, "Response body truncated");
    }
    Ok(false)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn header_map(target: &TargetConfig) -> Result<HeaderMap, ProbeError> {
    let mut headers = HeaderMap::new();
    for (name, value) in &target.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ProbeError::Config(format!("bad header name {:?}", name)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| ProbeError::Config(format!("bad header value for {}", name)))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

fn map_reqwest_error(e: reqwest::Error, timeout: Duration) -> ProbeError {
    if e.is_timeout() {
        return ProbeError::Timeout(timeout);
    }
    if e.is_connect() {
        let text = error_chain(&e);
        if text.contains("refused") {
            return ProbeError::Refused(text);
        }
        if text.contains("certificate") || text.contains("tls") || text.contains("ssl") {
            return ProbeError::Tls(text);
        }
        return ProbeError::Network(text);
    }
    ProbeError::Network(error_chain(&e))
}

/// reqwest hides the interesting part of connect errors in the source chain.
fn error_chain(e: &dyn std::error::Error) -> String {
    let mut text = e.to_string();
    let mut source = e.source();
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::CheckStatus;
    use crate::probe::{run_probe, FailureKind};
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use tokio::net::TcpListener;

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn target(protocol: Protocol, address: String) -> TargetConfig {
        TargetConfig {
            name: "web".to_string(),
            protocol,
            address,
            timeout_secs: 5,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_expected_status_is_up() {
        let base = serve(Router::new().route(
            "/health",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                "ok"
            }),
        ))
        .await;

        let prober = HttpProber::new().unwrap();
        let result = run_probe(&prober, &target(Protocol::Http, format!("{}/health", base))).await;
        assert_eq!(result.status, CheckStatus::Up);
        assert_eq!(result.status_code, Some(200));
        assert!(result.elapsed >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_unexpected_status_is_down() {
        let base = serve(Router::new().route(
            "/health",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        ))
        .await;

        let prober = HttpProber::new().unwrap();
        let result = run_probe(&prober, &target(Protocol::Http, format!("{}/health", base))).await;
        assert_eq!(result.status, CheckStatus::Down);
        assert_eq!(result.status_code, Some(500));
        assert_eq!(result.failure, Some(FailureKind::Expectation));
        let error = result.error.unwrap();
        assert!(error.contains("200"));
        assert!(error.contains("500"));
    }

    #[tokio::test]
    async fn test_keyword_containment() {
        let base = serve(Router::new().route("/", get(|| async { "<h1>Welcome home</h1>" }))).await;
        let prober = HttpProber::new().unwrap();

        let mut cfg = target(Protocol::Keyword, format!("{}/", base));
        cfg.keyword = Some("Welcome".to_string());
        assert_eq!(run_probe(&prober, &cfg).await.status, CheckStatus::Up);

        cfg.keyword = Some("Goodbye".to_string());
        let result = run_probe(&prober, &cfg).await;
        assert_eq!(result.status, CheckStatus::Down);
        assert_eq!(result.error.as_deref(), Some("keyword not found: \"Goodbye\""));
    }

    #[tokio::test]
    async fn test_body_is_read_up_to_limit() {
        let filler = "a".repeat(MAX_BODY_BYTES + 4096);
        let early = format!("status: green {}", filler);
        let late = format!("{} status: green", filler);
        let base = serve(
            Router::new()
                .route("/early", get(move || async move { early }))
                .route("/late", get(move || async move { late })),
        )
        .await;
        let prober = HttpProber::new().unwrap();

        let mut cfg = target(Protocol::Keyword, format!("{}/early", base));
        cfg.keyword = Some("green".to_string());
        assert_eq!(run_probe(&prober, &cfg).await.status, CheckStatus::Up);

        // Past the limit the keyword is never seen.
        cfg.address = format!("{}/late", base);
        let result = run_probe(&prober, &cfg).await;
        assert_eq!(result.status, CheckStatus::Down);
        assert_eq!(result.failure, Some(FailureKind::Expectation));

        // Plain status checks still succeed on large bodies.
        let plain = target(Protocol::Http, format!("{}/late", base));
        assert_eq!(run_probe(&prober, &plain).await.status, CheckStatus::Up);
    }

    #[test]
    fn test_contains_matches_byte_sequences() {
        assert!(contains(b"<p>Welcome</p>", b"Welcome"));
        assert!(!contains(b"Welc", b"Welcome"));
        assert!(contains(b"ok", b"ok"));
    }

    #[tokio::test]
    async fn test_keyword_target_accepts_any_status() {
        let base = serve(Router::new().route(
            "/",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "maintenance window") }),
        ))
        .await;
        let mut cfg = target(Protocol::Keyword, format!("{}/", base));
        cfg.keyword = Some("maintenance".to_string());

        let prober = HttpProber::new().unwrap();
        let result = run_probe(&prober, &cfg).await;
        assert_eq!(result.status, CheckStatus::Up);
        assert_eq!(result.status_code, Some(503));
    }

    #[tokio::test]
    async fn test_redirects_follow_the_target_setting() {
        let base = serve(
            Router::new()
                .route(
                    "/old",
                    get(|| async { axum::response::Redirect::temporary("/new") }),
                )
                .route("/new", get(|| async { "moved" })),
        )
        .await;
        let prober = HttpProber::new().unwrap();

        let mut cfg = target(Protocol::Http, format!("{}/old", base));
        assert_eq!(run_probe(&prober, &cfg).await.status_code, Some(200));

        cfg.follow_redirects = false;
        cfg.expected_status = 307;
        let result = run_probe(&prober, &cfg).await;
        assert_eq!(result.status, CheckStatus::Up);
        assert_eq!(result.status_code, Some(307));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_https_server_times_out() {
        // Accepts connections but never speaks TLS.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let prober = HttpProber::new().unwrap();
        let cfg = target(Protocol::Https, format!("https://{}/", addr));
        let result = run_probe(&prober, &cfg).await;

        assert_eq!(result.status, CheckStatus::Down);
        assert_eq!(result.failure, Some(FailureKind::Timeout));
        assert!(result.error.unwrap().contains("timeout"));
        assert!(result.elapsed >= Duration::from_secs(5));
        assert!(result.elapsed < Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_refused_connection_is_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let prober = HttpProber::new().unwrap();
        let result = run_probe(&prober, &target(Protocol::Http, format!("http://{}/", addr))).await;
        assert_eq!(result.status, CheckStatus::Down);
        assert!(result.status_code.is_none());
    }
}
