//! HTTP transport with anti-bot challenge detection.
//!
//! Requests go out through a baseline `reqwest` client with a randomized
//! browser user agent. A 403/503 carrying a challenge page, or a send that
//! fails in the TLS layer, is retried once through the browser-fingerprint
//! client (see [`crate::fingerprint`]); that retry's outcome is final.

use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::{Request, Response, StatusCode};
use std::collections::HashMap;
use std::time::Duration;

use crate::diagnostics::{check_and_log_isp_blocking, error_chain};
use crate::error::{Error, Result};
use crate::fingerprint;

/// Lowercase substrings identifying a bot-challenge page.
const CHALLENGE_MARKERS: &[&str] = &[
    "cloudflare",
    "cf-ray",
    "checking your browser",
    "please wait",
    "ddos protection",
    "ray id",
    "enable javascript",
    "challenge-platform",
];

pub static USER_AGENTS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36 Edg/123.0.0.0",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
        "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
        "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Mobile Safari/537.36",
        "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1",
    ]
});

pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

pub fn is_challenge_page(body: &[u8]) -> bool {
    let text = String::from_utf8_lossy(body).to_lowercase();
    CHALLENGE_MARKERS.iter().any(|marker| text.contains(marker))
}

fn is_tls_related(message: &str) -> bool {
    let msg = message.to_lowercase();
    msg.contains("tls")
        || msg.contains("handshake")
        || msg.contains("certificate")
        || msg.contains("connection reset")
}

pub struct Transport {
    baseline: reqwest::Client,
    fingerprint: Option<reqwest::Client>,
}

impl Transport {
    /// Build both clients. A fingerprint client that cannot be built leaves
    /// the transport in baseline-only mode.
    pub fn new(timeout: Duration) -> Result<Self> {
        let baseline = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(30))
            .gzip(true)
            .brotli(true)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        let fingerprint = if fingerprint::FINGERPRINT_AVAILABLE {
            match fingerprint::build_client(timeout) {
                Ok(client) => Some(client),
                Err(e) => {
                    log_warn!("[transport] fingerprint client unavailable: {}", e);
                    None
                }
            }
        } else {
            log_info!("[transport] TLS fingerprint retry not supported on this platform");
            None
        };

        Ok(Self { baseline, fingerprint })
    }

    /// Assemble a transport from prebuilt clients.
    pub fn with_clients(baseline: reqwest::Client, fingerprint: Option<reqwest::Client>) -> Self {
        Self { baseline, fingerprint }
    }

    /// False when every request is limited to the baseline client.
    pub fn supports_fingerprint_bypass(&self) -> bool {
        self.fingerprint.is_some()
    }

    /// Baseline client, for building requests.
    pub fn client(&self) -> &reqwest::Client {
        &self.baseline
    }

    pub async fn get(&self, url: &str, headers: &HashMap<String, String>) -> Result<Response> {
        let mut request = self
            .baseline
            .get(url)
            .build()
            .map_err(|e| Error::invalid_input(format!("invalid request for {}: {}", url, e)))?;
        apply_headers(request.headers_mut(), headers)?;
        self.do_request(request).await
    }

    pub async fn do_request(&self, mut request: Request) -> Result<Response> {
        let caller_agent = request.headers().contains_key(USER_AGENT);
        if !caller_agent {
            request
                .headers_mut()
                .insert(USER_AGENT, HeaderValue::from_static(random_user_agent()));
        }
        let url = request.url().to_string();
        let retry = self.fingerprint.as_ref().and_then(|_| request.try_clone());

        match self.baseline.execute(request).await {
            Ok(response) => {
                let status = response.status();
                if status != StatusCode::FORBIDDEN && status != StatusCode::SERVICE_UNAVAILABLE {
                    return Ok(response);
                }
                let Some(retry) = retry else {
                    return Ok(response);
                };

                let version = response.version();
                let headers = response.headers().clone();
                let body = match response.bytes().await {
                    Ok(body) => body,
                    Err(e) => {
                        log_debug!("[transport] failed reading {} body from {}: {}", status, url, e);
                        Default::default()
                    }
                };

                if is_challenge_page(&body) {
                    log_debug!(
                        "[transport] challenge page from {} ({}), retrying with browser TLS fingerprint",
                        url,
                        status
                    );
                    return self.send_fingerprinted(retry, caller_agent, &url).await;
                }

                rebuild_response(status, version, headers, body)
            }
            Err(err) => {
                let message = error_chain(&err);
                if is_tls_related(&message) {
                    if let Some(retry) = retry {
                        log_debug!(
                            "[transport] TLS error for {}, retrying with browser TLS fingerprint: {}",
                            url,
                            message
                        );
                        return self.send_fingerprinted(retry, caller_agent, &url).await;
                    }
                }
                check_and_log_isp_blocking(&message, &url, "transport");
                Err(Error::Network(message))
            }
        }
    }

    async fn send_fingerprinted(
        &self,
        mut request: Request,
        caller_agent: bool,
        url: &str,
    ) -> Result<Response> {
        let Some(client) = self.fingerprint.as_ref() else {
            return Err(Error::network("fingerprint client unavailable"));
        };
        if !caller_agent {
            request
                .headers_mut()
                .insert(USER_AGENT, HeaderValue::from_static(random_user_agent()));
        }
        client.execute(request).await.map_err(|err| {
            let message = error_chain(&err);
            check_and_log_isp_blocking(&message, url, "transport");
            Error::Network(message)
        })
    }
}

/// Recreate a response whose body was already consumed.
fn rebuild_response<B: Into<reqwest::Body>>(
    status: StatusCode,
    version: reqwest::Version,
    headers: HeaderMap,
    body: B,
) -> Result<Response> {
    let mut builder = http::Response::builder().status(status).version(version);
    if let Some(map) = builder.headers_mut() {
        *map = headers;
    }
    let response = builder
        .body(body)
        .map_err(|e| Error::network(format!("failed to rebuild response: {}", e)))?;
    Ok(Response::from(response))
}

pub fn apply_headers(target: &mut HeaderMap, headers: &HashMap<String, String>) -> Result<()> {
    for (k, v) in headers {
        let name = HeaderName::from_bytes(k.as_bytes())
            .map_err(|e| Error::invalid_input(format!("bad header name {}: {}", k, e)))?;
        let value = HeaderValue::from_str(v)
            .map_err(|e| Error::invalid_input(format!("bad header value for {}: {}", k, e)))?;
        target.insert(name, value);
    }
    Ok(())
}
