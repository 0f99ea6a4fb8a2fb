//! HTTP side of a watch.
//!
//! [`WatchTransport`] issues the GET and hands back the status and a byte
//! stream; the reconnection protocol lives in the watcher and never touches
//! HTTP types directly.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fleet_core::{FleetError, FleetResult};
use futures::{Stream, TryStreamExt};
use zeroize::Zeroize;

/// Body of a watch response.
pub type ByteStream = Pin<Box<dyn Stream<Item = FleetResult<Bytes>> + Send>>;

/// An opened watch request.
pub struct WatchResponse {
    /// HTTP status code.
    pub status: u16,
    /// Parsed `Retry-After`, in seconds form.
    pub retry_after: Option<Duration>,
    /// Response body.
    pub body: ByteStream,
}

impl std::fmt::Debug for WatchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchResponse")
            .field("status", &self.status)
            .field("retry_after", &self.retry_after)
            .finish_non_exhaustive()
    }
}

/// Opens watch requests.
#[async_trait]
pub trait WatchTransport: Send + Sync + 'static {
    /// Issue a GET for `path` (path and query, no host).
    async fn open(&self, path: &str) -> FleetResult<WatchResponse>;
}

/// Build the HTTP client shared by watches and access reviews.
///
/// `insecure` disables certificate verification, for in-cluster API servers
/// with self-signed certificates.
pub fn build_client(insecure: bool) -> FleetResult<reqwest::Client> {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(insecure)
        .tcp_keepalive(Duration::from_secs(30))
        .build()
        .map_err(|e| FleetError::transport("failed to build http client", e))
}

/// [`WatchTransport`] over `reqwest`, authenticated with a bearer token.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// Create a transport against `base_url` (scheme, host and port).
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        self.token.zeroize();
    }
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl WatchTransport for HttpTransport {
    async fn open(&self, path: &str) -> FleetResult<WatchResponse> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| FleetError::transport(format!("watch request failed: {path}"), e))?;

        let status = response.status().as_u16();
        let retry_after = retry_after(response.headers());
        let body = response
            .bytes_stream()
            .map_err(|e| FleetError::transport("watch body read failed", e));

        Ok(WatchResponse {
            status,
            retry_after,
            body: Box::pin(body),
        })
    }
}
