//! Upstream binary caches.
//!
//! One [`Upstream`] per configured remote cache. The client speaks the
//! plain binary-cache dialect: `{hash}.narinfo`, `nar/{file}`, and
//! `nix-cache-info` for the priority probe. Health and priority are
//! observable state refreshed by the [`health::HealthMonitor`]; the
//! engine skips unhealthy upstreams and walks the rest in ascending
//! priority order.

pub mod health;
pub mod index;

use std::error::Error as StdError;
use std::io::ErrorKind as IoErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use tokio::time::timeout;

use crate::cache_info::NixCacheInfo;
use crate::error::{ServerError, ServerResult};
use crate::narinfo::NarInfo;
use index::{IndexLookup, UpstreamIndex};
use magpie::nar_url::NarUrl;
use magpie::signing::{verify_first, PublicKey};

/// Default timeout for establishing a connection.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Default timeout for receiving response headers.
pub const DEFAULT_RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(3);

/// Options for constructing an [`Upstream`].
#[derive(Debug, Clone)]
pub struct UpstreamOptions {
    /// Public keys the upstream's narinfo signatures are checked
    /// against. When empty, signatures are passed through unverified.
    pub public_keys: Vec<PublicKey>,

    /// Timeout for establishing a connection.
    pub dial_timeout: Duration,

    /// Timeout for receiving response headers.
    pub response_header_timeout: Duration,

    /// Optional remote index consulted before narinfo requests.
    pub index: Option<Arc<dyn UpstreamIndex>>,
}

impl Default for UpstreamOptions {
    fn default() -> Self {
        Self {
            public_keys: Vec::new(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            response_header_timeout: DEFAULT_RESPONSE_HEADER_TIMEOUT,
            index: None,
        }
    }
}

/// A NAR being downloaded from an upstream.
pub struct NarDownload {
    /// Size advertised in Content-Length, if any.
    pub size: Option<u64>,

    /// The (possibly compressed) body bytes, passed through untouched.
    pub stream: BoxStream<'static, Result<Bytes, reqwest::Error>>,
}

/// An upstream binary cache.
#[derive(Debug)]
pub struct Upstream {
    /// Base URL with a trailing slash and the `priority` parameter
    /// stripped.
    url: Url,

    hostname: String,

    priority: AtomicU64,

    healthy: AtomicBool,

    public_keys: Vec<PublicKey>,

    client: Client,

    response_header_timeout: Duration,

    index: Option<Arc<dyn UpstreamIndex>>,
}

impl Upstream {
    /// Constructs an upstream from an absolute URL.
    ///
    /// A `priority` query parameter overrides the priority advertised
    /// in the upstream's `nix-cache-info`; `priority=0` falls back to
    /// the advertised value and negative values fail construction.
    pub async fn new(url: &str, options: UpstreamOptions) -> ServerResult<Self> {
        let parsed = Url::parse(url)
            .map_err(|e| ServerError::RequestError(anyhow::anyhow!("bad upstream URL: {}", e)))?;

        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ServerError::RequestError(anyhow::anyhow!(
                "upstream URL must be absolute with an http or https scheme"
            )));
        }

        let hostname = parsed
            .host_str()
            .ok_or_else(|| {
                ServerError::RequestError(anyhow::anyhow!("upstream URL has no host"))
            })?
            .to_string();

        let mut priority_override = None;
        let mut remaining = Vec::new();
        for (key, value) in parsed.query_pairs() {
            if key == "priority" {
                let p: i64 = value.parse().map_err(|_| {
                    ServerError::RequestError(anyhow::anyhow!("bad priority override"))
                })?;
                if p < 0 {
                    return Err(ServerError::RequestError(anyhow::anyhow!(
                        "priority override must not be negative"
                    )));
                }
                priority_override = Some(p as u64);
            } else {
                remaining.push((key.into_owned(), value.into_owned()));
            }
        }

        let mut base = parsed;
        base.set_query(None);
        if !remaining.is_empty() {
            base.query_pairs_mut().extend_pairs(remaining);
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = Client::builder()
            .connect_timeout(options.dial_timeout)
            .build()
            .map_err(ServerError::request_error)?;

        let upstream = Self {
            url: base,
            hostname,
            priority: AtomicU64::new(0),
            healthy: AtomicBool::new(true),
            public_keys: options.public_keys,
            client,
            response_header_timeout: options.response_header_timeout,
            index: options.index,
        };

        let priority = match priority_override {
            Some(p) if p > 0 => p,
            // priority=0 means unset in this dialect
            _ => upstream.parse_priority().await?,
        };
        upstream.set_priority(priority);

        Ok(upstream)
    }

    /// Fetches and validates a narinfo.
    pub async fn get_nar_info(&self, hash: &str) -> ServerResult<NarInfo> {
        if let Some(index) = &self.index {
            match index.lookup(hash).await {
                Ok(IndexLookup::DefiniteMiss) => return Err(ServerError::NotFound),
                Ok(_) => {}
                // an unreachable index is no signal, not a miss
                Err(e) => {
                    tracing::debug!("Index for {} unreachable, proceeding: {}", self.hostname, e);
                }
            }
        }

        let url = self.endpoint(&format!("{}.narinfo", hash))?;
        let response = self.send_with_retry(self.client.get(url.clone())).await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(ServerError::NotFound),
            StatusCode::OK => {
                let body = response.text().await.map_err(ServerError::upstream_error)?;

                let nar_info = NarInfo::from_str(&body)?;
                nar_info.check()?;

                if !self.public_keys.is_empty()
                    && !verify_first(
                        &nar_info.signatures,
                        &nar_info.fingerprint(),
                        &self.public_keys,
                    )
                {
                    return Err(ServerError::SignatureInvalid {
                        url: url.to_string(),
                    });
                }

                Ok(nar_info)
            }
            status => Err(ServerError::UnexpectedStatus {
                url: url.to_string(),
                status: status.as_u16(),
            }),
        }
    }

    /// Tests whether the upstream has a narinfo.
    pub async fn has_nar_info(&self, hash: &str) -> ServerResult<bool> {
        let url = self.endpoint(&format!("{}.narinfo", hash))?;
        self.probe(url).await
    }

    /// Starts downloading a NAR.
    ///
    /// Header mutators are supplied by the caller; the body is not
    /// decoded so compressed NARs pass through untouched.
    pub async fn get_nar(&self, nar_url: &NarUrl, headers: HeaderMap) -> ServerResult<NarDownload> {
        let url = self.nar_endpoint(nar_url)?;
        let response = self
            .send_with_retry(self.client.get(url.clone()).headers(headers))
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(ServerError::NotFound),
            StatusCode::OK => Ok(NarDownload {
                size: response.content_length(),
                stream: response.bytes_stream().boxed(),
            }),
            status => Err(ServerError::UnexpectedStatus {
                url: url.to_string(),
                status: status.as_u16(),
            }),
        }
    }

    /// Tests whether the upstream has a NAR.
    pub async fn has_nar(&self, nar_url: &NarUrl) -> ServerResult<bool> {
        let url = self.nar_endpoint(nar_url)?;
        self.probe(url).await
    }

    /// Fetches the upstream's advertised priority from `nix-cache-info`.
    pub async fn parse_priority(&self) -> ServerResult<u64> {
        let url = self.endpoint("nix-cache-info")?;
        let response = self.send_with_retry(self.client.get(url.clone())).await?;

        if response.status() != StatusCode::OK {
            return Err(ServerError::UnexpectedStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let body = response.text().await.map_err(ServerError::upstream_error)?;
        let info = NixCacheInfo::from_str(&body)?;

        Ok(info.priority)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    pub fn get_priority(&self) -> u64 {
        self.priority.load(Ordering::Acquire)
    }

    pub fn set_priority(&self, priority: u64) {
        self.priority.store(priority, Ordering::Release);
    }

    pub fn get_hostname(&self) -> &str {
        &self.hostname
    }

    /// Returns the public keys narinfo signatures are checked against.
    pub fn public_keys(&self) -> &[PublicKey] {
        &self.public_keys
    }

    /// Returns the base URL, with a trailing slash.
    pub fn url(&self) -> &Url {
        &self.url
    }

    fn endpoint(&self, path: &str) -> ServerResult<Url> {
        self.url.join(path).map_err(|e| {
            ServerError::RequestError(anyhow::anyhow!("bad upstream endpoint: {}", e))
        })
    }

    fn nar_endpoint(&self, nar_url: &NarUrl) -> ServerResult<Url> {
        Url::parse(&nar_url.join_url(self.url.as_str())).map_err(|e| {
            ServerError::RequestError(anyhow::anyhow!("bad upstream NAR endpoint: {}", e))
        })
    }

    /// HEAD-style existence probe.
    async fn probe(&self, url: Url) -> ServerResult<bool> {
        let response = self.send_with_retry(self.client.head(url.clone())).await?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(ServerError::UnexpectedStatus {
                url: url.to_string(),
                status: status.as_u16(),
            }),
        }
    }

    /// Sends a request, retrying exactly once on a transport-level
    /// protocol reset (HTTP/2 GOAWAY, connection reset).
    async fn send_with_retry(&self, request: RequestBuilder) -> ServerResult<Response> {
        let retry = request.try_clone();

        match self.send_once(request).await {
            Ok(response) => Ok(response),
            Err(SendError::Transport(error)) if retry.is_some() && is_protocol_reset(&error) => {
                tracing::debug!(
                    "Protocol reset from {}, retrying once: {}",
                    self.hostname,
                    error
                );
                self.send_once(retry.unwrap())
                    .await
                    .map_err(|e| e.into_server_error(&self.hostname))
            }
            Err(error) => Err(error.into_server_error(&self.hostname)),
        }
    }

    async fn send_once(&self, request: RequestBuilder) -> Result<Response, SendError> {
        match timeout(self.response_header_timeout, request.send()).await {
            Ok(result) => result.map_err(SendError::Transport),
            Err(_elapsed) => Err(SendError::Timeout),
        }
    }
}

/// A transport-level send failure.
#[derive(Debug)]
enum SendError {
    /// No response headers arrived within the configured timeout.
    Timeout,

    /// The request failed in flight.
    Transport(reqwest::Error),
}

impl SendError {
    fn into_server_error(self, hostname: &str) -> ServerError {
        match self {
            Self::Timeout => ServerError::UpstreamError(anyhow::anyhow!(
                "timed out waiting for response headers from {}",
                hostname
            )),
            Self::Transport(error) => ServerError::upstream_error(error),
        }
    }
}

/// Walks an error's source chain looking for a transport-level reset.
fn is_protocol_reset(error: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn StdError + 'static)> = Some(error);

    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                IoErrorKind::ConnectionReset | IoErrorKind::BrokenPipe
            ) {
                return true;
            }
        }

        let text = e.to_string();
        if text.contains("GOAWAY") || text.contains("connection reset") {
            return true;
        }

        source = e.source();
    }

    false
}
