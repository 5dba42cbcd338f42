//! Pooled HTTP client for upstream destinations
//!
//! One shared, connection-pooled client carries all proxied traffic to
//! object storage and the container cluster; a second client with an empty
//! body type serves liveness probes. Errors are classified so the edge can
//! tell a dead upstream (cold start) from a protocol failure.

use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Error type for upstream dispatch
#[derive(Debug)]
pub enum UpstreamError {
    /// Connection-level failure: refused, unresolvable, or unreachable.
    /// The edge interprets this as a cold target.
    Unreachable(String),
    /// The upstream was reached but the exchange failed
    Protocol(String),
    /// Error building the outbound request
    RequestBuild(String),
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamError::Unreachable(e) => write!(f, "Upstream unreachable: {}", e),
            UpstreamError::Protocol(e) => write!(f, "Upstream protocol error: {}", e),
            UpstreamError::RequestBuild(e) => write!(f, "Request build error: {}", e),
        }
    }
}

impl std::error::Error for UpstreamError {}

impl From<hyper_util::client::legacy::Error> for UpstreamError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        if err.is_connect() {
            UpstreamError::Unreachable(err.to_string())
        } else {
            UpstreamError::Protocol(err.to_string())
        }
    }
}

/// Result of a liveness probe against a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The destination answered; any HTTP status counts
    Alive,
    /// Connection refused, unresolvable host, or probe timeout
    Dead,
}

/// Statistics for the upstream pool
#[derive(Debug, Default)]
pub struct PoolStats {
    pub total_requests: AtomicU64,
    pub probes: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_probe(&self) {
        self.probes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_probes(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }
}

/// Configuration for the upstream pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per destination host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Connection-pooled client for all upstream destinations
pub struct UpstreamPool {
    client: Client<HttpConnector, Incoming>,
    probe_client: Client<HttpConnector, Empty<Bytes>>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl UpstreamPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector.clone());

        let probe_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Upstream pool initialized"
        );

        Self {
            client,
            probe_client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Forward a request to an absolute destination URI, streaming the body
    /// through. When `host_override` is set the forwarded Host header is
    /// rewritten (dynamic projects see their public domain, not the internal
    /// cluster hostname).
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        destination: &str,
        host_override: Option<&str>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, UpstreamError> {
        let upstream_req = build_upstream_request(req, destination, host_override)?;

        self.stats.record_request();

        let response = self.client.request(upstream_req).await?;
        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// HEAD liveness probe with a bounded timeout. Timeout is treated the
    /// same as connection-refused.
    pub async fn probe(&self, destination: &str, timeout: Duration) -> ProbeOutcome {
        let req = match Request::builder()
            .method(hyper::Method::HEAD)
            .uri(destination)
            .body(Empty::<Bytes>::new())
        {
            Ok(r) => r,
            Err(_) => return ProbeOutcome::Dead,
        };

        self.stats.record_probe();

        match tokio::time::timeout(timeout, self.probe_client.request(req)).await {
            Ok(Ok(_)) => ProbeOutcome::Alive,
            Ok(Err(e)) => {
                debug!(destination, error = %e, "Probe failed");
                ProbeOutcome::Dead
            }
            Err(_) => {
                debug!(
                    destination,
                    timeout_ms = timeout.as_millis() as u64,
                    "Probe timed out"
                );
                ProbeOutcome::Dead
            }
        }
    }
}

/// Rebuild an inbound request at an absolute destination URI. The original
/// Host header is dropped; when `host_override` is set the upstream sees
/// that value instead (dynamic projects expect their public domain, not the
/// internal cluster hostname).
fn build_upstream_request<B>(
    req: Request<B>,
    destination: &str,
    host_override: Option<&str>,
) -> Result<Request<B>, UpstreamError> {
    let (parts, body) = req.into_parts();
    let mut builder = Request::builder().method(parts.method).uri(destination);

    for (key, value) in parts.headers.iter() {
        if key == hyper::header::HOST {
            continue;
        }
        builder = builder.header(key, value);
    }

    let mut upstream_req = builder
        .body(body)
        .map_err(|e| UpstreamError::RequestBuild(e.to_string()))?;

    if let Some(host) = host_override {
        let value =
            HeaderValue::from_str(host).map_err(|e| UpstreamError::RequestBuild(e.to_string()))?;
        upstream_req.headers_mut().insert(hyper::header::HOST, value);
    }

    Ok(upstream_req)
}
