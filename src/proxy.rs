//! Edge HTTP server
//!
//! Terminates all public traffic and routes each request by its Host header:
//! static projects are served out of object storage with an SPA fallback,
//! dynamic projects are proxied into the container cluster. A dead dynamic
//! upstream is treated as a cold start: publish one wake-up event and answer
//! with the refreshing "starting" page. Exactly one upstream attempt is made
//! per request.

use crate::cache::{ProjectRoute, RoutingCache};
use crate::config::EdgeConfig;
use crate::directory::ProjectDirectoryClient;
use crate::lifecycle::ProjectType;
use crate::notify::IngressNotifier;
use crate::pages::{
    internal_error_response, not_found_response, starting_response, PageContext, X_REQUEST_ID,
    X_SERVED_BY,
};
use crate::pool::{ProbeOutcome, UpstreamError, UpstreamPool};
use crate::task::spawn_detached;
use crate::wakeup::WakeupPublisher;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

// DNS limit
const MAX_HOSTNAME_LEN: usize = 253;

/// File extensions served directly from object storage; every other path on
/// a static project falls back to the project's index document
const STATIC_ASSET_EXTENSIONS: &[&str] = &[
    ".html", ".css", ".js", ".json", ".png", ".jpg", ".jpeg", ".gif", ".svg", ".ico", ".woff",
    ".woff2", ".ttf", ".eot", ".mp4",
];

/// Shared state for the request handler
pub struct EdgeContext {
    pub cache: Arc<RoutingCache>,
    pub directory: Arc<ProjectDirectoryClient>,
    pub pool: Arc<UpstreamPool>,
    pub wakeup: Arc<WakeupPublisher>,
    pub notifier: Arc<IngressNotifier>,
    pub config: EdgeConfig,
}

/// The public edge listener
pub struct EdgeServer {
    bind_addr: SocketAddr,
    ctx: Arc<EdgeContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl EdgeServer {
    pub fn new(
        bind_addr: SocketAddr,
        ctx: Arc<EdgeContext>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            ctx,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Edge server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let ctx = Arc::clone(&self.ctx);
                            tokio::spawn(async move {
                                if let Err(e) = serve_edge_connection(stream, addr, ctx).await {
                                    debug!(addr = %addr, error = %e, "Edge connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept edge connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Edge server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_edge_connection(
    stream: tokio::net::TcpStream,
    addr: SocketAddr,
    ctx: Arc<EdgeContext>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = Arc::clone(&ctx);
        async move { handle_request(req, ctx, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    ctx: Arc<EdgeContext>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Generate or propagate the correlation id
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let Some(domain) = extract_hostname(&req) else {
        return Ok(plain_response(
            StatusCode::BAD_REQUEST,
            "Missing or invalid Host header",
            &request_id,
            &ctx.config.served_by,
        ));
    };

    let path = req.uri().path().to_string();
    let page_ctx = PageContext {
        request_id: request_id.clone(),
        url: format!("http://{}{}", domain, path),
        domain: domain.clone(),
    };

    debug!(domain, method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    // Forwarded headers are overwritten, never appended: this edge is the
    // first trusted hop and client-supplied values are spoofable
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    // Routing facts: cache first, directory on miss
    let route = match ctx.cache.get(&domain) {
        Some(route) => route,
        None => match ctx.directory.resolve(&domain).await {
            Ok(Some(route)) => {
                ctx.cache.insert(route.clone());
                route
            }
            Ok(None) => {
                debug!(domain, request_id, "Domain not registered");
                return Ok(not_found_response(&page_ctx, &ctx.config.served_by));
            }
            Err(e) => {
                error!(domain, request_id, error = %e, "Directory lookup failed");
                return Ok(internal_error_response(&page_ctx, &ctx.config.served_by));
            }
        },
    };

    let (destination, host_override) = match route.project_type {
        ProjectType::Static => (
            static_destination(&ctx.config.object_store_base, &route.project_id, &path),
            None,
        ),
        ProjectType::Dynamic => {
            let path_and_query = req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string());
            (
                dynamic_destination(
                    &ctx.config.dynamic_cluster_host,
                    &route.project_id,
                    &path_and_query,
                ),
                Some(route.domain.clone()),
            )
        }
    };

    // HEAD is a pure liveness check: bounded probe, empty response, no
    // body ever proxied
    if req.method() == Method::HEAD {
        let outcome = ctx
            .pool
            .probe(&destination, ctx.config.probe_timeout())
            .await;
        let status = match outcome {
            ProbeOutcome::Alive => StatusCode::NO_CONTENT,
            ProbeOutcome::Dead => StatusCode::SERVICE_UNAVAILABLE,
        };
        return Ok(empty_response(status, &request_id, &ctx.config.served_by));
    }

    match ctx
        .pool
        .send_request(req, &destination, host_override.as_deref())
        .await
    {
        Ok(mut response) => {
            // The object store's own 404 would leak bucket layout
            if route.project_type == ProjectType::Static
                && response.status() == StatusCode::NOT_FOUND
            {
                return Ok(not_found_response(&page_ctx, &ctx.config.served_by));
            }

            if route.project_type == ProjectType::Dynamic {
                notify_ingress(&ctx, &route, &request_id);
            }

            let headers = response.headers_mut();
            if let Ok(value) = HeaderValue::from_str(&request_id) {
                headers.insert(X_REQUEST_ID, value);
            }
            if let Ok(value) = HeaderValue::from_str(&ctx.config.served_by) {
                headers.insert(X_SERVED_BY, value);
            }
            Ok(response)
        }
        Err(UpstreamError::Unreachable(e)) => match route.project_type {
            ProjectType::Dynamic => {
                // Cold target: ask for a deployment, tell the client to wait
                info!(
                    domain = %route.domain,
                    project_id = %route.project_id,
                    request_id,
                    error = %e,
                    "Dynamic upstream cold; requesting wake-up"
                );
                ctx.wakeup.publish(&route, &request_id);
                Ok(starting_response(&page_ctx, &ctx.config.served_by))
            }
            ProjectType::Static => {
                // Object storage is not cold-startable; this is an outage
                error!(
                    domain = %route.domain,
                    request_id,
                    error = %e,
                    "Object store unreachable"
                );
                Ok(internal_error_response(&page_ctx, &ctx.config.served_by))
            }
        },
        Err(e) => {
            warn!(domain = %route.domain, request_id, error = %e, "Upstream request failed");
            Ok(internal_error_response(&page_ctx, &ctx.config.served_by))
        }
    }
}

/// Report traffic for a dynamic project without blocking the response
fn notify_ingress(ctx: &EdgeContext, route: &ProjectRoute, request_id: &str) {
    let notifier = Arc::clone(&ctx.notifier);
    let project_id = route.project_id.clone();
    let domain = route.domain.clone();
    let request_id = request_id.to_string();
    spawn_detached("ingress-notify", async move {
        notifier.notify(&project_id, &domain, &request_id).await
    });
}

fn extract_hostname(req: &Request<Incoming>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(validate_hostname)
}

fn validate_hostname(host: &str) -> Option<String> {
    let hostname = host.split(':').next()?;

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Alphanumeric, hyphen, and dot only; anything else risks log injection
    // and bogus upstream URIs
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return None;
    }

    Some(hostname.to_lowercase())
}

fn is_static_asset(path: &str) -> bool {
    let lower = path.to_lowercase();
    STATIC_ASSET_EXTENSIONS
        .iter()
        .any(|ext| lower.ends_with(ext))
}

fn static_destination(object_store_base: &str, project_id: &str, path: &str) -> String {
    let base = object_store_base.trim_end_matches('/');
    if is_static_asset(path) {
        format!("{}/{}{}", base, project_id, path)
    } else {
        format!("{}/{}/index.html", base, project_id)
    }
}

fn dynamic_destination(cluster_host: &str, project_id: &str, path_and_query: &str) -> String {
    format!("http://{}.{}{}", project_id, cluster_host, path_and_query)
}

fn empty_response(
    status: StatusCode,
    request_id: &str,
    served_by: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::builder()
        .status(status)
        .header(X_SERVED_BY, served_by)
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum");
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    response
}

fn plain_response(
    status: StatusCode,
    body: &'static str,
    request_id: &str,
    served_by: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .header(X_SERVED_BY, served_by)
        .body(
            http_body_util::Full::new(Bytes::from(body))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum");
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    response
}
