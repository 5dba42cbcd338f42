//! Templated HTML error pages and edge response helpers
//!
//! Three documents (404, 503, 500) with placeholder tokens substituted at
//! response time. Every edge response, error or not, carries the request id
//! and server identity headers so support can correlate reports with logs.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::HeaderValue;
use hyper::{Response, StatusCode};

/// Header name for the per-request correlation id
pub const X_REQUEST_ID: &str = "x-request-id";
/// Header name identifying the edge server that produced the response
pub const X_SERVED_BY: &str = "x-served-by";

const NOT_FOUND_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Project not found</title></head>
<body>
  <h1>404 &mdash; Project not found</h1>
  <p>No project is published at <code>{{url}}</code>.</p>
  <p>If you expected a site here, check the domain configuration in your
  project settings.</p>
  <p><small>Request ID: {{request_id}}</small></p>
</body>
</html>
"#;

const STARTING_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Starting up</title><meta http-equiv="refresh" content="10"></head>
<body>
  <h1>503 &mdash; Your project is starting</h1>
  <p><code>{{domain}}</code> is waking up from idle. This page refreshes
  automatically; the first request after a cold start can take a moment.</p>
  <p><small>Request ID: {{request_id}}</small></p>
</body>
</html>
"#;

const INTERNAL_ERROR_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Something went wrong</title></head>
<body>
  <h1>500 &mdash; Something went wrong</h1>
  <p>The edge could not complete the request for <code>{{url}}</code>.</p>
  <p>Please try again; if the problem persists, quote the request ID below
  to support.</p>
  <p><small>Request ID: {{request_id}}</small></p>
</body>
</html>
"#;

/// Values substituted into a page template
#[derive(Debug, Default, Clone)]
pub struct PageContext {
    pub request_id: String,
    pub url: String,
    pub domain: String,
}

fn render(template: &str, ctx: &PageContext) -> String {
    template
        .replace("{{request_id}}", &ctx.request_id)
        .replace("{{url}}", &ctx.url)
        .replace("{{domain}}", &ctx.domain)
}

pub fn render_not_found(ctx: &PageContext) -> String {
    render(NOT_FOUND_TEMPLATE, ctx)
}

pub fn render_starting(ctx: &PageContext) -> String {
    render(STARTING_TEMPLATE, ctx)
}

pub fn render_internal_error(ctx: &PageContext) -> String {
    render(INTERNAL_ERROR_TEMPLATE, ctx)
}

/// Build an HTML response with edge identity headers
pub fn html_response(
    status: StatusCode,
    body: String,
    request_id: &str,
    served_by: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/html; charset=utf-8")
        .header(X_SERVED_BY, served_by)
        .body(
            Full::new(Bytes::from(body))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response builder");

    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    response
}

pub fn not_found_response(
    ctx: &PageContext,
    served_by: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    html_response(
        StatusCode::NOT_FOUND,
        render_not_found(ctx),
        &ctx.request_id,
        served_by,
    )
}

pub fn starting_response(
    ctx: &PageContext,
    served_by: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    html_response(
        StatusCode::SERVICE_UNAVAILABLE,
        render_starting(ctx),
        &ctx.request_id,
        served_by,
    )
}

pub fn internal_error_response(
    ctx: &PageContext,
    served_by: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    html_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        render_internal_error(ctx),
        &ctx.request_id,
        served_by,
    )
}
