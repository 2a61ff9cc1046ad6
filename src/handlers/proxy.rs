use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, HeaderName, header},
    response::Response,
};
use std::sync::Arc;
use std::time::Instant;

use crate::body::buffer_body;
use crate::error::ApiError;
use crate::metrics::UPSTREAM_LATENCY;
use crate::state::AppState;

// Connection-scoped headers that must not be forwarded
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

fn end_to_end(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    for name in &HOP_BY_HOP {
        out.remove(name);
    }
    out
}

// Forward the request to the finance backend and relay its answer
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    req: Request,
) -> Result<Response, ApiError> {
    let (parts, body) = req.into_parts();
    let body = buffer_body(body, state.max_body_bytes).await?;

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", state.upstream, path);

    let mut headers = end_to_end(&parts.headers);
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);

    let start_time = Instant::now();
    let upstream = state
        .client
        .request(parts.method.clone(), &url)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|e| {
            tracing::warn!(url = %url, error = %e, "Upstream request failed");
            ApiError::BadGateway(e.to_string())
        })?;

    let status = upstream.status();
    let upstream_headers = end_to_end(upstream.headers());
    let bytes = upstream
        .bytes()
        .await
        .map_err(|e| ApiError::BadGateway(format!("reading upstream body: {}", e)))?;
    UPSTREAM_LATENCY.observe(start_time.elapsed().as_secs_f64());

    tracing::debug!(method = %parts.method, url = %url, status = status.as_u16(), "Forwarded");

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = upstream_headers;
    response.headers_mut().remove(header::CONTENT_LENGTH);
    Ok(response)
}
