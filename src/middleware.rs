//! Admission control for the request pipeline.
//!
//! [`admission`] picks the policy for the request path, counts the request,
//! and either short-circuits with a 429 or runs the handler and reconciles the
//! provisional count against the handler's status. Quota headers go on every
//! response it sees.

use axum::{
    body::Body,
    extract::{ConnectInfo, Query, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::SecondsFormat;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::body::buffer_body;
use crate::error::ApiError;
use crate::metrics::{ADMISSION_ALLOWED, ADMISSION_RECONCILED, REQUEST_TOTAL};
use crate::rate_limit::{Decision, Outcome, RequestIdentity};
use crate::state::AppState;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Header carrying the application user id when no auth layer set [`UserId`].
pub const USER_ID_HEADER: &str = "x-user-id";

/// Authenticated user id, inserted into request extensions by an auth layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserId(pub String);

pub async fn admission(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    REQUEST_TOTAL.inc();

    let path = req.uri().path().to_string();
    let Some(controller) = state.registry.resolve(&path) else {
        return next.run(req).await;
    };

    let mut identity = request_identity(&req, state.trust_proxy);

    // per-user keys fall back to the path segment, then the JSON body
    let req = if identity.user_id.is_none() && controller.policy().key_strategy.uses_user_id() {
        identity.user_id = state
            .registry
            .matched_route(&path)
            .and_then(|route| route.segment_after(&path))
            .map(String::from);
        if identity.user_id.is_none() && is_json(req.headers()) {
            match body_user_id(req, state.max_body_bytes).await {
                Ok((req, user_id)) => {
                    identity.user_id = user_id;
                    req
                }
                Err(e) => return e.into_response(),
            }
        } else {
            req
        }
    } else {
        req
    };

    let decision = controller.check(&identity);

    if !decision.is_allowed() {
        let mut response = ApiError::RateLimited {
            retry_after_secs: decision.retry_after_secs,
        }
        .into_response();
        apply_rate_limit_headers(response.headers_mut(), &decision);
        return response;
    }
    ADMISSION_ALLOWED.with_label_values(&[controller.name()]).inc();

    let mut response = next.run(req).await;

    let outcome = Outcome::from_status(response.status().as_u16());
    if controller.reconcile(&decision, outcome) {
        ADMISSION_RECONCILED.with_label_values(&[controller.name()]).inc();
        tracing::trace!(policy = %controller.name(), key = %decision.key, ?outcome, "Provisional count returned");
    }

    apply_rate_limit_headers(response.headers_mut(), &decision);
    response
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"))
}

// Buffers the body (capped) to read `userId` / `user_id`, then puts it back
async fn body_user_id(req: Request, max_bytes: usize) -> Result<(Request, Option<String>), ApiError> {
    let (parts, body) = req.into_parts();
    let bytes = buffer_body(body, max_bytes).await?;

    // a body that isn't a JSON object just yields no user id
    let user_id = serde_json::from_slice::<serde_json::Value>(&bytes)
        .ok()
        .and_then(|json| {
            let value = json.get("userId").or_else(|| json.get("user_id"))?;
            match value {
                serde_json::Value::String(id) if !id.is_empty() => Some(id.clone()),
                serde_json::Value::Number(id) => Some(id.to_string()),
                _ => None,
            }
        });

    Ok((Request::from_parts(parts, Body::from(bytes)), user_id))
}

/// Quota advertisement, reflecting the count at evaluation time.
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    let reset = decision.reset_at.to_rfc3339_opts(SecondsFormat::Millis, true);
    if let Ok(value) = HeaderValue::from_str(&reset) {
        headers.insert(X_RATELIMIT_RESET, value);
    }
    if !decision.is_allowed() {
        headers.insert(header::RETRY_AFTER, HeaderValue::from(decision.retry_after_secs));
    }
}

/// Everything key derivation may use. Missing pieces stay `None`.
pub fn request_identity(req: &Request, trust_proxy: bool) -> RequestIdentity {
    let headers = req.headers();

    let forwarded = if trust_proxy {
        forwarded_for(headers)
    } else {
        None
    };
    let client_addr = forwarded.or_else(|| {
        req.extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
    });

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    RequestIdentity {
        client_addr,
        user_agent,
        user_id: user_id(req),
    }
}

// first hop of X-Forwarded-For
fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|first| first.trim().parse().ok())
}

// extension, then header, then query string
fn user_id(req: &Request) -> Option<String> {
    if let Some(UserId(id)) = req.extensions().get::<UserId>() {
        return Some(id.clone());
    }

    let from_header = req
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from);
    if from_header.is_some() {
        return from_header;
    }

    let Query(params) = Query::<HashMap<String, String>>::try_from_uri(req.uri()).ok()?;
    params
        .get("userId")
        .or_else(|| params.get("user_id"))
        .filter(|v| !v.is_empty())
        .cloned()
}
