//! HTTP-level tests for the admission middleware and the gateway router.
//!
//! The middleware tests mount `admission` over a stand-in handler whose status
//! is picked by the request path. The gateway tests run the real router against
//! an upstream served from an ephemeral local port.

use axum::{
    Router,
    body::Body,
    extract::ConnectInfo,
    http::{Request, StatusCode, header},
    middleware::from_fn_with_state,
    routing::{any, get, post},
};
use http_body_util::BodyExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;

use finance_gateway::clock::MockClock;
use finance_gateway::middleware::{X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET, admission};
use finance_gateway::models::RateLimitsResponse;
use finance_gateway::rate_limit::{PolicyRegistry, PolicyRoute, PolicySettings, PolicyTable};
use finance_gateway::{AppState, build_router};

fn small_table() -> PolicyTable {
    PolicyTable {
        general: PolicySettings::new(std::time::Duration::from_secs(900), 4),
        auth: PolicySettings::new(std::time::Duration::from_secs(900), 2),
        upload: PolicySettings::new(std::time::Duration::from_secs(3600), 2),
        intensive: PolicySettings::new(std::time::Duration::from_secs(3600), 1),
        per_user: PolicySettings::new(std::time::Duration::from_secs(900), 2),
        user_agent_prefix: 50,
    }
}

fn test_state(upstream: &str, clock: &MockClock) -> Arc<AppState> {
    let registry = PolicyRegistry::from_table(
        &small_table(),
        PolicyRoute::defaults(),
        Arc::new(clock.clone()),
    )
    .expect("registry");
    Arc::new(AppState::new(upstream, registry))
}

/// `/api/.../ok` answers 200, `/api/.../fail` answers 401.
async fn stand_in(req: Request<Body>) -> StatusCode {
    if req.uri().path().ends_with("/fail") {
        StatusCode::UNAUTHORIZED
    } else {
        StatusCode::OK
    }
}

fn middleware_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/{*path}", any(stand_in))
        .route_layer(from_fn_with_state(state.clone(), admission))
        .with_state(state)
}

fn from_client(uri: &str, ip: [u8; 4]) -> Request<Body> {
    let mut req = Request::builder()
        .uri(uri)
        .header(header::USER_AGENT, "finance-web/2.3")
        .body(Body::empty())
        .unwrap();
    req.extensions_mut()
        .insert(ConnectInfo(SocketAddr::from((ip, 5555))));
    req
}

fn header_str<'a>(response: &'a axum::response::Response, name: impl axum::http::header::AsHeaderName) -> &'a str {
    response.headers().get(name).unwrap().to_str().unwrap()
}

// =============================================================================
// Admission middleware
// =============================================================================

#[tokio::test]
async fn quota_headers_on_every_response() {
    let clock = MockClock::default();
    let app = middleware_router(test_state("http://unused", &clock));

    for expected in ["3", "2", "1", "0"] {
        let response = app
            .clone()
            .oneshot(from_client("/api/accounts/ok", [10, 0, 0, 1]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_str(&response, X_RATELIMIT_LIMIT), "4");
        assert_eq!(header_str(&response, X_RATELIMIT_REMAINING), expected);
        assert!(header_str(&response, X_RATELIMIT_RESET).ends_with('Z'));
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
    }

    let response = app
        .oneshot(from_client("/api/accounts/ok", [10, 0, 0, 1]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header_str(&response, header::RETRY_AFTER), "900");
    assert_eq!(header_str(&response, X_RATELIMIT_REMAINING), "0");

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "Too many requests");
    assert_eq!(json["retry_after"], 900);
}

#[tokio::test]
async fn auth_policy_counts_only_failures() {
    let clock = MockClock::default();
    let app = middleware_router(test_state("http://unused", &clock));

    for _ in 0..10 {
        let response = app
            .clone()
            .oneshot(from_client("/api/auth/ok", [10, 0, 0, 2]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(from_client("/api/auth/fail", [10, 0, 0, 2]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    let response = app
        .oneshot(from_client("/api/auth/ok", [10, 0, 0, 2]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn upload_policy_counts_only_successes() {
    let clock = MockClock::default();
    let state = test_state("http://unused", &clock);
    let app = middleware_router(state.clone());

    for _ in 0..5 {
        let response = app
            .clone()
            .oneshot(from_client("/api/uploads/fail", [10, 0, 0, 3]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(from_client("/api/uploads/ok", [10, 0, 0, 3]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .oneshot(from_client("/api/uploads/ok", [10, 0, 0, 3]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let upload = state.registry.get("upload").unwrap();
    assert_eq!(upload.tracked_keys(), 1);
}

#[tokio::test]
async fn window_reset_readmits_client() {
    let clock = MockClock::default();
    let app = middleware_router(test_state("http://unused", &clock));

    let send = || app.clone().oneshot(from_client("/api/jobs/ok", [10, 0, 0, 4]));

    assert_eq!(send().await.unwrap().status(), StatusCode::OK);
    assert_eq!(send().await.unwrap().status(), StatusCode::TOO_MANY_REQUESTS);

    clock.advance_millis(3_600_001);
    let response = send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, X_RATELIMIT_REMAINING), "0");
}

#[tokio::test]
async fn clients_are_isolated_by_address() {
    let clock = MockClock::default();
    let app = middleware_router(test_state("http://unused", &clock));

    for _ in 0..5 {
        let _ = app
            .clone()
            .oneshot(from_client("/api/accounts/ok", [10, 0, 0, 5]))
            .await
            .unwrap();
    }

    let response = app
        .oneshot(from_client("/api/accounts/ok", [10, 0, 0, 6]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, X_RATELIMIT_REMAINING), "3");
}

#[tokio::test]
async fn per_user_policy_scopes_by_user_id() {
    let clock = MockClock::default();
    let app = middleware_router(test_state("http://unused", &clock));

    let as_user = |user: &str| {
        let mut req = from_client("/api/transfers/recommendations/ok", [10, 0, 0, 7]);
        req.headers_mut().insert("x-user-id", user.parse().unwrap());
        req
    };

    for _ in 0..2 {
        let response = app.clone().oneshot(as_user("alice")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = app.clone().oneshot(as_user("alice")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let response = app.oneshot(as_user("bob")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn per_user_policy_scopes_by_path_segment() {
    let clock = MockClock::default();
    let app = middleware_router(test_state("http://unused", &clock));

    let for_user = |user: &str| {
        from_client(&format!("/api/transfers/recommendations/{}", user), [10, 0, 0, 8])
    };

    for _ in 0..2 {
        let response = app.clone().oneshot(for_user("alice")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = app.clone().oneshot(for_user("alice")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let response = app.oneshot(for_user("bob")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, X_RATELIMIT_REMAINING), "1");
}

fn json_post(uri: &str, body: &str, ip: [u8; 4]) -> Request<Body> {
    let mut req = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    req.extensions_mut()
        .insert(ConnectInfo(SocketAddr::from((ip, 5555))));
    req
}

#[tokio::test]
async fn per_user_policy_reads_user_id_from_json_body() {
    let clock = MockClock::default();
    let state = test_state("http://unused", &clock);
    // echoes the body so the test sees what the handler received
    let app = Router::new()
        .route("/api/{*path}", post(|body: String| async move { body }))
        .route_layer(from_fn_with_state(state.clone(), admission))
        .with_state(state);

    let carol = r#"{"userId":"carol","amount":250}"#;
    let dave = r#"{"userId":"dave","amount":10}"#;

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(json_post("/api/transfers/recommendations", carol, [10, 0, 0, 9]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], carol.as_bytes());
    }
    let response = app
        .clone()
        .oneshot(json_post("/api/transfers/recommendations", carol, [10, 0, 0, 9]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let response = app
        .oneshot(json_post("/api/transfers/recommendations", dave, [10, 0, 0, 9]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn oversized_json_body_is_rejected_before_counting() {
    let clock = MockClock::default();
    let registry = PolicyRegistry::from_table(
        &small_table(),
        PolicyRoute::defaults(),
        Arc::new(clock.clone()),
    )
    .unwrap();
    let mut state = AppState::new("http://unused", registry);
    state.max_body_bytes = 16;
    let state = Arc::new(state);
    let app = middleware_router(state.clone());

    let response = app
        .oneshot(json_post(
            "/api/transfers/recommendations",
            r#"{"userId":"erin","note":"far more than sixteen bytes"}"#,
            [10, 0, 0, 10],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(state.registry.get("per-user").unwrap().tracked_keys(), 0);
}

#[tokio::test]
async fn missing_client_address_still_admitted() {
    let clock = MockClock::default();
    let app = middleware_router(test_state("http://unused", &clock));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/accounts/ok")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, X_RATELIMIT_REMAINING), "3");
}

// =============================================================================
// Full gateway
// =============================================================================

async fn spawn_upstream() -> String {
    let upstream = Router::new()
        .route("/api/accounts", get(|| async { "[{\"id\":1}]" }))
        .route(
            "/api/auth/login",
            post(|body: String| async move {
                if body.contains("secret") {
                    (StatusCode::OK, "token")
                } else {
                    (StatusCode::UNAUTHORIZED, "bad credentials")
                }
            }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, upstream).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn forwards_to_upstream_with_quota_headers() {
    let clock = MockClock::default();
    let upstream = spawn_upstream().await;
    let app = build_router(test_state(&upstream, &clock));

    let response = app
        .oneshot(from_client("/api/accounts", [127, 0, 0, 1]))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, X_RATELIMIT_REMAINING), "3");
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"[{\"id\":1}]");
}

#[tokio::test]
async fn upstream_status_drives_reconciliation() {
    let clock = MockClock::default();
    let upstream = spawn_upstream().await;
    let app = build_router(test_state(&upstream, &clock));

    let login = |password: &str| {
        let mut req = Request::builder()
            .method("POST")
            .uri("/api/auth/login")
            .body(Body::from(format!("password={}", password)))
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 2], 1))));
        req
    };

    for _ in 0..5 {
        let response = app.clone().oneshot(login("secret")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    for _ in 0..2 {
        let response = app.clone().oneshot(login("guess")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    let response = app.oneshot(login("secret")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn unreachable_upstream_is_bad_gateway() {
    let clock = MockClock::default();
    // nothing listens on port 9 of the loopback
    let app = build_router(test_state("http://127.0.0.1:9", &clock));

    let response = app
        .oneshot(from_client("/api/accounts", [127, 0, 0, 3]))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(header_str(&response, X_RATELIMIT_LIMIT), "4");
}

#[tokio::test]
async fn health_and_admin_are_not_limited() {
    let clock = MockClock::default();
    let state = test_state("http://unused", &clock);
    let app = build_router(state.clone());

    for _ in 0..10 {
        let response = app
            .clone()
            .oneshot(from_client("/health", [127, 0, 0, 4]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(X_RATELIMIT_LIMIT).is_none());
    }

    state.registry.get("general").unwrap().check_key("someone");

    let response = app
        .oneshot(from_client("/admin/rate-limits", [127, 0, 0, 4]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let summary: RateLimitsResponse = serde_json::from_slice(&body).unwrap();
    let names: Vec<_> = summary.policies.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, ["auth", "general", "intensive", "per-user", "upload"]);

    let general = summary.policies.iter().find(|p| p.name == "general").unwrap();
    assert_eq!(general.tracked_keys, 1);
    assert_eq!(general.window_secs, 900);
    assert_eq!(summary.routes.len(), PolicyRoute::defaults().len());
}

#[tokio::test]
async fn unknown_routes_get_json_not_found() {
    let clock = MockClock::default();
    let app = build_router(test_state("http://unused", &clock));

    let response = app
        .oneshot(from_client("/nowhere", [127, 0, 0, 6]))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(response.headers().get(X_RATELIMIT_LIMIT).is_none());
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["code"], "not_found");
    assert_eq!(json["error"], "Not found: /nowhere");
}

#[tokio::test]
async fn metrics_endpoint_exposes_admission_counters() {
    let clock = MockClock::default();
    let app = build_router(test_state("http://127.0.0.1:9", &clock));

    let _ = app
        .clone()
        .oneshot(from_client("/api/anything", [127, 0, 0, 5]))
        .await
        .unwrap();

    let response = app
        .oneshot(from_client("/metrics", [127, 0, 0, 5]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("gateway_admission_allowed_total"));
    assert!(text.contains("gateway_requests_total"));
}
