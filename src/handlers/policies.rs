use axum::{Json, extract::State};
use std::sync::Arc;

use crate::models::{PolicySummary, RateLimitsResponse, RouteSummary};
use crate::state::AppState;

// Registered policies and the routes that select them
pub async fn rate_limits_handler(State(state): State<Arc<AppState>>) -> Json<RateLimitsResponse> {
    let policies = state
        .registry
        .controllers()
        .iter()
        .map(|controller| {
            let policy = controller.policy();
            PolicySummary {
                name: policy.name.clone(),
                window_secs: policy.window.as_secs(),
                max_requests: policy.max_requests,
                skip_successful: policy.skip_successful,
                skip_failed: policy.skip_failed,
                tracked_keys: controller.tracked_keys(),
            }
        })
        .collect();

    let routes = state
        .registry
        .routes()
        .iter()
        .map(|route| RouteSummary {
            prefix: route.prefix.clone(),
            policy: route.policy.clone(),
        })
        .collect();

    Json(RateLimitsResponse { policies, routes })
}
