use axum::{
    Router,
    middleware::from_fn_with_state,
    routing::{any, get},
};
use std::sync::Arc;

use crate::handlers::{
    health_handler, metrics_handler, not_found_handler, proxy_handler, rate_limits_handler,
};
use crate::middleware::admission;
use crate::state::AppState;

// health, metrics and the admin view are not rate limited; everything
// under /api goes through admission control before it is forwarded
pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/api/{*path}", any(proxy_handler))
        .route_layer(from_fn_with_state(state.clone(), admission));

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/admin/rate-limits", get(rate_limits_handler))
        .merge(api)
        .fallback(not_found_handler)
        .with_state(state)
}
