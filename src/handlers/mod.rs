mod health;
mod metrics;
mod policies;
mod proxy;

pub use health::{health_handler, not_found_handler};
pub use metrics::metrics_handler;
pub use policies::rate_limits_handler;
pub use proxy::proxy_handler;
