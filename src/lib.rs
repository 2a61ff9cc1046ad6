pub mod body;
pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod rate_limit;
pub mod routes;
pub mod state;

pub use error::{ApiError, PolicyError};
pub use rate_limit::{AdmissionController, Decision, Outcome, Policy, PolicyName, PolicyRegistry};
pub use routes::build_router;
pub use state::AppState;
