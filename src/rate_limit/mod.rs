//! Sliding-window admission control.
//!
//! Each [`AdmissionController`] owns one counter store and one [`Policy`].
//! The request path calls [`AdmissionController::check`] before the handler
//! runs and [`AdmissionController::reconcile`] once the handler's status is
//! known. Expired entries are dropped by an [`EvictionTask`].

mod controller;
mod eviction;
mod key;
mod policy;

pub use controller::{AdmissionController, Decision, Outcome, RateLimitEntry};
pub use eviction::EvictionTask;
pub use key::{DEFAULT_USER_AGENT_PREFIX, KeyStrategy, RequestIdentity, UNKNOWN};
pub use policy::{
    LimitHook, Policy, PolicyName, PolicyRegistry, PolicyRoute, PolicySettings, PolicyTable,
    log_limit_reached, user_rate_limit,
};
