use serde::{Deserialize, Serialize};

// Health endpoint body
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

// One registered policy, as shown on /admin/rate-limits
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct PolicySummary {
    pub name: String,
    pub window_secs: u64,
    pub max_requests: u32,
    pub skip_successful: bool,
    pub skip_failed: bool,
    pub tracked_keys: usize,
}

// Which policy guards which path prefix
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct RouteSummary {
    pub prefix: String,
    pub policy: String,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct RateLimitsResponse {
    pub policies: Vec<PolicySummary>,
    pub routes: Vec<RouteSummary>,
}
