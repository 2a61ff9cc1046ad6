use crate::rate_limit::PolicyRegistry;

// app's shared state
pub struct AppState {
    pub client: reqwest::Client,
    pub upstream: String,            // finance backend base url
    pub registry: PolicyRegistry,    // one admission controller per policy
    pub trust_proxy: bool,           // read client address from X-Forwarded-For
    pub max_body_bytes: usize,       // largest body forwarded upstream
}

impl AppState {
    pub fn new(upstream: impl Into<String>, registry: PolicyRegistry) -> Self {
        Self {
            client: reqwest::Client::new(),
            upstream: upstream.into(),
            registry,
            trust_proxy: false,
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}
