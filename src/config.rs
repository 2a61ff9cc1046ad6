use clap::Parser;
use std::time::Duration;

use crate::error::PolicyError;
use crate::rate_limit::{PolicyRoute, PolicySettings, PolicyTable};

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "finance-gateway")]
#[command(about = "Admission-control gateway for the finance dashboard backend")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    // Finance backend every /api request is forwarded to
    #[arg(short, long, default_value = "http://localhost:3001")]
    pub upstream: String,

    // General API traffic: window in seconds and max requests
    #[arg(long, default_value_t = 900)]
    pub general_window: u64,
    #[arg(long, default_value_t = 100)]
    pub general_limit: u32,

    // Authentication attempts (only failures count)
    #[arg(long, default_value_t = 900)]
    pub auth_window: u64,
    #[arg(long, default_value_t = 5)]
    pub auth_limit: u32,

    // Uploads (only successes count)
    #[arg(long, default_value_t = 3600)]
    pub upload_window: u64,
    #[arg(long, default_value_t = 10)]
    pub upload_limit: u32,

    // Intensive batch jobs (only successes count)
    #[arg(long, default_value_t = 3600)]
    pub intensive_window: u64,
    #[arg(long, default_value_t = 3)]
    pub intensive_limit: u32,

    // Per-user limit, keyed by user id + address
    #[arg(long, default_value_t = 900)]
    pub user_window: u64,
    #[arg(long, default_value_t = 30)]
    pub user_limit: u32,

    // Seconds between sweeps of expired counter entries
    #[arg(long, default_value_t = 60)]
    pub sweep_interval: u64,

    // Characters of the User-Agent that go into the default key
    #[arg(long, default_value_t = 50)]
    pub user_agent_prefix: usize,

    // Take the client address from X-Forwarded-For
    #[arg(long, default_value_t = false)]
    pub trust_proxy: bool,

    // Largest request body forwarded upstream
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    pub max_body_bytes: usize,

    // Extra PREFIX=POLICY routes, e.g. --route /api/reports=intensive
    #[arg(long = "route")]
    pub routes: Vec<String>,

    // Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    pub log_level: String,

    // Emit logs as JSON lines
    #[arg(long, default_value_t = false)]
    pub log_json: bool,
}

impl Args {
    pub fn policy_table(&self) -> PolicyTable {
        let settings = |window: u64, limit: u32| PolicySettings::new(Duration::from_secs(window), limit);
        PolicyTable {
            general: settings(self.general_window, self.general_limit),
            auth: settings(self.auth_window, self.auth_limit),
            upload: settings(self.upload_window, self.upload_limit),
            intensive: settings(self.intensive_window, self.intensive_limit),
            per_user: settings(self.user_window, self.user_limit),
            user_agent_prefix: self.user_agent_prefix,
        }
    }

    /// Default routes followed by any `--route` overrides.
    pub fn policy_routes(&self) -> Result<Vec<PolicyRoute>, PolicyError> {
        let mut routes = PolicyRoute::defaults();
        for raw in &self.routes {
            routes.push(raw.parse()?);
        }
        Ok(routes)
    }

    pub fn sweep_every(&self) -> Duration {
        Duration::from_secs(self.sweep_interval.max(1))
    }

    pub fn upstream_url(&self) -> String {
        let upstream = self.upstream.trim().trim_end_matches('/');
        if upstream.starts_with("http://") || upstream.starts_with("https://") {
            upstream.to_string()
        } else {
            format!("http://{}", upstream)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_reproduce_builtin_table() {
        let args = Args::parse_from(["finance-gateway"]);
        assert_eq!(args.policy_table(), PolicyTable::default());
        assert_eq!(args.sweep_every(), Duration::from_secs(60));
    }

    #[test]
    fn route_overrides_are_appended() {
        let args = Args::parse_from([
            "finance-gateway",
            "--route",
            "/api/reports=intensive",
            "--route",
            "/api/auth=general",
        ]);
        let routes = args.policy_routes().unwrap();
        assert_eq!(routes.len(), PolicyRoute::defaults().len() + 2);
        assert_eq!(routes.last().unwrap(), &PolicyRoute::new("/api/auth", "general"));
    }

    #[test]
    fn malformed_route_is_an_error() {
        let args = Args::parse_from(["finance-gateway", "--route", "reports"]);
        assert!(args.policy_routes().is_err());
    }

    #[test]
    fn upstream_gets_scheme_and_loses_trailing_slash() {
        let args = Args::parse_from(["finance-gateway", "--upstream", "backend:3001/"]);
        assert_eq!(args.upstream_url(), "http://backend:3001");
    }

    #[test]
    fn host_starting_with_http_still_gets_scheme() {
        let args = Args::parse_from(["finance-gateway", "--upstream", "httpbin:80"]);
        assert_eq!(args.upstream_url(), "http://httpbin:80");

        let args = Args::parse_from(["finance-gateway", "--upstream", "https://ledger.internal"]);
        assert_eq!(args.upstream_url(), "https://ledger.internal");
    }
}
