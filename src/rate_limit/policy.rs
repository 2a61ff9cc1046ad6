use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use super::controller::{AdmissionController, Decision, Outcome};
use super::eviction::EvictionTask;
use super::key::KeyStrategy;
use crate::clock::Clock;
use crate::error::PolicyError;
use crate::metrics::ADMISSION_DENIED;

/// Observer run on every denied request.
pub type LimitHook = Arc<dyn Fn(&Decision) + Send + Sync>;

/// Immutable configuration of one admission controller.
#[derive(Clone)]
pub struct Policy {
    pub name: String,
    pub window: Duration,
    pub max_requests: u32,
    /// Successful responses don't count toward the ceiling.
    pub skip_successful: bool,
    /// Failed responses don't count toward the ceiling.
    pub skip_failed: bool,
    pub key_strategy: KeyStrategy,
    pub on_limit_reached: Option<LimitHook>,
}

impl Policy {
    pub fn new(name: impl Into<String>, window: Duration, max_requests: u32) -> Self {
        Self {
            name: name.into(),
            window,
            max_requests,
            skip_successful: false,
            skip_failed: false,
            key_strategy: KeyStrategy::default(),
            on_limit_reached: None,
        }
    }

    pub fn skip_successful_requests(mut self) -> Self {
        self.skip_successful = true;
        self
    }

    pub fn skip_failed_requests(mut self) -> Self {
        self.skip_failed = true;
        self
    }

    pub fn key_strategy(mut self, strategy: KeyStrategy) -> Self {
        self.key_strategy = strategy;
        self
    }

    pub fn on_limit_reached<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Decision) + Send + Sync + 'static,
    {
        self.on_limit_reached = Some(Arc::new(hook));
        self
    }

    pub fn excludes(&self, outcome: Outcome) -> bool {
        match outcome {
            Outcome::Success => self.skip_successful,
            Outcome::Failure => self.skip_failed,
        }
    }
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Policy")
            .field("name", &self.name)
            .field("window", &self.window)
            .field("max_requests", &self.max_requests)
            .field("skip_successful", &self.skip_successful)
            .field("skip_failed", &self.skip_failed)
            .field("key_strategy", &self.key_strategy)
            .field("on_limit_reached", &self.on_limit_reached.is_some())
            .finish()
    }
}

/// Default limit hook: counts the denial and logs one structured warning.
pub fn log_limit_reached(decision: &Decision) {
    ADMISSION_DENIED.with_label_values(&[&*decision.policy]).inc();
    tracing::warn!(
        policy = %decision.policy,
        key = %decision.key,
        count = decision.count,
        limit = decision.limit,
        reset_at = %decision.reset_at.to_rfc3339(),
        "Rate limit reached"
    );
}

/// Ad-hoc policy keyed by application user id plus client address.
pub fn user_rate_limit(name: impl Into<String>, window: Duration, max_requests: u32) -> Policy {
    Policy::new(name, window, max_requests)
        .key_strategy(KeyStrategy::UserAndClient)
        .on_limit_reached(log_limit_reached)
}

/// The built-in policy classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyName {
    General,
    Auth,
    Upload,
    Intensive,
}

impl PolicyName {
    pub const ALL: [PolicyName; 4] = [
        PolicyName::General,
        PolicyName::Auth,
        PolicyName::Upload,
        PolicyName::Intensive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyName::General => "general",
            PolicyName::Auth => "auth",
            PolicyName::Upload => "upload",
            PolicyName::Intensive => "intensive",
        }
    }
}

impl fmt::Display for PolicyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyName {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PolicyName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| PolicyError::UnknownPolicy(s.to_string()))
    }
}

/// Window and ceiling for one policy class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicySettings {
    pub window: Duration,
    pub max_requests: u32,
}

impl PolicySettings {
    pub const fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
        }
    }
}

/// Numbers for every policy the gateway registers at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyTable {
    pub general: PolicySettings,
    pub auth: PolicySettings,
    pub upload: PolicySettings,
    pub intensive: PolicySettings,
    pub per_user: PolicySettings,
    pub user_agent_prefix: usize,
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self {
            general: PolicySettings::new(Duration::from_secs(15 * 60), 100),
            auth: PolicySettings::new(Duration::from_secs(15 * 60), 5),
            upload: PolicySettings::new(Duration::from_secs(60 * 60), 10),
            intensive: PolicySettings::new(Duration::from_secs(60 * 60), 3),
            per_user: PolicySettings::new(Duration::from_secs(15 * 60), 30),
            user_agent_prefix: super::key::DEFAULT_USER_AGENT_PREFIX,
        }
    }
}

impl PolicyTable {
    pub const PER_USER: &'static str = "per-user";

    /// The four named policies with their counting rules applied.
    pub fn policy(&self, name: PolicyName) -> Policy {
        let key = KeyStrategy::ClientAndAgent {
            prefix_len: self.user_agent_prefix,
        };
        let policy = |settings: PolicySettings| {
            Policy::new(name.as_str(), settings.window, settings.max_requests)
                .key_strategy(key.clone())
                .on_limit_reached(log_limit_reached)
        };

        match name {
            PolicyName::General => policy(self.general),
            // only failed logins count
            PolicyName::Auth => policy(self.auth).skip_successful_requests(),
            PolicyName::Upload => policy(self.upload).skip_failed_requests(),
            PolicyName::Intensive => policy(self.intensive).skip_failed_requests(),
        }
    }

    pub fn per_user_policy(&self) -> Policy {
        user_rate_limit(
            Self::PER_USER,
            self.per_user.window,
            self.per_user.max_requests,
        )
    }
}

/// Maps requests under `prefix` to the policy called `policy`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRoute {
    pub prefix: String,
    pub policy: String,
}

impl PolicyRoute {
    pub fn new(prefix: impl Into<String>, policy: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            policy: policy.into(),
        }
    }

    // segment-aware: "/api/auth" covers "/api/auth/login" but not "/api/authors"
    fn matches(&self, path: &str) -> bool {
        let prefix = self.prefix.trim_end_matches('/');
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// First path segment below the prefix, e.g. `alice` for
    /// `/api/transfers/recommendations/alice/latest`.
    pub fn segment_after<'a>(&self, path: &'a str) -> Option<&'a str> {
        if !self.matches(path) {
            return None;
        }
        let rest = &path[self.prefix.trim_end_matches('/').len()..];
        rest.split('/').find(|segment| !segment.is_empty())
    }

    pub fn defaults() -> Vec<PolicyRoute> {
        vec![
            PolicyRoute::new("/api/auth", PolicyName::Auth.as_str()),
            PolicyRoute::new("/api/uploads", PolicyName::Upload.as_str()),
            PolicyRoute::new("/api/jobs", PolicyName::Intensive.as_str()),
            PolicyRoute::new("/api/transfers/recommendations", PolicyTable::PER_USER),
        ]
    }
}

impl FromStr for PolicyRoute {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, policy) = s
            .split_once('=')
            .ok_or_else(|| PolicyError::InvalidRoute(s.to_string()))?;
        let (prefix, policy) = (prefix.trim(), policy.trim());
        if !prefix.starts_with('/') || policy.is_empty() {
            return Err(PolicyError::InvalidRoute(s.to_string()));
        }
        Ok(PolicyRoute::new(prefix, policy))
    }
}

/// Named controllers, built once at startup and shared by reference.
#[derive(Default)]
pub struct PolicyRegistry {
    controllers: HashMap<String, Arc<AdmissionController>>,
    routes: Vec<PolicyRoute>,
    fallback: Option<String>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The four named policies plus the per-user one, each with its own store.
    pub fn from_table(
        table: &PolicyTable,
        routes: Vec<PolicyRoute>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PolicyError> {
        let mut registry = Self::new();
        for name in PolicyName::ALL {
            let controller = AdmissionController::with_clock(table.policy(name), Arc::clone(&clock))?;
            registry.insert(controller)?;
        }
        registry.insert(AdmissionController::with_clock(
            table.per_user_policy(),
            Arc::clone(&clock),
        )?)?;
        registry.fallback = Some(PolicyName::General.as_str().to_string());

        for route in routes {
            registry.add_route(route)?;
        }
        Ok(registry)
    }

    /// Names are unique; a second controller under a taken name is rejected
    /// so the first one's counter store is never dropped.
    pub fn insert(
        &mut self,
        controller: AdmissionController,
    ) -> Result<Arc<AdmissionController>, PolicyError> {
        if self.controllers.contains_key(controller.name()) {
            return Err(PolicyError::DuplicatePolicy(controller.name().to_string()));
        }
        let controller = Arc::new(controller);
        self.controllers
            .insert(controller.name().to_string(), Arc::clone(&controller));
        Ok(controller)
    }

    /// Later routes for the same prefix replace earlier ones.
    pub fn add_route(&mut self, route: PolicyRoute) -> Result<(), PolicyError> {
        if !self.controllers.contains_key(&route.policy) {
            return Err(PolicyError::UnknownPolicy(route.policy));
        }
        self.routes.retain(|existing| existing.prefix != route.prefix);
        self.routes.push(route);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<AdmissionController>> {
        self.controllers.get(name).cloned()
    }

    pub fn policy(&self, name: PolicyName) -> Option<Arc<AdmissionController>> {
        self.get(name.as_str())
    }

    /// Route whose prefix covers `path`, longest prefix first.
    pub fn matched_route(&self, path: &str) -> Option<&PolicyRoute> {
        self.routes
            .iter()
            .filter(|route| route.matches(path))
            .max_by_key(|route| route.prefix.trim_end_matches('/').len())
    }

    /// Longest matching route prefix wins; unmatched paths use the fallback.
    pub fn resolve(&self, path: &str) -> Option<Arc<AdmissionController>> {
        let name = self
            .matched_route(path)
            .map(|route| route.policy.as_str())
            .or(self.fallback.as_deref())?;
        self.get(name)
    }

    pub fn routes(&self) -> &[PolicyRoute] {
        &self.routes
    }

    /// Controllers sorted by name.
    pub fn controllers(&self) -> Vec<Arc<AdmissionController>> {
        let mut all: Vec<_> = self.controllers.values().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// One eviction task per controller.
    pub fn spawn_eviction(&self, every: Duration) -> Vec<EvictionTask> {
        self.controllers()
            .into_iter()
            .map(|controller| EvictionTask::spawn(controller, every))
            .collect()
    }
}
