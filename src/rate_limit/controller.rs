use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;

use super::key::RequestIdentity;
use super::policy::Policy;
use crate::clock::{Clock, SystemClock};
use crate::error::PolicyError;

// Rate limit entry - tracks requests per composite key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    pub count: u32,
    pub window_start: DateTime<Utc>,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitEntry {
    fn open(now: DateTime<Utc>, window: TimeDelta) -> Self {
        Self {
            count: 1,
            window_start: now,
            reset_at: now + window,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.reset_at
    }
}

/// How the handler's response should be classified for re-accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    /// Anything below 400 is a success.
    pub fn from_status(status: u16) -> Self {
        if status < 400 {
            Outcome::Success
        } else {
            Outcome::Failure
        }
    }
}

/// Result of one admission check. Provisional until reconciled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub policy: Arc<str>,
    pub key: String,
    pub allowed: bool,
    pub limit: u32,
    pub count: u32,
    pub remaining: u32,
    pub window_start: DateTime<Utc>,
    pub reset_at: DateTime<Utc>,
    pub retry_after_secs: u64,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }
}

/// Per-policy counter store plus the rules for reading and correcting it.
pub struct AdmissionController {
    name: Arc<str>,
    policy: Policy,
    window: TimeDelta,
    entries: DashMap<String, RateLimitEntry>,
    clock: Arc<dyn Clock>,
}

impl AdmissionController {
    pub fn new(policy: Policy) -> Result<Self, PolicyError> {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    pub fn with_clock(policy: Policy, clock: Arc<dyn Clock>) -> Result<Self, PolicyError> {
        if policy.max_requests == 0 {
            return Err(PolicyError::ZeroCeiling(policy.name.clone()));
        }
        if policy.window.is_zero() {
            return Err(PolicyError::ZeroWindow(policy.name.clone()));
        }
        let window = TimeDelta::from_std(policy.window)
            .map_err(|_| PolicyError::WindowOutOfRange(policy.name.clone()))?;

        Ok(Self {
            name: Arc::from(policy.name.as_str()),
            policy,
            window,
            entries: DashMap::new(),
            clock,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn derive_key(&self, identity: &RequestIdentity) -> String {
        self.policy.key_strategy.derive(identity)
    }

    /// Derives the caller's key and counts the request against it.
    pub fn check(&self, identity: &RequestIdentity) -> Decision {
        let key = self.derive_key(identity);
        self.check_key(key)
    }

    /// Counts one request for `key`. The limit hook fires once on every deny.
    pub fn check_key(&self, key: impl Into<String>) -> Decision {
        let key = key.into();
        let now = self.clock.now();

        // the shard lock is held only inside this block; the hook runs after
        let entry = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.is_expired(now) {
                    *entry = RateLimitEntry::open(now, self.window);
                } else {
                    entry.count = entry.count.saturating_add(1);
                }
                *entry
            }
            Entry::Vacant(vacant) => *vacant.insert(RateLimitEntry::open(now, self.window)),
        };

        let limit = self.policy.max_requests;
        let decision = Decision {
            policy: Arc::clone(&self.name),
            key,
            allowed: entry.count <= limit,
            limit,
            count: entry.count,
            remaining: limit.saturating_sub(entry.count),
            window_start: entry.window_start,
            reset_at: entry.reset_at,
            retry_after_secs: self.retry_after_secs(),
        };

        if !decision.allowed {
            if let Some(hook) = &self.policy.on_limit_reached {
                hook(&decision);
            }
        }

        decision
    }

    /// Undoes the provisional increment of an allowed request whose outcome
    /// the policy doesn't count. Returns whether the counter was decremented.
    pub fn reconcile(&self, decision: &Decision, outcome: Outcome) -> bool {
        if !decision.allowed || !self.policy.excludes(outcome) {
            return false;
        }

        match self.entries.get_mut(&decision.key) {
            // a rolled-over window is a different logical entry
            Some(mut entry) if entry.window_start == decision.window_start && entry.count > 0 => {
                entry.count -= 1;
                true
            }
            _ => false,
        }
    }

    /// Current entry for `key`, expired or not.
    pub fn entry(&self, key: &str) -> Option<RateLimitEntry> {
        self.entries.get(key).map(|entry| *entry)
    }

    pub fn reset_key(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn tracked_keys(&self) -> usize {
        self.entries.len()
    }

    /// Drops every entry whose window has ended. Returns how many went.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let live = !entry.is_expired(now);
            if !live {
                removed += 1;
            }
            live
        });
        removed
    }

    // whole window in seconds, rounded up
    fn retry_after_secs(&self) -> u64 {
        let window: Duration = self.policy.window;
        if window.subsec_nanos() > 0 {
            window.as_secs() + 1
        } else {
            window.as_secs()
        }
    }
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("policy", &self.policy)
            .field("tracked_keys", &self.entries.len())
            .finish()
    }
}
