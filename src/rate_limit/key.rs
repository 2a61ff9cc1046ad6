use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

/// Placeholder substituted for any identity part the request doesn't carry.
pub const UNKNOWN: &str = "unknown";

/// How many characters of the User-Agent go into the default key.
pub const DEFAULT_USER_AGENT_PREFIX: usize = 50;

// What the request pipeline knows about the caller
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestIdentity {
    pub client_addr: Option<IpAddr>,
    pub user_agent: Option<String>,
    pub user_id: Option<String>,
}

impl RequestIdentity {
    pub fn from_addr(addr: IpAddr) -> Self {
        Self {
            client_addr: Some(addr),
            ..Self::default()
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    fn addr_or_unknown(&self) -> String {
        self.client_addr
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| UNKNOWN.to_string())
    }
}

/// Turns a [`RequestIdentity`] into the composite key counts are kept under.
#[derive(Clone)]
pub enum KeyStrategy {
    /// `"{addr}:{user agent prefix}"`. The prefix caps key size per client.
    ClientAndAgent { prefix_len: usize },
    /// `"user:{user id}:{addr}"`, for limits scoped to an authenticated principal.
    UserAndClient,
    Custom(Arc<dyn Fn(&RequestIdentity) -> String + Send + Sync>),
}

impl KeyStrategy {
    pub fn custom<F>(derive: F) -> Self
    where
        F: Fn(&RequestIdentity) -> String + Send + Sync + 'static,
    {
        KeyStrategy::Custom(Arc::new(derive))
    }

    /// Whether the derived key can depend on the user id.
    pub fn uses_user_id(&self) -> bool {
        !matches!(self, KeyStrategy::ClientAndAgent { .. })
    }

    pub fn derive(&self, identity: &RequestIdentity) -> String {
        match self {
            KeyStrategy::ClientAndAgent { prefix_len } => {
                let agent = match identity.user_agent.as_deref() {
                    Some(agent) if !agent.is_empty() => {
                        agent.chars().take(*prefix_len).collect::<String>()
                    }
                    _ => UNKNOWN.to_string(),
                };
                format!("{}:{}", identity.addr_or_unknown(), agent)
            }
            KeyStrategy::UserAndClient => {
                let user = identity
                    .user_id
                    .as_deref()
                    .filter(|id| !id.is_empty())
                    .unwrap_or(UNKNOWN);
                format!("user:{}:{}", user, identity.addr_or_unknown())
            }
            KeyStrategy::Custom(derive) => derive(identity),
        }
    }
}

impl Default for KeyStrategy {
    fn default() -> Self {
        KeyStrategy::ClientAndAgent {
            prefix_len: DEFAULT_USER_AGENT_PREFIX,
        }
    }
}

impl fmt::Debug for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStrategy::ClientAndAgent { prefix_len } => f
                .debug_struct("ClientAndAgent")
                .field("prefix_len", prefix_len)
                .finish(),
            KeyStrategy::UserAndClient => f.write_str("UserAndClient"),
            KeyStrategy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}
