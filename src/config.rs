//! Configuration management for Gatekeeper.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::audit::UserRecord;
use crate::error::{GatekeeperError, Result};

/// Prefix for environment variable overrides, e.g. `GATEKEEPER__SERVER__HTTP_ADDR`.
const ENV_PREFIX: &str = "GATEKEEPER";

/// Main configuration for the Gatekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Deployment environment
    #[serde(default)]
    pub environment: Environment,

    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Audit configuration
    #[serde(default)]
    pub audit: AuditConfig,
}

/// Deployment environment.
///
/// Decides how a route with an unregistered operation class is handled:
/// development rejects loudly, production admits and logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    #[default]
    Production,
}

impl Environment {
    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Whether forwarded-for headers are honoured at all
    #[serde(default = "default_trust_forwarded_headers")]
    pub trust_forwarded_headers: bool,

    /// Header carrying the forwarded-for chain
    #[serde(default = "default_forwarded_header")]
    pub forwarded_header: String,

    /// Peers allowed to set the forwarded-for header (empty trusts every peer)
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            trust_forwarded_headers: default_trust_forwarded_headers(),
            forwarded_header: default_forwarded_header(),
            trusted_proxies: Vec::new(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_trust_forwarded_headers() -> bool {
    true
}

fn default_forwarded_header() -> String {
    "x-forwarded-for".to_string()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path to the policy table (built-in defaults when unset)
    pub policy_path: Option<String>,

    /// Policy reload interval in seconds (0 disables reloading)
    #[serde(default = "default_reload_interval")]
    pub policy_reload_interval_secs: u64,

    /// How often expired counters are reaped, in seconds
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,

    /// Deadline for one admission decision, in milliseconds
    #[serde(default = "default_decision_timeout")]
    pub decision_timeout_ms: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            policy_path: None,
            policy_reload_interval_secs: default_reload_interval(),
            reap_interval_secs: default_reap_interval(),
            decision_timeout_ms: default_decision_timeout(),
        }
    }
}

impl RateLimitingConfig {
    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn decision_timeout(&self) -> Duration {
        Duration::from_millis(self.decision_timeout_ms)
    }

    /// `None` when reloading is disabled.
    pub fn policy_reload_interval(&self) -> Option<Duration> {
        (self.policy_reload_interval_secs > 0)
            .then(|| Duration::from_secs(self.policy_reload_interval_secs))
    }
}

fn default_reload_interval() -> u64 {
    60
}

fn default_reap_interval() -> u64 {
    300
}

fn default_decision_timeout() -> u64 {
    50
}

/// Audit configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditConfig {
    /// JSON-lines file receiving audit events (in-memory when unset)
    pub log_path: Option<String>,

    /// Static user directory keyed by external identity
    #[serde(default)]
    pub users: HashMap<String, UserRecord>,
}

impl GatekeeperConfig {
    /// Load configuration from an optional file layered under environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize::<GatekeeperConfig>()?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.rate_limiting.decision_timeout_ms == 0 {
            return Err(GatekeeperError::Config(
                "rate_limiting.decision_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.rate_limiting.reap_interval_secs == 0 {
            return Err(GatekeeperError::Config(
                "rate_limiting.reap_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
