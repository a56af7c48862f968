//! Rate limit policies and the registry that serves them.
//!
//! A policy table maps an operation class name to the limit that applies to it.
//! Tables are loaded from YAML (or the built-in defaults) and are never edited in
//! place: the registry swaps a whole table at once, so readers always see either
//! the old table or the new one.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{GatekeeperError, Result};

/// Canonical operation class names.
pub mod class {
    /// Authentication attempts (login, password reset).
    pub const AUTH: &str = "auth";
    /// OAuth handshakes and callbacks.
    pub const OAUTH: &str = "oauth";
    /// Authenticated API calls.
    pub const API: &str = "api";
    /// Anonymous API calls.
    pub const API_ANONYMOUS: &str = "api_anonymous";
    /// Write operations.
    pub const WRITE: &str = "write";
    /// Expensive or compute-heavy operations.
    pub const EXPENSIVE: &str = "expensive";
    /// Webhook deliveries.
    pub const WEBHOOK: &str = "webhook";
    /// Administrative calls.
    pub const ADMIN: &str = "admin";
}

/// An immutable rate limit policy for one operation class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    /// Length of one counting window
    pub window: Duration,
    /// Requests admitted per window
    pub max_requests: u64,
    /// Message returned to rejected callers
    pub message: String,
}

impl Policy {
    pub fn new(max_requests: u64, window: Duration, message: impl Into<String>) -> Self {
        Self {
            window,
            max_requests,
            message: message.into(),
        }
    }

    /// The window as a signed calendar duration, saturating on overflow.
    pub fn window_delta(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::MAX)
    }

    fn validate(&self, class: &str) -> Result<()> {
        if self.max_requests == 0 {
            return Err(GatekeeperError::InvalidPolicy {
                class: class.to_string(),
                reason: "max_requests must be greater than zero".to_string(),
            });
        }
        if self.window.is_zero() {
            return Err(GatekeeperError::InvalidPolicy {
                class: class.to_string(),
                reason: "window must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Time unit for policy windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// A policy as written in the YAML policy file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Number of requests allowed per window
    pub max_requests: u64,
    /// Window length, counted in `unit`s
    #[serde(default = "default_window")]
    pub window: u64,
    /// The time unit
    pub unit: TimeUnit,
    /// Message returned to rejected callers
    #[serde(default)]
    pub message: Option<String>,
}

fn default_window() -> u64 {
    1
}

impl PolicyRule {
    fn into_policy(self) -> Policy {
        let window = self
            .unit
            .duration()
            .checked_mul(u32::try_from(self.window).unwrap_or(u32::MAX))
            .unwrap_or(Duration::MAX);
        let message = self
            .message
            .unwrap_or_else(|| "Too many requests, please try again later.".to_string());
        Policy::new(self.max_requests, window, message)
    }
}

#[derive(Debug, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    policies: HashMap<String, PolicyRule>,
}

/// A complete, validated mapping from operation class to policy.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    policies: HashMap<String, Arc<Policy>>,
}

impl PolicyTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in table covering every canonical operation class.
    pub fn defaults() -> Self {
        let minute = Duration::from_secs(60);
        let entries = [
            (
                class::AUTH,
                Policy::new(
                    5,
                    15 * minute,
                    "Too many authentication attempts, please try again later.",
                ),
            ),
            (
                class::OAUTH,
                Policy::new(
                    10,
                    10 * minute,
                    "Too many OAuth requests, please try again later.",
                ),
            ),
            (
                class::API,
                Policy::new(60, minute, "Too many requests, please slow down."),
            ),
            (
                class::API_ANONYMOUS,
                Policy::new(
                    10,
                    minute,
                    "Too many requests, please sign in or try again later.",
                ),
            ),
            (
                class::WRITE,
                Policy::new(30, minute, "Too many write operations, please slow down."),
            ),
            (
                class::EXPENSIVE,
                Policy::new(
                    10,
                    60 * minute,
                    "Too many resource-intensive requests, please try again later.",
                ),
            ),
            (
                class::WEBHOOK,
                Policy::new(100, minute, "Too many webhook deliveries."),
            ),
            (
                class::ADMIN,
                Policy::new(100, minute, "Too many administrative requests."),
            ),
        ];

        let mut table = Self::new();
        for (name, policy) in entries {
            table.policies.insert(name.to_string(), Arc::new(policy));
        }
        table
    }

    /// Load a table from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a table from a YAML string, validating every policy.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: PolicyFile = serde_yaml::from_str(yaml).map_err(|e| {
            GatekeeperError::Config(format!("Failed to parse policy table: {}", e))
        })?;

        let mut table = Self::new();
        for (name, rule) in file.policies {
            table.insert(name, rule.into_policy())?;
        }
        Ok(table)
    }

    /// Add or replace a policy after validating it.
    pub fn insert(&mut self, class: impl Into<String>, policy: Policy) -> Result<()> {
        let class = class.into();
        policy.validate(&class)?;
        self.policies.insert(class, Arc::new(policy));
        Ok(())
    }

    pub fn get(&self, class: &str) -> Option<&Arc<Policy>> {
        self.policies.get(class)
    }

    /// Registered class names, sorted.
    pub fn classes(&self) -> Vec<String> {
        let mut classes: Vec<String> = self.policies.keys().cloned().collect();
        classes.sort();
        classes
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// The shortest window of any policy in the table.
    pub fn shortest_window(&self) -> Option<Duration> {
        self.policies.values().map(|p| p.window).min()
    }
}

/// Read-mostly registry serving the current policy table.
pub struct PolicyRegistry {
    table: RwLock<Arc<PolicyTable>>,
    changed: Notify,
}

impl PolicyRegistry {
    pub fn new(table: PolicyTable) -> Self {
        Self {
            table: RwLock::new(Arc::new(table)),
            changed: Notify::new(),
        }
    }

    /// Look up the policy for an operation class.
    pub fn policy_for(&self, class: &str) -> Result<Arc<Policy>> {
        self.table
            .read()
            .get(class)
            .cloned()
            .ok_or_else(|| GatekeeperError::UnknownPolicy(class.to_string()))
    }

    /// A snapshot of the current table.
    pub fn snapshot(&self) -> Arc<PolicyTable> {
        self.table.read().clone()
    }

    /// Swap in a whole new table.
    pub fn replace(&self, table: PolicyTable) {
        let table = Arc::new(table);
        *self.table.write() = table;
        self.changed.notify_waiters();
    }

    /// Resolves on the next [`replace`](Self::replace).
    ///
    /// Only replacements after this call are observed, so create the future
    /// before reading the table.
    pub fn changed(&self) -> Notified<'_> {
        self.changed.notified()
    }

    pub fn shortest_window(&self) -> Option<Duration> {
        self.table.read().shortest_window()
    }

    /// Reload the table from a file. The current table stays in place on error.
    pub fn reload_from_file<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let table = PolicyTable::from_file(path)?;
        let count = table.len();
        self.replace(table);
        Ok(count)
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new(PolicyTable::defaults())
    }
}

/// Periodically reload the policy table from `path` until `cancel` fires.
pub fn spawn_policy_reloader(
    registry: Arc<PolicyRegistry>,
    path: String,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately and the table was just loaded.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match registry.reload_from_file(&path) {
                        Ok(count) => info!(path = %path, policies = count, "Reloaded rate limit policies"),
                        Err(e) => warn!(path = %path, error = %e, "Policy reload failed, keeping current table"),
                    }
                }
            }
        }
        info!("Policy reloader stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_canonical_classes() {
        let table = PolicyTable::defaults();
        assert_eq!(table.len(), 8);

        let auth = table.get(class::AUTH).unwrap();
        assert_eq!(auth.max_requests, 5);
        assert_eq!(auth.window, Duration::from_secs(15 * 60));

        let oauth = table.get(class::OAUTH).unwrap();
        assert_eq!(oauth.max_requests, 10);
        assert_eq!(oauth.window, Duration::from_secs(10 * 60));

        let expensive = table.get(class::EXPENSIVE).unwrap();
        assert_eq!(expensive.max_requests, 10);
        assert_eq!(expensive.window, Duration::from_secs(3600));

        assert_eq!(table.get(class::API).unwrap().max_requests, 60);
        assert_eq!(table.get(class::API_ANONYMOUS).unwrap().max_requests, 10);
        assert_eq!(table.get(class::WRITE).unwrap().max_requests, 30);
        assert_eq!(table.get(class::WEBHOOK).unwrap().max_requests, 100);
        assert_eq!(table.get(class::ADMIN).unwrap().max_requests, 100);
        assert_eq!(table.shortest_window(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_parse_policy_file() {
        let yaml = r#"
policies:
  auth:
    max_requests: 5
    window: 15
    unit: minute
    message: "Slow down"
  webhook:
    max_requests: 100
    unit: second
"#;
        let table = PolicyTable::from_yaml(yaml).unwrap();
        assert_eq!(table.classes(), vec!["auth".to_string(), "webhook".to_string()]);

        let auth = table.get("auth").unwrap();
        assert_eq!(auth.window, Duration::from_secs(900));
        assert_eq!(auth.message, "Slow down");

        let webhook = table.get("webhook").unwrap();
        assert_eq!(webhook.window, Duration::from_secs(1));
        assert!(!webhook.message.is_empty());
    }

    #[test]
    fn test_rejects_zero_limit() {
        let yaml = r#"
policies:
  broken:
    max_requests: 0
    unit: minute
"#;
        let err = PolicyTable::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, GatekeeperError::InvalidPolicy { ref class, .. } if class == "broken"));
    }

    #[test]
    fn test_rejects_zero_window() {
        let yaml = r#"
policies:
  broken:
    max_requests: 3
    window: 0
    unit: hour
"#;
        assert!(PolicyTable::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_unknown_policy() {
        let registry = PolicyRegistry::default();
        let err = registry.policy_for("nonexistent").unwrap_err();
        assert!(matches!(err, GatekeeperError::UnknownPolicy(ref c) if c == "nonexistent"));
    }

    #[test]
    fn test_replace_swaps_whole_table() {
        let registry = PolicyRegistry::default();
        let before = registry.snapshot();
        assert!(registry.policy_for(class::AUTH).is_ok());

        let mut table = PolicyTable::new();
        table
            .insert("custom", Policy::new(3, Duration::from_secs(60), "custom"))
            .unwrap();
        registry.replace(table);

        assert!(registry.policy_for(class::AUTH).is_err());
        assert_eq!(registry.policy_for("custom").unwrap().max_requests, 3);
        // Snapshots taken earlier are unaffected.
        assert!(before.get(class::AUTH).is_some());
    }

    #[tokio::test]
    async fn test_replace_wakes_change_listeners() {
        let registry = PolicyRegistry::default();
        let changed = registry.changed();

        registry.replace(PolicyTable::new());

        tokio::time::timeout(Duration::from_secs(1), changed)
            .await
            .expect("replace should notify listeners");
    }

    #[test]
    fn test_reload_keeps_table_on_error() {
        let registry = PolicyRegistry::default();
        assert!(registry.reload_from_file("/nonexistent/policies.yaml").is_err());
        assert_eq!(registry.snapshot().len(), 8);
    }

    #[test]
    fn test_time_unit_duration() {
        assert_eq!(TimeUnit::Second.duration(), Duration::from_secs(1));
        assert_eq!(TimeUnit::Minute.duration(), Duration::from_secs(60));
        assert_eq!(TimeUnit::Hour.duration(), Duration::from_secs(3600));
        assert_eq!(TimeUnit::Day.duration(), Duration::from_secs(86400));
    }
}
