//! Operator controls for inspecting and resetting quotas.

use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use super::counter::QuotaStatus;
use super::identity::{ClientKey, CompositeKey};
use super::policy::PolicyRegistry;
use super::store::CounterStore;
use crate::error::Result;

/// The quota of one client within one operation class.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassStatus {
    pub class: String,
    #[serde(flatten)]
    pub status: QuotaStatus,
}

/// Inspection and reset of counters, intended for operator tooling rather
/// than the request path.
#[derive(Clone)]
pub struct RateLimitAdmin {
    registry: Arc<PolicyRegistry>,
    store: Arc<dyn CounterStore>,
}

impl RateLimitAdmin {
    pub fn new(registry: Arc<PolicyRegistry>, store: Arc<dyn CounterStore>) -> Self {
        Self { registry, store }
    }

    /// Current quota of `client` for one class, or for every registered class.
    ///
    /// Never creates counters.
    pub async fn inspect(&self, client: &ClientKey, class: Option<&str>) -> Result<Vec<ClassStatus>> {
        let classes = match class {
            Some(class) => vec![class.to_string()],
            None => self.registry.snapshot().classes(),
        };

        let mut statuses = Vec::with_capacity(classes.len());
        for class in classes {
            let policy = self.registry.policy_for(&class)?;
            let key = CompositeKey::new(client.clone(), class.as_str());
            let status = self.store.status_of(&key, &policy).await?;
            statuses.push(ClassStatus { class, status });
        }
        Ok(statuses)
    }

    /// Forget the counters of `client`: one class, or all of them.
    ///
    /// Unconditional; the class does not have to be registered any more.
    pub async fn reset(&self, client: &ClientKey, class: Option<&str>) -> Result<usize> {
        let removed = self.store.reset(client, class).await?;
        info!(
            client = %client,
            class = class.unwrap_or("*"),
            removed = removed,
            "Operator reset rate limit counters"
        );
        Ok(removed)
    }
}
