//! Admission decisions.

use axum::http::request::Parts;
use std::sync::Arc;
use tracing::debug;

use super::counter::Verdict;
use super::identity::{ClientIdentifier, ClientKey, CompositeKey};
use super::policy::{Policy, PolicyRegistry};
use super::store::CounterStore;
use crate::error::Result;

/// The result of one admission check, with everything needed to build quota headers.
#[derive(Debug, Clone)]
pub struct Admission {
    /// Who was checked
    pub client: ClientKey,
    /// The operation class that was checked
    pub class: String,
    /// The policy that applied
    pub policy: Arc<Policy>,
    /// The store's verdict
    pub verdict: Verdict,
}

impl Admission {
    pub fn allowed(&self) -> bool {
        self.verdict.allowed
    }
}

/// Combines the policy registry, the caller identifier and the counter store.
///
/// Holds no state of its own; safe to share across tasks.
pub struct AdmissionEngine {
    registry: Arc<PolicyRegistry>,
    identifier: ClientIdentifier,
    store: Arc<dyn CounterStore>,
}

impl AdmissionEngine {
    pub fn new(
        registry: Arc<PolicyRegistry>,
        identifier: ClientIdentifier,
        store: Arc<dyn CounterStore>,
    ) -> Self {
        Self {
            registry,
            identifier,
            store,
        }
    }

    /// Identify the caller of a request and check it against `class`.
    pub async fn decide(
        &self,
        request: &Parts,
        class: &str,
        user_id: Option<&str>,
    ) -> Result<Admission> {
        let client = self.identifier.identify_parts(request, user_id);
        self.decide_for(client, class).await
    }

    /// Check an already identified client against `class`.
    pub async fn decide_for(&self, client: ClientKey, class: &str) -> Result<Admission> {
        let policy = self.registry.policy_for(class)?;
        let key = CompositeKey::new(client, class);
        let verdict = self.store.check_and_increment(&key, &policy).await?;

        debug!(
            key = %key,
            allowed = verdict.allowed,
            remaining = verdict.remaining,
            "Admission decided"
        );

        Ok(Admission {
            client: key.client,
            class: key.class,
            policy,
            verdict,
        })
    }

    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    pub fn identifier(&self) -> &ClientIdentifier {
        &self.identifier
    }
}
