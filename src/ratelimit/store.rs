//! Counter storage.
//!
//! [`CounterStore`] is the contract any backend must satisfy; [`MemoryStore`]
//! is the single-process implementation. Within one composite key,
//! `check_and_increment` is linearizable: the n-th admitted request observes
//! exactly n-1 earlier admissions, and no more than `max_requests` are admitted
//! per window.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, trace};

use super::counter::{CounterEntry, QuotaStatus, Verdict};
use super::identity::{ClientKey, CompositeKey};
use super::policy::Policy;
use crate::error::Result;

/// Removals between scheduler yields while reaping.
const REAP_YIELD_EVERY: usize = 64;

/// Trait for counter store implementations.
///
/// This trait abstracts over the in-process `MemoryStore` and any shared
/// backend so the admission engine can work with either.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically test the window for `key` and count the request if it fits.
    async fn check_and_increment(&self, key: &CompositeKey, policy: &Policy) -> Result<Verdict>;

    /// Read the quota for `key` without creating or changing anything.
    async fn status_of(&self, key: &CompositeKey, policy: &Policy) -> Result<QuotaStatus>;

    /// Delete counters for a client: one class, or every class when `class` is `None`.
    ///
    /// Returns the number of counters removed.
    async fn reset(&self, client: &ClientKey, class: Option<&str>) -> Result<usize>;

    /// Delete every counter whose window has ended. Returns the number removed.
    async fn reap_expired(&self) -> Result<usize>;

    /// Number of live counter entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory counter store.
///
/// Each `DashMap` shard is guarded by its own lock; holding the entry guard for
/// a key serializes every check on that key.
#[derive(Debug, Default)]
pub struct MemoryStore {
    counters: DashMap<CompositeKey, CounterEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// [`CounterStore::check_and_increment`] at an explicit time.
    pub fn check_and_increment_at(
        &self,
        key: &CompositeKey,
        policy: &Policy,
        now: DateTime<Utc>,
    ) -> Verdict {
        let mut entry = self
            .counters
            .entry(key.clone())
            .or_insert_with(|| CounterEntry::fresh(now, policy));

        entry.rearm_if_expired(now, policy);
        let allowed = entry.try_admit(policy);

        trace!(
            key = %key,
            count = entry.count,
            allowed = allowed,
            "Checked counter"
        );

        Verdict {
            allowed,
            limit: policy.max_requests,
            remaining: entry.remaining(policy),
            reset_at: entry.reset_at,
        }
    }

    /// [`CounterStore::status_of`] at an explicit time.
    pub fn status_at(&self, key: &CompositeKey, policy: &Policy, now: DateTime<Utc>) -> QuotaStatus {
        let entry = self.counters.get(key);
        QuotaStatus::project(entry.as_deref(), policy, now)
    }

    /// Remove expired counters as of `now`.
    ///
    /// Runs in two phases. The scan visits one shard at a time under that
    /// shard's read lock, so a writer on the same shard waits for at most one
    /// shard scan (about `len / shard_count` entries), never the whole map.
    /// Removals then take the write lock for one entry each and yield every
    /// few removals. `remove_if` re-checks expiry, so a counter re-armed
    /// between the phases survives.
    pub async fn reap_expired_at(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<CompositeKey> = self
            .counters
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for (i, key) in expired.iter().enumerate() {
            if self
                .counters
                .remove_if(key, |_, entry| entry.is_expired(now))
                .is_some()
            {
                removed += 1;
            }
            if (i + 1) % REAP_YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }
        }
        removed
    }

    fn reset_client(&self, client: &ClientKey, class: Option<&str>) -> usize {
        match class {
            Some(class) => {
                let key = CompositeKey::new(client.clone(), class);
                usize::from(self.counters.remove(&key).is_some())
            }
            None => {
                let keys: Vec<CompositeKey> = self
                    .counters
                    .iter()
                    .filter(|entry| &entry.key().client == client)
                    .map(|entry| entry.key().clone())
                    .collect();
                keys.iter()
                    .filter(|key| self.counters.remove(*key).is_some())
                    .count()
            }
        }
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn check_and_increment(&self, key: &CompositeKey, policy: &Policy) -> Result<Verdict> {
        Ok(self.check_and_increment_at(key, policy, Utc::now()))
    }

    async fn status_of(&self, key: &CompositeKey, policy: &Policy) -> Result<QuotaStatus> {
        Ok(self.status_at(key, policy, Utc::now()))
    }

    async fn reset(&self, client: &ClientKey, class: Option<&str>) -> Result<usize> {
        let removed = self.reset_client(client, class);
        debug!(
            client = %client,
            class = class.unwrap_or("*"),
            removed = removed,
            "Reset counters"
        );
        Ok(removed)
    }

    async fn reap_expired(&self) -> Result<usize> {
        Ok(self.reap_expired_at(Utc::now()).await)
    }

    fn len(&self) -> usize {
        self.counters.len()
    }
}
