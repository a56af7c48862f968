//! Rate limiting logic and state management.

mod admin;
mod counter;
mod engine;
mod identity;
mod policy;
mod reaper;
mod store;

pub use admin::{ClassStatus, RateLimitAdmin};
pub use counter::{CounterEntry, QuotaStatus, Verdict};
pub use engine::{Admission, AdmissionEngine};
pub use identity::{ClientIdentifier, ClientKey, CompositeKey};
pub use policy::{class, spawn_policy_reloader, Policy, PolicyRegistry, PolicyRule, PolicyTable, TimeUnit};
pub use reaper::{join_background_task, Reaper, MIN_REAP_INTERVAL};
pub use store::{CounterStore, MemoryStore};
