//! Rate limit counter state and the verdicts computed from it.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::policy::Policy;

/// The per-key counter for one fixed window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterEntry {
    /// Requests admitted in the current window
    pub count: u64,
    /// When the current window ends
    pub reset_at: DateTime<Utc>,
}

impl CounterEntry {
    /// A fresh window starting at `now`.
    pub fn fresh(now: DateTime<Utc>, policy: &Policy) -> Self {
        Self {
            count: 0,
            reset_at: window_end(now, policy),
        }
    }

    /// An entry is logically expired once its window has ended, whatever its count.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.reset_at
    }

    /// Start a new window if the current one has ended.
    pub fn rearm_if_expired(&mut self, now: DateTime<Utc>, policy: &Policy) {
        if self.is_expired(now) {
            *self = Self::fresh(now, policy);
        }
    }

    /// Admit one request if the window still has quota.
    ///
    /// Returns `true` if the request was counted, `false` if over limit.
    /// The count never moves past `max_requests`.
    pub fn try_admit(&mut self, policy: &Policy) -> bool {
        if self.count < policy.max_requests {
            self.count += 1;
            true
        } else {
            false
        }
    }

    pub fn remaining(&self, policy: &Policy) -> u64 {
        policy.max_requests.saturating_sub(self.count)
    }
}

fn window_end(now: DateTime<Utc>, policy: &Policy) -> DateTime<Utc> {
    now.checked_add_signed(policy.window_delta())
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// The outcome of one check-and-increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    /// Whether the request is admitted
    pub allowed: bool,
    /// The policy limit
    pub limit: u64,
    /// Requests left in the window after this one
    pub remaining: u64,
    /// When the window ends
    pub reset_at: DateTime<Utc>,
}

impl Verdict {
    /// Whole seconds until the window resets, rounded up and never below one.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.reset_at - now).num_milliseconds().max(0) as u64;
        millis.div_ceil(1000).max(1)
    }
}

/// A read-only projection of a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaStatus {
    pub count: u64,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

impl QuotaStatus {
    /// Project an existing entry, treating an expired one as a fresh window.
    pub fn project(entry: Option<&CounterEntry>, policy: &Policy, now: DateTime<Utc>) -> Self {
        match entry {
            Some(entry) if !entry.is_expired(now) => Self {
                count: entry.count,
                limit: policy.max_requests,
                remaining: entry.remaining(policy),
                reset_at: entry.reset_at,
            },
            _ => Self {
                count: 0,
                limit: policy.max_requests,
                remaining: policy.max_requests,
                reset_at: window_end(now, policy),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    fn policy(max: u64) -> Policy {
        Policy::new(max, Duration::from_secs(60), "slow down")
    }

    #[test]
    fn test_fresh_entry() {
        let now = Utc::now();
        let entry = CounterEntry::fresh(now, &policy(3));
        assert_eq!(entry.count, 0);
        assert_eq!(entry.reset_at, now + ChronoDuration::seconds(60));
        assert!(!entry.is_expired(now));
        assert!(entry.is_expired(now + ChronoDuration::seconds(60)));
    }

    #[test]
    fn test_admit_within_limit() {
        let now = Utc::now();
        let policy = policy(10);
        let mut entry = CounterEntry::fresh(now, &policy);

        assert!(entry.try_admit(&policy));
        assert_eq!(entry.count, 1);
        assert_eq!(entry.remaining(&policy), 9);
    }

    #[test]
    fn test_admit_exceeds_limit_without_counting() {
        let now = Utc::now();
        let policy = policy(5);
        let mut entry = CounterEntry::fresh(now, &policy);

        for _ in 0..5 {
            assert!(entry.try_admit(&policy));
        }

        // The 6th request should be rejected and leave the count alone
        assert!(!entry.try_admit(&policy));
        assert_eq!(entry.count, 5);
        assert_eq!(entry.remaining(&policy), 0);
    }

    #[test]
    fn test_rearm_after_expiry() {
        let now = Utc::now();
        let policy = policy(2);
        let mut entry = CounterEntry::fresh(now, &policy);
        entry.try_admit(&policy);
        entry.try_admit(&policy);

        let later = now + ChronoDuration::seconds(61);
        entry.rearm_if_expired(later, &policy);
        assert_eq!(entry.count, 0);
        assert_eq!(entry.reset_at, later + ChronoDuration::seconds(60));
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let now = Utc::now();
        let verdict = Verdict {
            allowed: false,
            limit: 3,
            remaining: 0,
            reset_at: now + ChronoDuration::milliseconds(1500),
        };
        assert_eq!(verdict.retry_after_secs(now), 2);
        assert_eq!(verdict.retry_after_secs(now + ChronoDuration::seconds(10)), 1);
    }

    #[test]
    fn test_status_projection_of_expired_entry() {
        let now = Utc::now();
        let policy = policy(4);
        let mut entry = CounterEntry::fresh(now, &policy);
        entry.try_admit(&policy);

        let live = QuotaStatus::project(Some(&entry), &policy, now);
        assert_eq!((live.count, live.remaining), (1, 3));

        let later = now + ChronoDuration::seconds(120);
        let expired = QuotaStatus::project(Some(&entry), &policy, later);
        assert_eq!((expired.count, expired.remaining), (0, 4));

        let missing = QuotaStatus::project(None, &policy, now);
        assert_eq!((missing.count, missing.limit, missing.remaining), (0, 4, 4));
    }
}
