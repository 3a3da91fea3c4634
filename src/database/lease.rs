//! # Leases
//!
//! One lease discipline shared by the task queue, cron jobs and the
//! per-scope client claims used for idempotent hunt fan-out.
//!
//! A lease is a time-bounded, exclusive claim: `leased_by` names the holder,
//! `leased_until` bounds it. An item whose `leased_until` lies in the past is
//! free again for anyone. Acquisition is compare-and-swap: it only succeeds
//! when the item is free at `now`, so two callers serialised by the store's
//! atomicity (a row lock or a critical section) can never both win.

use chrono::{DateTime, Duration, Utc};

/// Anything carrying `leased_by` / `leased_until` fields.
pub trait Leasable {
    fn leased_by(&self) -> Option<&str>;
    fn leased_until(&self) -> Option<DateTime<Utc>>;
    fn set_lease(&mut self, leased_by: Option<String>, leased_until: Option<DateTime<Utc>>);

    /// Whether a live lease exists at `now`
    fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.leased_until().is_some_and(|until| until > now)
    }

    fn is_leased_by(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.is_leased(now) && self.leased_by() == Some(owner)
    }

    /// Claim the item if it is free at `now`
    fn try_acquire(&mut self, owner: &str, now: DateTime<Utc>, duration: Duration) -> bool {
        if self.is_leased(now) {
            return false;
        }
        self.set_lease(Some(owner.to_string()), Some(now + duration));
        true
    }

    /// Push the expiry of a lease the caller still holds (heartbeat)
    fn extend(&mut self, owner: &str, now: DateTime<Utc>, duration: Duration) -> bool {
        if !self.is_leased_by(owner, now) {
            return false;
        }
        self.set_lease(Some(owner.to_string()), Some(now + duration));
        true
    }

    /// Drop a lease held by `owner`; leases of other holders are untouched
    fn release(&mut self, owner: &str) -> bool {
        if self.leased_by() != Some(owner) {
            return false;
        }
        self.set_lease(None, None);
        true
    }

    /// Drop any lease regardless of holder
    fn clear_lease(&mut self) {
        self.set_lease(None, None);
    }
}

/// Key of a never-expiring claim: a client may be claimed once per scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClaimKey {
    pub scope: String,
    pub client_id: String,
}

impl ClaimKey {
    pub fn new(scope: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            client_id: client_id.into(),
        }
    }
}
