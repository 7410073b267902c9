//! The stale-refresh pending-set (spec §4.3 "Pending set", §4.8).
//!
//! At most one session may be the designated refresher for a given
//! [`CacheKey`] at a time: the first session to call [`PendingSet::must_refresh`]
//! for a key wins and is obligated to eventually call
//! [`PendingSet::refreshed`]; every other session sees `false` until then
//! and is served the stale value directly (spec §4.7, §4.8, testable
//! property 2).

use crate::key::CacheKey;
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

/// Identifies the session currently holding the refresher slot for a key.
pub type SessionId = Uuid;

#[derive(Default)]
pub struct PendingSet {
    inner: Mutex<HashMap<CacheKey, SessionId>>,
}

impl PendingSet {
    pub fn new() -> Self {
        PendingSet::default()
    }

    /// Returns `true` iff `session` becomes the designated refresher for
    /// `key` — i.e. no other session currently holds that slot.
    pub fn must_refresh(&self, key: &CacheKey, session: SessionId) -> bool {
        let mut inner = self.inner.lock();
        if inner.contains_key(key) {
            false
        } else {
            inner.insert(key.clone(), session);
            true
        }
    }

    /// Releases the refresher slot for `key`. No-op unless `session` is
    /// the session that currently holds it (the precondition in spec
    /// §4.3: "the session must be the designated refresher").
    pub fn refreshed(&self, key: &CacheKey, session: SessionId) {
        let mut inner = self.inner.lock();
        if inner.get(key) == Some(&session) {
            inner.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_first_caller_becomes_refresher() {
        let pending = PendingSet::new();
        let key = CacheKey::new("u", "h", "db", b"SELECT 1");
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();

        assert!(pending.must_refresh(&key, s1));
        assert!(!pending.must_refresh(&key, s2));
        assert!(!pending.must_refresh(&key, s1), "re-calling the winner does not re-grant it");

        pending.refreshed(&key, s1);
        assert!(pending.is_empty());
        assert!(pending.must_refresh(&key, s2), "slot is free again after refreshed()");
    }

    #[test]
    fn refreshed_by_non_owner_is_a_no_op() {
        let pending = PendingSet::new();
        let key = CacheKey::new("u", "h", "db", b"SELECT 1");
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();

        assert!(pending.must_refresh(&key, s1));
        pending.refreshed(&key, s2);
        assert!(!pending.must_refresh(&key, s2), "slot still held by s1");
    }
}
