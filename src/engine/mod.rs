//! The cache engine contract (spec §4.3): one storage, one rule-set
//! group, one pending-set, in two concurrency shapes that share an
//! identical operation set.
//!
//! Per §9's design note ("avoid deep inheritance — compose a single
//! `CacheEngine` struct with an enum discriminant"), [`CacheEngine`] is a
//! single public type wrapping an enum of the two concrete shapes rather
//! than a trait object or an inheritance hierarchy — callers (the
//! session filter) write against one type regardless of which shape a
//! deployment chose via the `cached_data` config option (§6).

pub mod partitioned;
pub mod pending;
pub mod shared;

pub use partitioned::{default_worker_count, PartitionedEngine, StorageFactory, WorkerId};
pub use pending::SessionId;
pub use shared::{InfoScope, SharedEngine, Token};

use crate::key::CacheKey;
use crate::rules::RuleSet;
use crate::storage::{CacheResult, GetFlags, Storage};
use std::sync::Arc;
use std::time::Duration;

/// A worker identity a session carries, used only by the
/// [`CacheEngine::Partitioned`] shape (ignored by `Shared`).
pub const NO_WORKER: WorkerId = 0;

pub enum CacheEngine {
    Shared(SharedEngine),
    Partitioned(PartitionedEngine),
}

impl CacheEngine {
    pub fn shared(storage: Arc<dyn Storage>, rules: Vec<RuleSet>) -> Self {
        CacheEngine::Shared(SharedEngine::new(storage, rules))
    }

    pub fn partitioned(factory: Arc<StorageFactory>, rules: Vec<RuleSet>) -> Self {
        CacheEngine::Partitioned(PartitionedEngine::new(factory, rules))
    }

    pub fn get_key(&self, user: &str, host: &str, default_db: &str, query: &[u8]) -> CacheKey {
        match self {
            CacheEngine::Shared(e) => e.get_key(user, host, default_db, query),
            CacheEngine::Partitioned(e) => e.get_key(user, host, default_db, query),
        }
    }

    pub fn should_store(&self, worker: WorkerId, default_db: &str, query: &str) -> Option<RuleSet> {
        match self {
            CacheEngine::Shared(e) => e.should_store(default_db, query),
            CacheEngine::Partitioned(e) => e.should_store(worker, default_db, query),
        }
    }

    pub async fn get_value(
        &self,
        worker: WorkerId,
        token: Token,
        key: &CacheKey,
        flags: GetFlags,
        soft_ttl: Option<Duration>,
        hard_ttl: Option<Duration>,
    ) -> (CacheResult, Option<Vec<u8>>) {
        match self {
            CacheEngine::Shared(e) => e.get_value(token, key, flags, soft_ttl, hard_ttl).await,
            CacheEngine::Partitioned(e) => {
                e.get_value(worker, token, key, flags, soft_ttl, hard_ttl).await
            }
        }
    }

    pub async fn put_value(
        &self,
        worker: WorkerId,
        token: Token,
        key: &CacheKey,
        invalidation_words: &[String],
        value: &[u8],
    ) -> CacheResult {
        match self {
            CacheEngine::Shared(e) => e.put_value(token, key, invalidation_words, value).await,
            CacheEngine::Partitioned(e) => {
                e.put_value(worker, token, key, invalidation_words, value).await
            }
        }
    }

    pub async fn del_value(&self, worker: WorkerId, token: Token, key: &CacheKey) -> CacheResult {
        match self {
            CacheEngine::Shared(e) => e.del_value(token, key).await,
            CacheEngine::Partitioned(e) => e.del_value(worker, token, key).await,
        }
    }

    pub async fn invalidate(&self, worker: WorkerId, token: Token, words: &[String]) -> CacheResult {
        match self {
            CacheEngine::Shared(e) => e.invalidate(token, words).await,
            CacheEngine::Partitioned(e) => e.invalidate(worker, token, words).await,
        }
    }

    pub async fn clear(&self, worker: WorkerId, token: Token) -> CacheResult {
        match self {
            CacheEngine::Shared(e) => e.clear(token).await,
            CacheEngine::Partitioned(e) => e.clear(worker, token).await,
        }
    }

    pub fn must_refresh(&self, worker: WorkerId, key: &CacheKey, session: SessionId) -> bool {
        match self {
            CacheEngine::Shared(e) => e.must_refresh(key, session),
            CacheEngine::Partitioned(e) => e.must_refresh(worker, key, session),
        }
    }

    pub fn refreshed(&self, worker: WorkerId, key: &CacheKey, session: SessionId) {
        match self {
            CacheEngine::Shared(e) => e.refreshed(key, session),
            CacheEngine::Partitioned(e) => e.refreshed(worker, key, session),
        }
    }

    pub fn set_all_rules(&self, rules: Vec<RuleSet>) {
        match self {
            CacheEngine::Shared(e) => e.set_all_rules(rules),
            CacheEngine::Partitioned(e) => e.set_all_rules(rules),
        }
    }

    pub async fn info(&self, scope: InfoScope) -> serde_json::Value {
        match self {
            CacheEngine::Shared(e) => e.info(scope).await,
            CacheEngine::Partitioned(e) => e.get_info(scope).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::inmemory::InMemoryStorage;
    use crate::storage::StorageConfig;
    use uuid::Uuid;

    fn shared_engine() -> CacheEngine {
        let clock = Arc::new(ManualClock::new());
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new(StorageConfig::default(), clock));
        CacheEngine::shared(storage, vec![RuleSet::empty()])
    }

    #[tokio::test]
    async fn dispatches_through_the_shared_shape() {
        let engine = shared_engine();
        let key = engine.get_key("u", "h", "db", b"SELECT 1");
        engine.put_value(NO_WORKER, Token::null(), &key, &[], b"v").await;
        let (r, v) = engine.get_value(NO_WORKER, Token::null(), &key, GetFlags::default(), None, None).await;
        assert!(r.is_ok());
        assert_eq!(v.unwrap(), b"v");
    }

    #[tokio::test]
    async fn refresh_election_is_exclusive_across_the_dispatch_wrapper() {
        let engine = shared_engine();
        let key = engine.get_key("u", "h", "db", b"SELECT 1");
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();
        assert!(engine.must_refresh(NO_WORKER, &key, s1));
        assert!(!engine.must_refresh(NO_WORKER, &key, s2));
        engine.refreshed(NO_WORKER, &key, s1);
        assert!(engine.must_refresh(NO_WORKER, &key, s2));
    }
}
