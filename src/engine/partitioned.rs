//! The partitioned (per-worker) cache engine (spec §4.3).
//!
//! Owns no storage itself. Each worker gets its own private
//! [`SharedEngine`] child, constructed lazily on first use from that
//! worker and never touched by any other worker (spec invariant: "each
//! worker only ever reads or writes its own child cache" — testable
//! property 10). Rule updates broadcast to every existing child and seed
//! every future one; `get_info` fans out across children and joins the
//! results keyed by worker index.
//!
//! A worker is identified by a plain `usize` the session supplies (its
//! host-assigned worker slot — worker/thread-pool infrastructure is out
//! of this crate's scope per spec §1) rather than this crate inferring
//! "the current worker" via thread-locals; that keeps the type testable
//! from a single thread while preserving the one-child-per-worker
//! invariant, since nothing stops the caller from reusing a `WorkerId`
//! that doesn't correspond to a dedicated OS thread.

use crate::engine::pending::SessionId;
use crate::engine::shared::{InfoScope, SharedEngine, Token};
use crate::key::CacheKey;
use crate::rules::RuleSet;
use crate::storage::{CacheResult, GetFlags, Storage};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

pub type WorkerId = usize;

/// Constructs a fresh, private storage instance for a newly-seen worker.
pub type StorageFactory = dyn Fn() -> Arc<dyn Storage> + Send + Sync;

/// A sizing hint for a host choosing how many `WorkerId`s it will ever
/// hand this engine — one child cache per worker, so oversizing wastes
/// memory and undersizing defeats the point of partitioning. The crate
/// itself never spawns workers (§1), so this is advisory only.
pub fn default_worker_count() -> usize {
    num_cpus::get()
}

pub struct PartitionedEngine {
    children: DashMap<WorkerId, Arc<SharedEngine>>,
    factory: Arc<StorageFactory>,
    rules: parking_lot::Mutex<Arc<Vec<RuleSet>>>,
}

impl PartitionedEngine {
    pub fn new(factory: Arc<StorageFactory>, rules: Vec<RuleSet>) -> Self {
        PartitionedEngine {
            children: DashMap::new(),
            factory,
            rules: parking_lot::Mutex::new(Arc::new(rules)),
        }
    }

    fn child(&self, worker: WorkerId) -> Arc<SharedEngine> {
        self.children
            .entry(worker)
            .or_insert_with(|| {
                let rules = (*self.rules.lock()).as_ref().clone();
                let storage = (self.factory)();
                Arc::new(SharedEngine::new(storage, rules))
            })
            .clone()
    }

    pub fn get_key(&self, user: &str, host: &str, default_db: &str, query: &[u8]) -> CacheKey {
        CacheKey::new(user, host, default_db, query)
    }

    pub fn should_store(&self, worker: WorkerId, default_db: &str, query: &str) -> Option<RuleSet> {
        self.child(worker).should_store(default_db, query)
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
        self.child(worker).get_value(token, key, flags, soft_ttl, hard_ttl).await
    }

    pub async fn put_value(
        &self,
        worker: WorkerId,
        token: Token,
        key: &CacheKey,
        invalidation_words: &[String],
        value: &[u8],
    ) -> CacheResult {
        self.child(worker).put_value(token, key, invalidation_words, value).await
    }

    pub async fn del_value(&self, worker: WorkerId, token: Token, key: &CacheKey) -> CacheResult {
        self.child(worker).del_value(token, key).await
    }

    pub async fn invalidate(&self, worker: WorkerId, token: Token, words: &[String]) -> CacheResult {
        self.child(worker).invalidate(token, words).await
    }

    pub async fn clear(&self, worker: WorkerId, token: Token) -> CacheResult {
        self.child(worker).clear(token).await
    }

    pub fn must_refresh(&self, worker: WorkerId, key: &CacheKey, session: SessionId) -> bool {
        self.child(worker).must_refresh(key, session)
    }

    pub fn refreshed(&self, worker: WorkerId, key: &CacheKey, session: SessionId) {
        self.child(worker).refreshed(key, session)
    }

    /// Broadcasts a new rule pointer to every already-constructed child
    /// and stores it as the seed for children constructed later (spec
    /// §4.3: "`set_all_rules` broadcasts the new rule pointer to every
    /// worker").
    pub fn set_all_rules(&self, rules: Vec<RuleSet>) {
        let shared = Arc::new(rules);
        *self.rules.lock() = shared.clone();
        for child in self.children.iter() {
            child.value().set_all_rules((*shared).clone());
        }
    }

    /// Fans out `info` across every constructed child and joins the
    /// results keyed by worker index, using a channel the way the
    /// teacher's `crossbeam`-based fan-out/join primitives do.
    pub async fn get_info(&self, scope: InfoScope) -> serde_json::Value {
        let (tx, rx) = crossbeam::channel::unbounded();
        let workers: Vec<(WorkerId, Arc<SharedEngine>)> =
            self.children.iter().map(|e| (*e.key(), e.value().clone())).collect();

        let mut tasks = Vec::with_capacity(workers.len());
        for (worker, child) in workers {
            let tx = tx.clone();
            tasks.push(tokio::spawn(async move {
                let info = child.info(scope).await;
                let _ = tx.send((worker, info));
            }));
        }
        drop(tx);
        for t in tasks {
            let _ = t.await;
        }

        let mut by_worker = serde_json::Map::new();
        while let Ok((worker, info)) = rx.try_recv() {
            by_worker.insert(worker.to_string(), info);
        }
        serde_json::Value::Object(by_worker)
    }

    pub fn worker_count(&self) -> usize {
        self.children.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::inmemory::InMemoryStorage;
    use crate::storage::StorageConfig;

    fn engine() -> PartitionedEngine {
        let factory: Arc<StorageFactory> = Arc::new(|| {
            let clock = Arc::new(ManualClock::new());
            Arc::new(InMemoryStorage::new(StorageConfig::default(), clock)) as Arc<dyn Storage>
        });
        PartitionedEngine::new(factory, vec![RuleSet::empty()])
    }

    #[tokio::test]
    async fn writes_on_one_worker_are_invisible_to_another() {
        let e = engine();
        let key = e.get_key("u", "h", "db", b"SELECT 1");
        e.put_value(0, Token::null(), &key, &[], b"from worker 0").await;

        let (r0, v0) = e.get_value(0, Token::null(), &key, GetFlags::default(), None, None).await;
        assert!(r0.is_ok());
        assert_eq!(v0.unwrap(), b"from worker 0");

        let (r1, _) = e.get_value(1, Token::null(), &key, GetFlags::default(), None, None).await;
        assert!(r1.is_not_found(), "worker 1's child cache must not see worker 0's entry");
        assert_eq!(e.worker_count(), 2);
    }

    #[tokio::test]
    async fn rule_updates_broadcast_to_existing_children() {
        let e = engine();
        let key = e.get_key("u", "h", "db", b"SELECT 1");
        // Touch worker 0 so its child cache exists.
        e.put_value(0, Token::null(), &key, &[], b"v").await;

        let restrictive =
            RuleSet::parse(r#"{"store": [{"attribute": "table", "op": "=", "value": "orders"}]}"#).unwrap();
        e.set_all_rules(vec![restrictive]);

        assert!(e.should_store(0, "db", "SELECT * FROM orders").is_some());
        assert!(e.should_store(0, "db", "SELECT * FROM customers").is_none());
        // A worker seen for the first time after the update also picks up
        // the new rules (seeded at construction time, not the stale default).
        assert!(e.should_store(7, "db", "SELECT * FROM customers").is_none());
    }
}
