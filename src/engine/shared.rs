//! The shared (multi-threaded) cache engine (spec §4.3).
//!
//! One storage, one rule-set group, one pending-set, reachable
//! concurrently from every session on every worker. `rules` and `pending`
//! each get their own `parking_lot::Mutex` (spec §5: "mutex `pending_lock`
//! protects the stale-refresh pending-set; mutex `rules_lock` protects the
//! rule-set pointer"); the storage beneath is responsible for its own
//! synchronisation (it may itself be a single-threaded raw storage
//! wrapped by a multi-threaded [`crate::lru::LruStorage`], which supplies
//! that synchronisation — spec §4.4: "The raw storage beneath a
//! multi-threaded wrapper may be single-threaded since the wrapper fully
//! serialises access").
//!
//! This same type is also what the [`super::partitioned::PartitionedEngine`]
//! lazily constructs, one per worker, as its private single-threaded
//! child cache — see that module's docs for why no second implementation
//! is needed.

use crate::engine::pending::{PendingSet, SessionId};
use crate::key::CacheKey;
use crate::rules::RuleSet;
use crate::storage::{CacheResult, GetFlags, Storage};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Per-caller storage multiplexing handle (spec §4.3 "Tokens"). This
/// crate's storages (§4.5/§4.6) each own a single multiplexed connection
/// internally rather than one handle per session — a deliberate
/// simplification recorded in `DESIGN.md` — so `Token` is currently
/// inert at the storage layer and exists to keep the engine's public
/// contract shaped the way the spec describes it, ready for a storage
/// that does need per-session state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Token(pub Option<u64>);

impl Token {
    pub fn null() -> Self {
        Token(None)
    }
}

/// Bitmask for [`SharedEngine::info`] (SPEC_FULL §E, recovered from
/// `Cache::what_info_t` in `original_source/.../cache.hh`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoScope(pub u32);

impl InfoScope {
    pub const RULES: InfoScope = InfoScope(0x01);
    pub const PENDING: InfoScope = InfoScope(0x02);
    pub const STORAGE: InfoScope = InfoScope(0x04);
    pub const ALL: InfoScope = InfoScope(0x01 | 0x02 | 0x04);

    pub fn has(&self, bit: InfoScope) -> bool {
        self.0 & bit.0 != 0
    }
}

pub struct SharedEngine {
    storage: Arc<dyn Storage>,
    rules: Mutex<Arc<Vec<RuleSet>>>,
    pending: PendingSet,
}

impl SharedEngine {
    pub fn new(storage: Arc<dyn Storage>, rules: Vec<RuleSet>) -> Self {
        SharedEngine { storage, rules: Mutex::new(Arc::new(rules)), pending: PendingSet::new() }
    }

    pub fn get_key(&self, user: &str, host: &str, default_db: &str, query: &[u8]) -> CacheKey {
        CacheKey::new(user, host, default_db, query)
    }

    /// Returns a clone of the first rule-set group whose store-rules
    /// match this query, or `None` if no group in the configured list
    /// would store it (spec §4.2: "Multiple rule-sets may be grouped;
    /// the first matching one is selected per request.").
    pub fn should_store(&self, default_db: &str, query: &str) -> Option<RuleSet> {
        let rules = self.rules.lock().clone();
        rules.iter().find(|rs| rs.should_store(default_db, query)).cloned()
    }

    pub async fn get_value(
        &self,
        _token: Token,
        key: &CacheKey,
        flags: GetFlags,
        soft_ttl: Option<Duration>,
        hard_ttl: Option<Duration>,
    ) -> (CacheResult, Option<Vec<u8>>) {
        self.storage.get_value(key, flags, soft_ttl, hard_ttl).await
    }

    pub async fn put_value(
        &self,
        _token: Token,
        key: &CacheKey,
        invalidation_words: &[String],
        value: &[u8],
    ) -> CacheResult {
        self.storage.put_value(key, value, invalidation_words).await
    }

    pub async fn del_value(&self, _token: Token, key: &CacheKey) -> CacheResult {
        self.storage.del_value(key).await
    }

    pub async fn invalidate(&self, _token: Token, words: &[String]) -> CacheResult {
        self.storage.invalidate(words).await
    }

    pub async fn clear(&self, _token: Token) -> CacheResult {
        self.storage.clear().await
    }

    pub fn must_refresh(&self, key: &CacheKey, session: SessionId) -> bool {
        self.pending.must_refresh(key, session)
    }

    pub fn refreshed(&self, key: &CacheKey, session: SessionId) {
        self.pending.refreshed(key, session)
    }

    /// Atomically swaps in a new rule-set group (spec §9: "runtime rule
    /// reloads atomically swap the owning pointer").
    pub fn set_all_rules(&self, rules: Vec<RuleSet>) {
        *self.rules.lock() = Arc::new(rules);
    }

    pub fn rules_snapshot(&self) -> Arc<Vec<RuleSet>> {
        self.rules.lock().clone()
    }

    pub async fn info(&self, scope: InfoScope) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        if scope.has(InfoScope::RULES) {
            let rules = self.rules.lock().clone();
            out.insert(
                "rules".to_string(),
                json!(rules
                    .iter()
                    .map(|r| json!({"store_rules": r.store_rule_count(), "use_rules": r.use_rule_count()}))
                    .collect::<Vec<_>>()),
            );
        }
        if scope.has(InfoScope::PENDING) {
            out.insert("pending".to_string(), json!(self.pending.len()));
        }
        if scope.has(InfoScope::STORAGE) {
            let (_, size) = self.storage.size().await;
            let (_, items) = self.storage.item_count().await;
            out.insert("storage".to_string(), json!({"size": size, "items": items}));
        }
        serde_json::Value::Object(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::inmemory::InMemoryStorage;
    use crate::storage::StorageConfig;

    fn engine() -> SharedEngine {
        let clock = Arc::new(ManualClock::new());
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new(StorageConfig::default(), clock));
        SharedEngine::new(storage, vec![RuleSet::empty()])
    }

    #[tokio::test]
    async fn basic_put_then_get_hits() {
        let e = engine();
        let key = e.get_key("u", "h", "db", b"SELECT 1");
        e.put_value(Token::null(), &key, &[], b"result").await;
        let (r, v) = e.get_value(Token::null(), &key, GetFlags::default(), None, None).await;
        assert!(r.is_ok());
        assert_eq!(v.unwrap(), b"result");
    }

    #[test]
    fn key_generation_is_deterministic() {
        let e = engine();
        let k1 = e.get_key("u", "h", "db", b"SELECT 1");
        let k2 = e.get_key("u", "h", "db", b"SELECT 1");
        assert_eq!(k1, k2);
    }

    #[test]
    fn should_store_selects_first_matching_group() {
        let group_a =
            RuleSet::parse(r#"{"store": [{"attribute": "table", "op": "=", "value": "orders"}]}"#).unwrap();
        let group_b = RuleSet::empty();
        let clock = Arc::new(ManualClock::new());
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new(StorageConfig::default(), clock));
        let e = SharedEngine::new(storage, vec![group_a, group_b]);

        assert!(e.should_store("db", "SELECT * FROM orders").is_some());
        // Falls through to the permissive second group for anything else.
        assert!(e.should_store("db", "SELECT * FROM customers").is_some());
    }
}
