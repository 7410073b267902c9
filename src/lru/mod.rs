//! The LRU eviction/invalidation wrapper (spec §4.4).
//!
//! Decorates a raw [`crate::storage::Storage`] that cannot, by itself,
//! provide eviction-by-size/count or invalidation-by-word. Selected at
//! construction time per the raw storage's advertised
//! [`crate::storage::Capabilities`] and the configured
//! [`crate::storage::InvalidationMode`]:
//!
//! - [`Invalidator::Null`] — invalidation was never requested; `invalidate`
//!   always fails with `OUT_OF_RESOURCES`.
//! - [`Invalidator::Full`] — invalidation requested, the raw storage can't
//!   do it itself; this wrapper keeps the full word -> node index and does
//!   the work (spec: "FullInvalidator").
//! - [`Invalidator::Delegated`] — invalidation requested and the raw
//!   storage natively supports it; the raw storage does the actual
//!   freeing, this wrapper only drops its own bookkeeping for the nodes
//!   that were removed (spec: "StorageInvalidator").
//!
//! The node/map/list structure is a classic index-based intrusive list
//! (a `Vec<Option<Node>>` slab plus a free list) rather than raw pointers,
//! so the whole wrapper stays safe code: `index` maps a [`CacheKey`] to a
//! slab slot, and `prev`/`next` thread the slots into a doubly linked
//! most-recently-used-first list. The single-threaded and multi-threaded
//! variants described in the spec are the same state machine behind the
//! same `parking_lot::Mutex` — per §9's design note ("Retain the
//! single-mutex design... consider sharded LRU only if measurement
//! warrants"), a single lock is the one code path; the "single-threaded"
//! placement (one LRU per partitioned-engine worker, spec §4.3) simply
//! never contends it.

use crate::key::CacheKey;
use crate::storage::{
    CacheResult, Capabilities, GetFlags, ResultCode, Storage, StorageConfig, StorageKind,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

type NodeId = usize;

struct Node {
    key: CacheKey,
    size: u64,
    words: Vec<String>,
    prev: Option<NodeId>,
    next: Option<NodeId>,
}

/// How a [`LruStorage::get`] touches recency order (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessApproach {
    /// Moves the found node to the front (most-recently-used).
    Get,
    /// Looks but does not reorder.
    Peek,
}

/// Which invalidation strategy a constructed [`LruStorage`] uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidator {
    Null,
    Full,
    Delegated,
}

fn choose_invalidator(config: &StorageConfig, raw_caps: Capabilities) -> Invalidator {
    use crate::storage::InvalidationMode;
    if config.invalidation == InvalidationMode::Never {
        Invalidator::Null
    } else if raw_caps.supports_invalidation {
        Invalidator::Delegated
    } else {
        Invalidator::Full
    }
}

/// Running counters exposed for `get_info`/monitoring (spec §3 LRU node,
/// SPEC_FULL §E).
#[derive(Debug, Default)]
pub struct LruCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub updates: AtomicU64,
    pub deletes: AtomicU64,
    pub evictions: AtomicU64,
    pub invalidations: AtomicU64,
    pub cleared: AtomicU64,
}

impl LruCounters {
    fn snapshot(&self) -> LruCountersSnapshot {
        LruCountersSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            cleared: self.cleared.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LruCountersSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub updates: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub cleared: u64,
}

struct LruState {
    slab: Vec<Option<Node>>,
    free: Vec<NodeId>,
    index: HashMap<CacheKey, NodeId>,
    word_index: HashMap<String, HashSet<NodeId>>,
    head: Option<NodeId>,
    tail: Option<NodeId>,
    size: u64,
}

impl LruState {
    fn new() -> Self {
        LruState {
            slab: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            word_index: HashMap::new(),
            head: None,
            tail: None,
            size: 0,
        }
    }

    fn items(&self) -> u64 {
        self.index.len() as u64
    }

    fn detach(&mut self, id: NodeId) {
        let (prev, next) = {
            let node = self.slab[id].as_ref().unwrap();
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.slab[p].as_mut().unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slab[n].as_mut().unwrap().prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, id: NodeId) {
        let old_head = self.head;
        {
            let node = self.slab[id].as_mut().unwrap();
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            self.slab[h].as_mut().unwrap().prev = Some(id);
        }
        self.head = Some(id);
        if self.tail.is_none() {
            self.tail = Some(id);
        }
    }

    fn move_to_front(&mut self, id: NodeId) {
        if self.head == Some(id) {
            return;
        }
        self.detach(id);
        self.push_front(id);
    }

    fn alloc(&mut self, key: CacheKey, size: u64, words: Vec<String>) -> NodeId {
        let node = Node { key: key.clone(), size, words, prev: None, next: None };
        let id = match self.free.pop() {
            Some(id) => {
                self.slab[id] = Some(node);
                id
            }
            None => {
                self.slab.push(Some(node));
                self.slab.len() - 1
            }
        };
        self.index.insert(key, id);
        self.size += size;
        self.push_front(id);
        id
    }

    /// Removes a node entirely: detaches it, drops it from `index` and the
    /// word index, frees its slab slot, and subtracts its size.
    fn remove_node(&mut self, id: NodeId) {
        self.detach(id);
        let node = self.slab[id].take().unwrap();
        self.index.remove(&node.key);
        self.size = self.size.saturating_sub(node.size);
        for word in &node.words {
            if let Some(set) = self.word_index.get_mut(word) {
                set.remove(&id);
                if set.is_empty() {
                    self.word_index.remove(word);
                }
            }
        }
        self.free.push(id);
    }

    fn index_words(&mut self, id: NodeId, words: &[String]) {
        for word in words {
            self.word_index.entry(word.clone()).or_default().insert(id);
        }
    }

    fn clear_all(&mut self) {
        self.slab.clear();
        self.free.clear();
        self.index.clear();
        self.word_index.clear();
        self.head = None;
        self.tail = None;
        self.size = 0;
    }
}

/// Decorates `S` with LRU eviction and/or word-based invalidation (spec
/// §4.4). Implements [`Storage`] itself so it can stand in anywhere a raw
/// storage could.
pub struct LruStorage<S> {
    raw: S,
    config: StorageConfig,
    invalidator: Invalidator,
    state: Mutex<LruState>,
    counters: LruCounters,
}

impl<S: Storage> LruStorage<S> {
    pub fn new(raw: S, config: StorageConfig, raw_caps: Capabilities) -> Self {
        let invalidator = choose_invalidator(&config, raw_caps);
        LruStorage {
            raw,
            config,
            invalidator,
            state: Mutex::new(LruState::new()),
            counters: LruCounters::default(),
        }
    }

    pub fn invalidator(&self) -> Invalidator {
        self.invalidator
    }

    pub fn counters(&self) -> LruCountersSnapshot {
        self.counters.snapshot()
    }

    pub fn raw(&self) -> &S {
        &self.raw
    }

    /// The general get operation (spec §4.4): `approach` controls whether
    /// a hit reorders the node to the front.
    pub async fn get(
        &self,
        key: &CacheKey,
        approach: AccessApproach,
        flags: GetFlags,
    ) -> (CacheResult, Option<Vec<u8>>) {
        let (result, value) = self
            .raw
            .get_value(key, flags, Some(self.config.soft_ttl), Some(self.config.hard_ttl))
            .await;

        if result.is_ok() {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            let mut state = self.state.lock();
            if let Some(&id) = state.index.get(key) {
                if approach == AccessApproach::Get {
                    state.move_to_front(id);
                }
            }
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            if result.is_not_found() && !result.stale {
                // Truly gone (discarded or never existed): drop bookkeeping.
                let mut state = self.state.lock();
                if let Some(&id) = state.index.get(key) {
                    state.remove_node(id);
                }
            }
        }

        (result, value)
    }

    fn evict_tail_one(&self, state: &mut LruState) -> Option<CacheKey> {
        let id = state.tail?;
        let key = state.slab[id].as_ref().unwrap().key.clone();
        state.remove_node(id);
        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        Some(key)
    }

    /// The general put operation (spec §4.4).
    pub async fn put(&self, key: &CacheKey, value: &[u8], words: &[String]) -> CacheResult {
        let value_size = value.len() as u64;

        if self.config.max_size != 0 && value_size > self.config.max_size {
            // The value alone can never fit: drop any stale prior entry so
            // it is not retained, then fail.
            self.del(key).await;
            return CacheResult::out_of_resources();
        }

        // Evict to make room before writing through, so the raw storage
        // never observes transient over-capacity. The key being put is
        // never itself evicted, even if it happens to sit at the tail.
        let mut evicted = Vec::new();
        {
            let mut state = self.state.lock();
            let existing_size = state.index.get(key).map(|&id| state.slab[id].as_ref().unwrap().size);
            let is_new = existing_size.is_none();

            if self.config.max_size != 0 {
                while state.size - existing_size.unwrap_or(0) + value_size > self.config.max_size {
                    match state.tail {
                        Some(id) if state.slab[id].as_ref().unwrap().key == *key => break,
                        Some(_) => match self.evict_tail_one(&mut state) {
                            Some(k) => evicted.push(k),
                            None => break,
                        },
                        None => break,
                    }
                }
            }

            if is_new && self.config.max_count != 0 && state.items() >= self.config.max_count {
                if let Some(k) = self.evict_tail_one(&mut state) {
                    evicted.push(k);
                }
            }
        }
        for k in &evicted {
            self.raw.del_value(k).await;
        }

        let result = self.raw.put_value(key, value, words).await;
        if result.is_ok() {
            let mut state = self.state.lock();
            if let Some(&id) = state.index.get(key) {
                // Update in place: re-index words, refresh size/words.
                let old_words = std::mem::replace(&mut state.slab[id].as_mut().unwrap().words, words.to_vec());
                for w in &old_words {
                    if let Some(set) = state.word_index.get_mut(w) {
                        set.remove(&id);
                        if set.is_empty() {
                            state.word_index.remove(w);
                        }
                    }
                }
                state.index_words(id, words);
                let old_size = state.slab[id].as_ref().unwrap().size;
                state.size = state.size - old_size + value_size;
                state.slab[id].as_mut().unwrap().size = value_size;
                state.move_to_front(id);
                self.counters.updates.fetch_add(1, Ordering::Relaxed);
            } else {
                let id = state.alloc(key.clone(), value_size, words.to_vec());
                state.index_words(id, words);
            }
        }
        result
    }

    pub async fn del(&self, key: &CacheKey) -> CacheResult {
        {
            let mut state = self.state.lock();
            if let Some(&id) = state.index.get(key) {
                state.remove_node(id);
                self.counters.deletes.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.raw.del_value(key).await
    }

    pub async fn invalidate_words(&self, words: &[String]) -> CacheResult {
        match self.invalidator {
            Invalidator::Null => CacheResult::out_of_resources(),
            Invalidator::Delegated => {
                let result = self.raw.invalidate(words).await;
                if result.code == ResultCode::Error || result.code == ResultCode::OutOfResources {
                    return self.clear_all().await;
                }
                let mut state = self.state.lock();
                let mut seen = HashSet::new();
                for word in words {
                    if let Some(ids) = state.word_index.get(word).cloned() {
                        seen.extend(ids);
                    }
                }
                for id in seen {
                    state.remove_node(id);
                    self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
                }
                result
            }
            Invalidator::Full => {
                let mut to_free: Vec<CacheKey> = Vec::new();
                {
                    let mut state = self.state.lock();
                    let mut seen = HashSet::new();
                    for word in words {
                        if let Some(ids) = state.word_index.get(word).cloned() {
                            seen.extend(ids);
                        }
                    }
                    for id in seen {
                        let key = state.slab[id].as_ref().unwrap().key.clone();
                        to_free.push(key);
                        state.remove_node(id);
                    }
                }
                let mut failed = false;
                for key in &to_free {
                    let result = self.raw.del_value(key).await;
                    if result.code == ResultCode::Error || result.code == ResultCode::OutOfResources {
                        failed = true;
                    } else {
                        self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
                    }
                }
                if failed {
                    return self.clear_all().await;
                }
                CacheResult::ok()
            }
        }
    }

    pub async fn clear_all(&self) -> CacheResult {
        self.state.lock().clear_all();
        self.counters.cleared.fetch_add(1, Ordering::Relaxed);
        self.raw.clear().await
    }

    /// Returns the most-recently-used key and its value, skipping (and
    /// dropping bookkeeping for) any head entries that turn out to have
    /// hard-expired while being consulted.
    pub async fn get_head(&self) -> (CacheResult, Option<(CacheKey, Vec<u8>)>) {
        self.get_endpoint(true).await
    }

    /// Returns the least-recently-used key and its value, same semantics
    /// as [`Self::get_head`].
    pub async fn get_tail(&self) -> (CacheResult, Option<(CacheKey, Vec<u8>)>) {
        self.get_endpoint(false).await
    }

    async fn get_endpoint(&self, head: bool) -> (CacheResult, Option<(CacheKey, Vec<u8>)>) {
        loop {
            let candidate = {
                let state = self.state.lock();
                let id = if head { state.head } else { state.tail };
                match id {
                    Some(id) => state.slab[id].as_ref().unwrap().key.clone(),
                    None => return (CacheResult::not_found(), None),
                }
            };
            let (result, value) =
                self.get(&candidate, AccessApproach::Peek, GetFlags { include_stale: true }).await;
            if result.is_ok() {
                return (result, value.map(|v| (candidate, v)));
            }
            // Hard-expired while being consulted: bookkeeping was already
            // dropped by `get`, try the new endpoint.
            if self.state.lock().items() == 0 {
                return (CacheResult::not_found(), None);
            }
        }
    }

    pub fn get_size(&self) -> u64 {
        self.state.lock().size
    }

    pub fn get_items(&self) -> u64 {
        self.state.lock().items()
    }

    #[cfg(test)]
    fn invariants_hold(&self) -> bool {
        let state = self.state.lock();
        let sum: u64 = state
            .slab
            .iter()
            .filter_map(|n| n.as_ref())
            .map(|n| n.size)
            .sum();
        let count_ok = state.items() as usize == state.slab.iter().filter(|n| n.is_some()).count();
        sum == state.size && count_ok
    }
}

#[async_trait]
impl<S: Storage> Storage for LruStorage<S> {
    fn config(&self) -> &StorageConfig {
        &self.config
    }

    fn kind(&self) -> StorageKind {
        self.raw.kind()
    }

    async fn get_value(
        &self,
        key: &CacheKey,
        flags: GetFlags,
        _soft_ttl: Option<Duration>,
        _hard_ttl: Option<Duration>,
    ) -> (CacheResult, Option<Vec<u8>>) {
        self.get(key, AccessApproach::Get, flags).await
    }

    async fn put_value(&self, key: &CacheKey, value: &[u8], invalidation_words: &[String]) -> CacheResult {
        self.put(key, value, invalidation_words).await
    }

    async fn del_value(&self, key: &CacheKey) -> CacheResult {
        self.del(key).await
    }

    async fn invalidate(&self, words: &[String]) -> CacheResult {
        self.invalidate_words(words).await
    }

    async fn clear(&self) -> CacheResult {
        self.clear_all().await
    }

    async fn size(&self) -> (CacheResult, u64) {
        (CacheResult::ok(), self.get_size())
    }

    async fn item_count(&self) -> (CacheResult, u64) {
        (CacheResult::ok(), self.get_items())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::inmemory::InMemoryStorage;

    fn lru(max_size: u64, max_count: u64) -> LruStorage<InMemoryStorage> {
        let clock = Arc::new(ManualClock::new());
        let config = StorageConfig { max_size, max_count, ..StorageConfig::default() };
        let raw = InMemoryStorage::new(config.clone(), clock);
        LruStorage::new(raw, config, InMemoryStorage::capabilities())
    }

    #[tokio::test]
    async fn oversize_value_rejected_and_prior_entry_dropped() {
        let l = lru(10, 0);
        let k = CacheKey::new("u", "h", "db", b"SELECT 1");
        assert!(l.put(&k, &[0u8; 9], &[]).await.is_ok());
        let result = l.put(&k, &[0u8; 12], &[]).await;
        assert_eq!(result.code, ResultCode::OutOfResources);
        let (get_result, _) = l.get(&k, AccessApproach::Get, GetFlags::default()).await;
        assert!(get_result.is_not_found());
        assert!(l.invariants_hold());
    }

    #[tokio::test]
    async fn evicts_lru_tail_on_count_overflow() {
        let l = lru(0, 2);
        let k1 = CacheKey::new("u", "h", "db", b"SELECT 1");
        let k2 = CacheKey::new("u", "h", "db", b"SELECT 2");
        let k3 = CacheKey::new("u", "h", "db", b"SELECT 3");
        l.put(&k1, b"a", &[]).await;
        l.put(&k2, b"b", &[]).await;
        l.put(&k3, b"c", &[]).await;
        assert_eq!(l.get_items(), 2);
        let (r1, _) = l.get(&k1, AccessApproach::Peek, GetFlags::default()).await;
        assert!(r1.is_not_found());
        let (r3, _) = l.get(&k3, AccessApproach::Peek, GetFlags::default()).await;
        assert!(r3.is_ok());
        assert!(l.invariants_hold());
    }

    #[tokio::test]
    async fn get_reorders_but_peek_does_not() {
        let l = lru(0, 2);
        let k1 = CacheKey::new("u", "h", "db", b"SELECT 1");
        let k2 = CacheKey::new("u", "h", "db", b"SELECT 2");
        l.put(&k1, b"a", &[]).await;
        l.put(&k2, b"b", &[]).await;
        // Touch k1 with GET so it becomes MRU; k2 is now LRU.
        l.get(&k1, AccessApproach::Get, GetFlags::default()).await;
        let k3 = CacheKey::new("u", "h", "db", b"SELECT 3");
        l.put(&k3, b"c", &[]).await;
        let (r2, _) = l.get(&k2, AccessApproach::Peek, GetFlags::default()).await;
        assert!(r2.is_not_found(), "k2 should have been evicted as the true LRU");
        let (r1, _) = l.get(&k1, AccessApproach::Peek, GetFlags::default()).await;
        assert!(r1.is_ok());
    }

    #[tokio::test]
    async fn invalidate_by_word_removes_matching_entries_only() {
        let clock = Arc::new(ManualClock::new());
        let config = StorageConfig {
            invalidation: crate::storage::InvalidationMode::Current,
            ..StorageConfig::default()
        };
        let raw = InMemoryStorage::new(config.clone(), clock.clone());
        let l = LruStorage::new(raw, config, InMemoryStorage::capabilities());
        assert_eq!(l.invalidator(), Invalidator::Full);

        let k1 = CacheKey::new("", "", "db", b"SELECT * FROM t1");
        let k2 = CacheKey::new("", "", "db", b"SELECT * FROM t2");
        l.put(&k1, b"r1", &["db.t1".to_string()]).await;
        l.put(&k2, b"r2", &["db.t2".to_string()]).await;

        let result = l.invalidate_words(&["db.t1".to_string()]).await;
        assert!(result.is_ok());

        let (r1, _) = l.get(&k1, AccessApproach::Peek, GetFlags::default()).await;
        assert!(r1.is_not_found());
        let (r2, _) = l.get(&k2, AccessApproach::Peek, GetFlags::default()).await;
        assert!(r2.is_ok());
        assert!(l.invariants_hold());
    }

    #[tokio::test]
    async fn size_and_items_counters_track_state() {
        let l = lru(0, 0);
        let k1 = CacheKey::new("u", "h", "db", b"SELECT 1");
        let k2 = CacheKey::new("u", "h", "db", b"SELECT 2");
        l.put(&k1, b"abc", &[]).await;
        l.put(&k2, b"de", &[]).await;
        assert_eq!(l.get_items(), 2);
        assert_eq!(l.get_size(), 5);
        l.del(&k1).await;
        assert_eq!(l.get_items(), 1);
        assert_eq!(l.get_size(), 2);
        assert!(l.invariants_hold());
    }

    #[tokio::test]
    async fn clear_empties_everything() {
        let l = lru(0, 0);
        let k1 = CacheKey::new("u", "h", "db", b"SELECT 1");
        l.put(&k1, b"abc", &[]).await;
        l.clear_all().await;
        assert_eq!(l.get_items(), 0);
        assert_eq!(l.get_size(), 0);
        let (r, _) = l.get(&k1, AccessApproach::Peek, GetFlags::default()).await;
        assert!(r.is_not_found());
    }

    #[tokio::test]
    async fn get_head_and_tail_report_recency_ends() {
        let l = lru(0, 0);
        let k1 = CacheKey::new("u", "h", "db", b"SELECT 1");
        let k2 = CacheKey::new("u", "h", "db", b"SELECT 2");
        l.put(&k1, b"a", &[]).await;
        l.put(&k2, b"b", &[]).await;
        let (_, head) = l.get_head().await;
        let (_, tail) = l.get_tail().await;
        assert_eq!(head.unwrap().0, k2);
        assert_eq!(tail.unwrap().0, k1);
    }
}
