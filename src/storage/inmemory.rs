//! The in-memory storage (spec §4.5).
//!
//! No invalidation support — it fails with `OUT_OF_RESOURCES`, same as
//! `original_source/.../inmemorystorage.cc`'s real backing
//! (`InMemoryStorage` there delegates invalidation bookkeeping entirely
//! to the LRU layer, [`crate::lru`]). The entry shape (value bytes +
//! stored-at millis) mirrors the teacher's `CacheEntry` TTL bookkeeping
//! in `cache/query_cache.rs`, generalized from `Instant`/`Duration` to
//! this crate's injectable [`crate::clock::Clock`].

use crate::clock::Clock;
use crate::key::CacheKey;
use crate::storage::{CacheResult, Capabilities, GetFlags, Storage, StorageConfig, StorageKind};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

struct Entry {
    value: Vec<u8>,
    stored_ms: u64,
}

/// A private, thread-model-agnostic in-memory key/value store. Single-
/// vs multi-threaded is a matter of whether one engine instance or many
/// hold an `Arc` to it — the storage itself is always safe to share
/// because it is guarded by a single `RwLock`.
pub struct InMemoryStorage {
    config: StorageConfig,
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<CacheKey, Entry>>,
}

impl InMemoryStorage {
    pub fn new(config: StorageConfig, clock: Arc<dyn Clock>) -> Self {
        InMemoryStorage { config, clock, entries: RwLock::new(HashMap::new()) }
    }

    pub fn capabilities() -> Capabilities {
        Capabilities {
            supports_single_thread: true,
            supports_multi_thread: true,
            natively_lru: false,
            supports_max_count: false,
            supports_max_size: false,
            supports_invalidation: false,
        }
    }

    fn effective_ttl(&self, configured: Duration, override_ttl: Option<Duration>) -> Duration {
        override_ttl.unwrap_or(configured)
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    fn config(&self) -> &StorageConfig {
        &self.config
    }

    fn kind(&self) -> StorageKind {
        StorageKind::Private
    }

    async fn get_value(
        &self,
        key: &CacheKey,
        flags: GetFlags,
        soft_ttl: Option<Duration>,
        hard_ttl: Option<Duration>,
    ) -> (CacheResult, Option<Vec<u8>>) {
        let soft_ttl = self.effective_ttl(self.config.soft_ttl, soft_ttl);
        let hard_ttl = self.effective_ttl(self.config.hard_ttl, hard_ttl);
        let now = self.clock.now_ms();

        // Hard-TTL expiry removes the entry outright, so it needs a
        // write lock; everything else only reads.
        {
            let entries = self.entries.read();
            let Some(entry) = entries.get(key) else {
                return (CacheResult::not_found(), None);
            };
            let age_ms = now.saturating_sub(entry.stored_ms);

            let hard_ms = hard_ttl.as_millis() as u64;
            if hard_ms > 0 && age_ms > hard_ms {
                drop(entries);
                self.entries.write().remove(key);
                return (CacheResult::discarded(), None);
            }

            let soft_ms = soft_ttl.as_millis() as u64;
            if soft_ms > 0 && age_ms > soft_ms {
                if flags.include_stale {
                    return (CacheResult::ok_stale(), Some(entry.value.clone()));
                }
                return (CacheResult::not_found_stale(), None);
            }

            (CacheResult::ok(), Some(entry.value.clone()))
        }
    }

    async fn put_value(&self, key: &CacheKey, value: &[u8], _invalidation_words: &[String]) -> CacheResult {
        let stored_ms = self.clock.now_ms();
        self.entries.write().insert(key.clone(), Entry { value: value.to_vec(), stored_ms });
        CacheResult::ok()
    }

    async fn del_value(&self, key: &CacheKey) -> CacheResult {
        self.entries.write().remove(key);
        CacheResult::ok()
    }

    async fn invalidate(&self, _words: &[String]) -> CacheResult {
        CacheResult::out_of_resources()
    }

    async fn clear(&self) -> CacheResult {
        self.entries.write().clear();
        CacheResult::ok()
    }

    async fn size(&self) -> (CacheResult, u64) {
        let total: u64 = self.entries.read().values().map(|e| e.value.len() as u64).sum();
        (CacheResult::ok(), total)
    }

    async fn item_count(&self) -> (CacheResult, u64) {
        (CacheResult::ok(), self.entries.read().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn storage(soft_ttl_ms: u64, hard_ttl_ms: u64) -> (InMemoryStorage, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let config = StorageConfig {
            soft_ttl: Duration::from_millis(soft_ttl_ms),
            hard_ttl: Duration::from_millis(hard_ttl_ms),
            ..StorageConfig::default()
        };
        (InMemoryStorage::new(config, clock.clone()), clock)
    }

    #[tokio::test]
    async fn basic_put_get_hit() {
        let (s, _clock) = storage(3000, 6000);
        let k = CacheKey::new("u", "h", "db", b"SELECT 1");
        s.put_value(&k, b"hello", &[]).await;
        let (res, val) = s.get_value(&k, GetFlags::default(), None, None).await;
        assert!(res.is_ok());
        assert!(!res.stale);
        assert_eq!(val.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn ttl_boundary_scenario() {
        let (s, clock) = storage(3000, 6000);
        let k = CacheKey::new("u", "h", "db", b"SELECT 1");
        clock.set(0);
        s.put_value(&k, b"V", &[]).await;

        clock.set(2000);
        let (res, _) = s.get_value(&k, GetFlags::default(), None, None).await;
        assert!(res.is_ok() && !res.stale);

        clock.set(4000);
        let (res, _) = s.get_value(&k, GetFlags::default(), None, None).await;
        assert!(res.is_not_found() && res.stale);

        let (res, val) = s.get_value(&k, GetFlags { include_stale: true }, None, None).await;
        assert!(res.is_ok() && res.stale);
        assert_eq!(val.unwrap(), b"V");

        clock.set(7000);
        let (res, _) = s.get_value(&k, GetFlags::default(), None, None).await;
        assert!(res.is_not_found() && res.discarded);
    }

    #[tokio::test]
    async fn invalidate_is_unsupported() {
        let (s, _clock) = storage(0, 0);
        let res = s.invalidate(&["t1".to_string()]).await;
        assert_eq!(res.code, crate::storage::ResultCode::OutOfResources);
    }
}
