//! Pluggable byte-level storages (spec §4.5, §4.6).
//!
//! A [`Storage`] maps a [`crate::key::CacheKey`] to an opaque value plus a
//! TTL, and optionally supports invalidation by word. Every operation
//! returns a [`CacheResult`] — a successful-looking value type, not an
//! error — mirroring the contract in §4.3/§7: routine outcomes
//! (not-found, stale, out-of-resources) are not exceptions, and only
//! genuinely exceptional conditions (a malformed config, a backend that
//! refuses to start) escape as [`crate::error::CacheError`].

pub mod inmemory;
pub mod memcached;
pub mod redis_storage;
pub mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Result code bits (spec §4.3). `ERROR` and `OUT_OF_RESOURCES` are
/// terminal failures; `STALE`/`DISCARDED` are composable flags that ride
/// along with `OK`/`NOT_FOUND`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    NotFound,
    Pending,
    Error,
    OutOfResources,
}

/// A [`ResultCode`] plus the composable STALE/DISCARDED flags (spec
/// §4.3, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheResult {
    pub code: ResultCode,
    pub stale: bool,
    pub discarded: bool,
}

impl CacheResult {
    pub const fn ok() -> Self {
        CacheResult { code: ResultCode::Ok, stale: false, discarded: false }
    }

    pub const fn ok_stale() -> Self {
        CacheResult { code: ResultCode::Ok, stale: true, discarded: false }
    }

    pub const fn not_found() -> Self {
        CacheResult { code: ResultCode::NotFound, stale: false, discarded: false }
    }

    pub const fn not_found_stale() -> Self {
        CacheResult { code: ResultCode::NotFound, stale: true, discarded: false }
    }

    pub const fn discarded() -> Self {
        CacheResult { code: ResultCode::NotFound, stale: false, discarded: true }
    }

    pub const fn out_of_resources() -> Self {
        CacheResult { code: ResultCode::OutOfResources, stale: false, discarded: false }
    }

    pub const fn error() -> Self {
        CacheResult { code: ResultCode::Error, stale: false, discarded: false }
    }

    pub const fn pending() -> Self {
        CacheResult { code: ResultCode::Pending, stale: false, discarded: false }
    }

    pub fn is_ok(&self) -> bool {
        self.code == ResultCode::Ok
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ResultCode::NotFound
    }
}

/// Thread model a storage is created for (spec §3, `StorageConfig`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadModel {
    Single,
    Multi,
}

/// Invalidation mode (spec §3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvalidationMode {
    Never,
    Current,
}

/// Configuration a storage is constructed with (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub thread_model: ThreadModel,
    pub soft_ttl: Duration,
    pub hard_ttl: Duration,
    pub max_count: u64,
    pub max_size: u64,
    pub invalidation: InvalidationMode,
    pub remote_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            thread_model: ThreadModel::Multi,
            soft_ttl: Duration::from_secs(0),
            hard_ttl: Duration::from_secs(0),
            max_count: 0,
            max_size: 0,
            invalidation: InvalidationMode::Never,
            remote_timeout: Duration::from_secs(5),
        }
    }
}

/// Flags passed to [`Storage::get_value`] (spec §4.5).
#[derive(Debug, Clone, Copy, Default)]
pub struct GetFlags {
    pub include_stale: bool,
}

/// Capability bitmask a storage module advertises at load time (spec
/// §6, "Storage module boundary").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub supports_single_thread: bool,
    pub supports_multi_thread: bool,
    pub natively_lru: bool,
    pub supports_max_count: bool,
    pub supports_max_size: bool,
    pub supports_invalidation: bool,
}

/// Whether a storage instance may be shared across engine instances or
/// must be exclusive to one (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Private,
    Shared,
}

/// A leaf byte-level key/value store (spec §4.5/§4.6). All operations
/// are async because the Memcached- and Redis-like backends are: they
/// round-trip over the network and this is the uniform contract every
/// caller (the LRU wrapper, the engine) is written against, even though
/// the in-memory storage completes synchronously in practice.
#[async_trait]
pub trait Storage: Send + Sync {
    fn config(&self) -> &StorageConfig;

    fn kind(&self) -> StorageKind;

    async fn get_value(
        &self,
        key: &crate::key::CacheKey,
        flags: GetFlags,
        soft_ttl: Option<Duration>,
        hard_ttl: Option<Duration>,
    ) -> (CacheResult, Option<Vec<u8>>);

    async fn put_value(
        &self,
        key: &crate::key::CacheKey,
        value: &[u8],
        invalidation_words: &[String],
    ) -> CacheResult;

    async fn del_value(&self, key: &crate::key::CacheKey) -> CacheResult;

    /// Removes every entry whose invalidation-word set intersects
    /// `words` (spec §4.2 GLOSSARY). Storages that never track
    /// invalidation words (in-memory, spec §4.5) fail with
    /// `OUT_OF_RESOURCES`; the LRU wrapper (§4.4) is what supplies this
    /// for storages that lack it natively.
    async fn invalidate(&self, words: &[String]) -> CacheResult;

    /// Discards every entry. Always succeeds for storages that support
    /// it at all.
    async fn clear(&self) -> CacheResult;

    async fn size(&self) -> (CacheResult, u64);

    async fn item_count(&self) -> (CacheResult, u64);
}

/// Lets a boxed storage stand in anywhere a concrete one is expected —
/// in particular, so [`crate::lru::LruStorage`] (generic over `S:
/// Storage`) can decorate whatever [`crate::storage::registry`] handed
/// back as a trait object, without every caller needing to know the
/// storage's concrete type.
#[async_trait]
impl Storage for Arc<dyn Storage> {
    fn config(&self) -> &StorageConfig {
        (**self).config()
    }

    fn kind(&self) -> StorageKind {
        (**self).kind()
    }

    async fn get_value(
        &self,
        key: &crate::key::CacheKey,
        flags: GetFlags,
        soft_ttl: Option<Duration>,
        hard_ttl: Option<Duration>,
    ) -> (CacheResult, Option<Vec<u8>>) {
        (**self).get_value(key, flags, soft_ttl, hard_ttl).await
    }

    async fn put_value(
        &self,
        key: &crate::key::CacheKey,
        value: &[u8],
        invalidation_words: &[String],
    ) -> CacheResult {
        (**self).put_value(key, value, invalidation_words).await
    }

    async fn del_value(&self, key: &crate::key::CacheKey) -> CacheResult {
        (**self).del_value(key).await
    }

    async fn invalidate(&self, words: &[String]) -> CacheResult {
        (**self).invalidate(words).await
    }

    async fn clear(&self) -> CacheResult {
        (**self).clear().await
    }

    async fn size(&self) -> (CacheResult, u64) {
        (**self).size().await
    }

    async fn item_count(&self) -> (CacheResult, u64) {
        (**self).item_count().await
    }
}
