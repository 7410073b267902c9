//! Assembles a [`CacheEngine`] from a [`CacheConfig`] (spec §6
//! "Configuration"): resolves `storage`/`storage_options` through
//! [`crate::storage::registry`], loads the `rules` document (if any),
//! and decorates the storage with [`crate::lru::LruStorage`] when the
//! backend doesn't natively support the eviction/invalidation the config
//! asks for (spec §6: "Private storages may be decorated by the LRU
//! wrapper; shared storages may not").
//!
//! This is the one place in the crate that reads a file from disk
//! (the `rules` path) — the engine, session, and storage modules
//! otherwise take already-parsed values, per §1's "configuration file
//! loading... is a host concern" scoping. A host that loads its rules
//! document some other way (already embedded in its own config tree,
//! fetched over the network) should build a [`RuleSet`] list itself and
//! call [`crate::engine::CacheEngine::shared`]/`partitioned` directly
//! instead of going through this file-reading convenience.

use crate::clock::SystemClock;
use crate::engine::CacheEngine;
use crate::error::{CacheError, Result};
use crate::lru::LruStorage;
use crate::rules::RuleSet;
use crate::session::config::CacheConfig;
use crate::storage::inmemory::InMemoryStorage;
use crate::storage::memcached::MemcachedStorage;
use crate::storage::{registry, Capabilities, InvalidationMode, Storage, StorageConfig, StorageKind, ThreadModel};
use std::sync::Arc;

fn storage_config_for(config: &CacheConfig, thread_model: ThreadModel) -> StorageConfig {
    StorageConfig {
        thread_model,
        soft_ttl: config.soft_ttl,
        hard_ttl: config.hard_ttl,
        max_count: config.max_count,
        max_size: config.max_size,
        invalidation: config.invalidate,
        remote_timeout: config.timeout,
    }
}

fn load_rule_groups(config: &CacheConfig) -> Result<Vec<RuleSet>> {
    if config.rules.is_empty() {
        return Ok(vec![RuleSet::empty()]);
    }
    let text = std::fs::read_to_string(&config.rules).map_err(|e| {
        CacheError::Configuration(format!("could not read rules document {}: {e}", config.rules))
    })?;
    RuleSet::parse_document(&text)
}

/// Decorates `raw` with [`LruStorage`] when `kind` is `Private` and the
/// backend's own `caps` fall short of what `storage_config` asks for
/// (spec §6). Shared storages are returned as-is (spec: "shared
/// storages may not" be LRU-decorated).
fn wrap_if_needed(
    raw: Arc<dyn Storage>,
    storage_config: StorageConfig,
    caps: Capabilities,
    kind: StorageKind,
) -> Arc<dyn Storage> {
    let needs_eviction = storage_config.max_count != 0 && !caps.supports_max_count
        || storage_config.max_size != 0 && !caps.supports_max_size;
    let needs_invalidation =
        storage_config.invalidation != InvalidationMode::Never && !caps.supports_invalidation;

    if kind == StorageKind::Private && (needs_eviction || needs_invalidation || !caps.natively_lru) {
        Arc::new(LruStorage::new(raw, storage_config, caps))
    } else {
        raw
    }
}

/// Builds a fresh storage instance from `config`'s `storage`/
/// `storage_options` via [`registry::create_storage`], LRU-decorated per
/// [`wrap_if_needed`]. Async because the registry's `create_storage` is
/// (the `redis` module dials out at construction time).
pub async fn build_storage(config: &CacheConfig, thread_model: ThreadModel) -> Result<Arc<dyn Storage>> {
    let storage_config = storage_config_for(config, thread_model);
    let raw = registry::create_storage(&config.storage, storage_config.clone(), &config.storage_options).await?;
    let (kind, caps) = registry::capabilities(&config.storage)?;
    Ok(wrap_if_needed(raw, storage_config, caps, kind))
}

/// Builds the `cached_data = shared` engine shape (spec §6): one storage
/// instance reachable from every session on every worker.
pub async fn build_shared_engine(config: &CacheConfig) -> Result<CacheEngine> {
    let storage = build_storage(config, ThreadModel::Multi).await?;
    let rules = load_rule_groups(config)?;
    Ok(CacheEngine::shared(storage, rules))
}

/// Constructs a private, single-threaded storage synchronously, without
/// going through the registry's async `create_storage`. Only the two
/// built-in modules whose constructors never need to block on I/O
/// (`inmemory`, `memcached` — the connection itself is lazy) are
/// supported; `redis`'s module `kind()` is `Shared` (spec §6: shared
/// storages aren't meant to be decorated/partitioned per worker in the
/// first place) and is rejected here.
fn build_private_storage_sync(config: &CacheConfig, thread_model: ThreadModel) -> Result<Arc<dyn Storage>> {
    let storage_config = storage_config_for(config, thread_model);
    let clock = Arc::new(SystemClock::new());
    let raw: Arc<dyn Storage> = match config.storage.as_str() {
        "inmemory" => Arc::new(InMemoryStorage::new(storage_config.clone(), clock)),
        "memcached" => {
            let addr = config
                .storage_options
                .get("server")
                .and_then(|v| v.as_str())
                .ok_or_else(|| CacheError::Configuration("memcached storage requires a \"server\" param".to_string()))?
                .to_string();
            Arc::new(MemcachedStorage::new(storage_config.clone(), clock, addr))
        }
        other => {
            return Err(CacheError::Configuration(format!(
                "\"{other}\" cannot back a per-worker (thread_specific) engine; only inmemory/memcached are synchronously constructible private storages"
            )))
        }
    };
    let (kind, caps) = registry::capabilities(&config.storage)?;
    Ok(wrap_if_needed(raw, storage_config, caps, kind))
}

/// Builds the `cached_data = thread_specific` engine shape (spec §6):
/// each worker lazily gets its own private storage instance, built the
/// first time that `WorkerId` is touched.
pub fn build_partitioned_engine(config: CacheConfig) -> Result<CacheEngine> {
    let rules = load_rule_groups(&config)?;
    // Resolved once up front so a typo in `storage`/a bad `storage_options`
    // surfaces immediately rather than the first time some worker is touched.
    build_private_storage_sync(&config, ThreadModel::Single)?;

    let config = Arc::new(config);
    let factory: Arc<dyn Fn() -> Arc<dyn Storage> + Send + Sync> = Arc::new(move || {
        build_private_storage_sync(&config, ThreadModel::Single)
            .expect("validated once in build_partitioned_engine; config does not change afterwards")
    });
    Ok(CacheEngine::partitioned(factory, rules))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Token, NO_WORKER};
    use crate::storage::GetFlags;

    #[tokio::test]
    async fn default_config_builds_a_working_shared_engine() {
        let config = CacheConfig::default();
        let engine = build_shared_engine(&config).await.unwrap();
        let key = engine.get_key("u", "h", "db", b"SELECT 1");
        engine.put_value(NO_WORKER, Token::null(), &key, &[], b"v").await;
        let (r, v) = engine.get_value(NO_WORKER, Token::null(), &key, GetFlags::default(), None, None).await;
        assert!(r.is_ok());
        assert_eq!(v.unwrap(), b"v");
    }

    #[tokio::test]
    async fn unknown_storage_name_fails_fast() {
        let config = CacheConfig { storage: "not-a-real-module".to_string(), ..CacheConfig::default() };
        assert!(build_shared_engine(&config).await.is_err());
    }

    #[tokio::test]
    async fn configured_max_count_gets_lru_decoration_over_inmemory() {
        let config = CacheConfig { max_count: 2, ..CacheConfig::default() };
        let storage = build_storage(&config, ThreadModel::Multi).await.unwrap();
        let key_a = crate::key::CacheKey::new("u", "h", "db", b"SELECT 1");
        let key_b = crate::key::CacheKey::new("u", "h", "db", b"SELECT 2");
        let key_c = crate::key::CacheKey::new("u", "h", "db", b"SELECT 3");
        storage.put_value(&key_a, b"a", &[]).await;
        storage.put_value(&key_b, b"b", &[]).await;
        storage.put_value(&key_c, b"c", &[]).await;
        let (_, count) = storage.item_count().await;
        assert!(count <= 2, "LRU decoration should cap item_count at max_count, got {count}");
    }

    #[test]
    fn bad_rules_path_fails_fast() {
        let config = CacheConfig { rules: "/nonexistent/path/rules.json".to_string(), ..CacheConfig::default() };
        assert!(load_rule_groups(&config).is_err());
    }

    #[test]
    fn empty_rules_path_means_always_store_and_use() {
        let config = CacheConfig::default();
        let groups = load_rule_groups(&config).unwrap();
        assert_eq!(groups.len(), 1);
        assert!(groups[0].should_store("db", "SELECT 1"));
    }

    #[test]
    fn partitioned_engine_rejects_redis_up_front() {
        let config = CacheConfig { storage: "redis".to_string(), ..CacheConfig::default() };
        assert!(build_partitioned_engine(config).is_err());
    }

    #[tokio::test]
    async fn partitioned_engine_isolates_workers_built_from_config() {
        let config = CacheConfig::default();
        let engine = build_partitioned_engine(config).unwrap();
        let key = engine.get_key("u", "h", "db", b"SELECT 1");
        engine.put_value(0, Token::null(), &key, &[], b"from worker 0").await;
        let (r1, _) = engine.get_value(1, Token::null(), &key, GetFlags::default(), None, None).await;
        assert!(r1.is_not_found());
    }
}
