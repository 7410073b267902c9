//! The storage plugin boundary (spec §6 "Storage module boundary").
//!
//! `original_source/` loads a storage backend by `dlopen`-ing a shared
//! object and looking up a fixed symbol; per §9's design note ("Module
//! loaded by host via symbol lookup... Either a static registry of
//! storage constructors at build time, or a small plugin loader... the
//! registry is preferred"), this crate uses a static, in-process
//! registry instead: every [`StorageModule`] this binary ships with
//! registers itself into a process-wide table the first time the
//! registry is touched, keyed by the same names `storage` (§6) accepts.
//!
//! Each module supplies exactly the four operations the spec's boundary
//! names: `kind`/`capabilities` together answer "initialize()" (the
//! `{private, shared}` classification plus the capability bitmask),
//! `create_storage` is "create_storage(name, storage_config, params)",
//! and `get_limits` is "get_limits(params)". [`finalize`] is the
//! process-wide teardown hook the spec names; nothing a built-in module
//! holds needs releasing before process exit, so today it only drops
//! whatever a host registered via [`register`] — useful for a test that
//! wants a clean table between cases.

use crate::clock::SystemClock;
use crate::error::{CacheError, Result};
use crate::storage::inmemory::InMemoryStorage;
use crate::storage::memcached::MemcachedStorage;
use crate::storage::redis_storage::RedisStorage;
use crate::storage::{Capabilities, Storage, StorageConfig, StorageKind};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// What [`StorageModule::get_limits`] reports for a given set of params
/// (spec §6: "`get_limits(params) -> {max_value_size}`").
#[derive(Debug, Clone, Copy)]
pub struct StorageLimits {
    pub max_value_size: u64,
}

/// A storage plugin's load-time identity and construction entry point
/// (spec §6 "Storage module boundary"). `params` is the module-specific
/// half of `storage_options` (§6) — e.g. a host:port for the remote
/// backends — left as a raw JSON value since each module defines its
/// own accepted shape (spec: "a specification object describing
/// accepted params", surfaced here as [`StorageModule::param_names`]).
#[async_trait]
pub trait StorageModule: Send + Sync {
    fn kind(&self) -> StorageKind;
    fn capabilities(&self) -> Capabilities;
    async fn create_storage(
        &self,
        config: StorageConfig,
        params: &serde_json::Value,
    ) -> Result<Arc<dyn Storage>>;
    fn get_limits(&self, params: &serde_json::Value) -> StorageLimits;
    /// Names of the recognised keys in `params`, for a host surfacing
    /// "what does this module accept" diagnostics.
    fn param_names(&self) -> &'static [&'static str];
}

struct InMemoryModule;

#[async_trait]
impl StorageModule for InMemoryModule {
    fn kind(&self) -> StorageKind {
        StorageKind::Private
    }

    fn capabilities(&self) -> Capabilities {
        InMemoryStorage::capabilities()
    }

    async fn create_storage(&self, config: StorageConfig, _params: &serde_json::Value) -> Result<Arc<dyn Storage>> {
        Ok(Arc::new(InMemoryStorage::new(config, Arc::new(SystemClock::new()))))
    }

    fn get_limits(&self, _params: &serde_json::Value) -> StorageLimits {
        // Spec §4.5: "Max item size limit defaults to a 32-bit maximum."
        StorageLimits { max_value_size: u32::MAX as u64 }
    }

    fn param_names(&self) -> &'static [&'static str] {
        &[]
    }
}

struct MemcachedModule;

#[async_trait]
impl StorageModule for MemcachedModule {
    fn kind(&self) -> StorageKind {
        StorageKind::Shared
    }

    fn capabilities(&self) -> Capabilities {
        MemcachedStorage::capabilities()
    }

    async fn create_storage(&self, config: StorageConfig, params: &serde_json::Value) -> Result<Arc<dyn Storage>> {
        let addr = params
            .get("server")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CacheError::Configuration("memcached storage requires a \"server\" param (host:port)".to_string()))?
            .to_string();
        Ok(Arc::new(MemcachedStorage::new(config, Arc::new(SystemClock::new()), addr)))
    }

    fn get_limits(&self, _params: &serde_json::Value) -> StorageLimits {
        // The classic memcached 1MiB item-size ceiling.
        StorageLimits { max_value_size: 1024 * 1024 }
    }

    fn param_names(&self) -> &'static [&'static str] {
        &["server"]
    }
}

struct RedisModule;

#[async_trait]
impl StorageModule for RedisModule {
    fn kind(&self) -> StorageKind {
        StorageKind::Shared
    }

    fn capabilities(&self) -> Capabilities {
        RedisStorage::capabilities()
    }

    async fn create_storage(&self, config: StorageConfig, params: &serde_json::Value) -> Result<Arc<dyn Storage>> {
        let url = params
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CacheError::Configuration("redis storage requires a \"url\" param".to_string()))?
            .to_string();
        let storage = RedisStorage::connect(config, Arc::new(SystemClock::new()), url)
            .await
            .map_err(|e| CacheError::Storage(format!("redis connect failed: {e}")))?;
        Ok(Arc::new(storage))
    }

    fn get_limits(&self, _params: &serde_json::Value) -> StorageLimits {
        // Redis' own string-value ceiling.
        StorageLimits { max_value_size: 512 * 1024 * 1024 }
    }

    fn param_names(&self) -> &'static [&'static str] {
        &["url"]
    }
}

static REGISTRY: Lazy<RwLock<HashMap<String, Arc<dyn StorageModule>>>> = Lazy::new(|| {
    let mut map: HashMap<String, Arc<dyn StorageModule>> = HashMap::new();
    map.insert("inmemory".to_string(), Arc::new(InMemoryModule));
    map.insert("memcached".to_string(), Arc::new(MemcachedModule));
    map.insert("redis".to_string(), Arc::new(RedisModule));
    RwLock::new(map)
});

/// Registers a storage module under `name`, overwriting any existing
/// registration — the "plugin discovered at runtime" half of the
/// contract, for a host that ships its own backend (spec §6).
pub fn register(name: impl Into<String>, module: Arc<dyn StorageModule>) {
    REGISTRY.write().insert(name.into(), module);
}

fn lookup(name: &str) -> Result<Arc<dyn StorageModule>> {
    REGISTRY
        .read()
        .get(name)
        .cloned()
        .ok_or_else(|| CacheError::Storage(format!("no storage module registered for \"{name}\"")))
}

/// Spec §6: "`create_storage(name, storage_config, params) -> Storage`".
pub async fn create_storage(name: &str, config: StorageConfig, params: &serde_json::Value) -> Result<Arc<dyn Storage>> {
    lookup(name)?.create_storage(config, params).await
}

/// Spec §6: "`get_limits(params) -> {max_value_size}`".
pub fn get_limits(name: &str, params: &serde_json::Value) -> Result<StorageLimits> {
    Ok(lookup(name)?.get_limits(params))
}

/// Spec §6: "initialize() -> (kind, capabilities)".
pub fn capabilities(name: &str) -> Result<(StorageKind, Capabilities)> {
    let module = lookup(name)?;
    Ok((module.kind(), module.capabilities()))
}

pub fn param_names(name: &str) -> Result<&'static [&'static str]> {
    Ok(lookup(name)?.param_names())
}

/// Spec §6: the module boundary's `finalize()`. Resets the registry back
/// to just the built-in modules, dropping anything a host added via
/// [`register`].
pub fn finalize() {
    let mut map = REGISTRY.write();
    map.clear();
    map.insert("inmemory".to_string(), Arc::new(InMemoryModule) as Arc<dyn StorageModule>);
    map.insert("memcached".to_string(), Arc::new(MemcachedModule));
    map.insert("redis".to_string(), Arc::new(RedisModule));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn inmemory_is_registered_and_private() {
        let (kind, caps) = capabilities("inmemory").unwrap();
        assert_eq!(kind, StorageKind::Private);
        assert!(caps.supports_single_thread);

        let storage = create_storage("inmemory", StorageConfig::default(), &json!({})).await.unwrap();
        let key = crate::key::CacheKey::new("u", "h", "db", b"SELECT 1");
        storage.put_value(&key, b"v", &[]).await;
        let (r, v) = storage.get_value(&key, crate::storage::GetFlags::default(), None, None).await;
        assert!(r.is_ok());
        assert_eq!(v.unwrap(), b"v");
    }

    #[tokio::test]
    async fn unknown_module_name_fails() {
        let err = create_storage("bogus", StorageConfig::default(), &json!({})).await;
        assert!(err.is_err());
    }

    #[test]
    fn memcached_requires_server_param_names() {
        let names = param_names("memcached").unwrap();
        assert_eq!(names, &["server"]);
    }

    #[tokio::test]
    async fn memcached_without_server_param_fails_fast() {
        let err = create_storage("memcached", StorageConfig::default(), &json!({})).await;
        assert!(err.is_err());
    }

    // Registration and `finalize` share one process-wide table, so both
    // behaviors are checked in a single test — splitting them risks a
    // race against whichever other test mutates the same table when the
    // suite runs multi-threaded.
    #[test]
    fn custom_modules_register_and_are_dropped_by_finalize() {
        struct Dummy;
        #[async_trait::async_trait]
        impl StorageModule for Dummy {
            fn kind(&self) -> StorageKind {
                StorageKind::Private
            }
            fn capabilities(&self) -> Capabilities {
                Capabilities::default()
            }
            async fn create_storage(&self, config: StorageConfig, _: &serde_json::Value) -> Result<Arc<dyn Storage>> {
                Ok(Arc::new(InMemoryStorage::new(config, Arc::new(SystemClock::new()))))
            }
            fn get_limits(&self, _: &serde_json::Value) -> StorageLimits {
                StorageLimits { max_value_size: 0 }
            }
            fn param_names(&self) -> &'static [&'static str] {
                &[]
            }
        }
        register("custom_modules_register_and_are_dropped_by_finalize_dummy", Arc::new(Dummy));
        assert!(capabilities("custom_modules_register_and_are_dropped_by_finalize_dummy").is_ok());

        finalize();

        assert!(capabilities("custom_modules_register_and_are_dropped_by_finalize_dummy").is_err());
        assert!(capabilities("inmemory").is_ok());
    }
}
