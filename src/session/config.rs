//! Session-filter configuration (spec §3 `CacheConfig`, §6).

use crate::error::Result;
use crate::storage::InvalidationMode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheInTransactions {
    Never,
    ReadOnlyTransactions,
    AllTransactions,
}

impl CacheInTransactions {
    fn level(self) -> u8 {
        match self {
            CacheInTransactions::Never => 0,
            CacheInTransactions::ReadOnlyTransactions => 1,
            CacheInTransactions::AllTransactions => 2,
        }
    }

    /// Whether `self` is at least as permissive as `other` (spec §4.7
    /// step 1: "`cache_in_transactions ≥ read_only_transactions`").
    pub fn at_least(self, other: CacheInTransactions) -> bool {
        self.level() >= other.level()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectsMode {
    AssumeCacheable,
    VerifyCacheable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsersMode {
    Isolated,
    Mixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachedData {
    Shared,
    ThreadSpecific,
}

/// Recognised options for the cache filter (spec §3 `CacheConfig`, §6).
/// A plain `serde`-deserializable struct so a host can load it from
/// whatever document format it uses; this crate does not itself read a
/// config file (§1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Name of the storage plugin (`inmemory`, `memcached`, `redis`, …),
    /// looked up in [`crate::storage::registry`] when building the
    /// engine this config describes.
    pub storage: String,
    /// Arguments to the storage plugin named by `storage`, passed
    /// through unexamined to [`crate::storage::registry::create_storage`].
    pub storage_options: serde_json::Value,
    /// Path to the rules document (empty means no rules document — the
    /// engine is built with a single always-store/always-use `RuleSet`).
    pub rules: String,
    pub hard_ttl: Duration,
    pub soft_ttl: Duration,
    pub max_resultset_rows: u64,
    pub max_resultset_size: u64,
    pub max_count: u64,
    pub max_size: u64,
    pub debug: u32,
    pub cached_data: CachedData,
    pub selects: SelectsMode,
    pub cache_in_transactions: CacheInTransactions,
    pub invalidate: InvalidationMode,
    pub clear_cache_on_parse_errors: bool,
    pub enabled: bool,
    pub users: UsersMode,
    pub timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            storage: "inmemory".to_string(),
            storage_options: serde_json::Value::Null,
            rules: String::new(),
            hard_ttl: Duration::from_secs(0),
            soft_ttl: Duration::from_secs(0),
            max_resultset_rows: 0,
            max_resultset_size: 0,
            max_count: 0,
            max_size: 0,
            debug: 0,
            cached_data: CachedData::Shared,
            selects: SelectsMode::AssumeCacheable,
            cache_in_transactions: CacheInTransactions::Never,
            invalidate: InvalidationMode::Never,
            clear_cache_on_parse_errors: false,
            enabled: true,
            users: UsersMode::Mixed,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Debug bitmask values (SPEC_FULL §B, recovered from `cache.hh`).
pub const CACHE_DEBUG_MATCHING: u32 = 1;
pub const CACHE_DEBUG_NON_MATCHING: u32 = 2;
pub const CACHE_DEBUG_USE: u32 = 4;
pub const CACHE_DEBUG_NON_USE: u32 = 8;
pub const CACHE_DEBUG_DECISIONS: u32 = 16;

impl CacheConfig {
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let mut config: CacheConfig = serde_json::from_value(value)
            .map_err(|e| crate::error::CacheError::Configuration(e.to_string()))?;
        config.validate();
        Ok(config)
    }

    /// Applies the clamps spec §3 requires, logging a warning for each
    /// one actually applied.
    pub fn validate(&mut self) {
        if !self.hard_ttl.is_zero() && self.soft_ttl > self.hard_ttl {
            tracing::warn!(
                soft_ttl_ms = self.soft_ttl.as_millis() as u64,
                hard_ttl_ms = self.hard_ttl.as_millis() as u64,
                "soft_ttl > hard_ttl, clamping soft_ttl down to hard_ttl"
            );
            self.soft_ttl = self.hard_ttl;
        }
        if self.max_resultset_size == 0 && self.max_size != 0 {
            self.max_resultset_size = self.max_size;
        }
        if self.max_size != 0 && self.max_resultset_size != 0 && self.max_resultset_size > self.max_size
        {
            tracing::warn!(
                max_resultset_size = self.max_resultset_size,
                max_size = self.max_size,
                "max_resultset_size > max_size, clamping down to max_size"
            );
            self.max_resultset_size = self.max_size;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soft_ttl_clamped_down_to_hard_ttl() {
        let mut c = CacheConfig {
            soft_ttl: Duration::from_secs(10),
            hard_ttl: Duration::from_secs(5),
            ..CacheConfig::default()
        };
        c.validate();
        assert_eq!(c.soft_ttl, Duration::from_secs(5));
    }

    #[test]
    fn zero_hard_ttl_means_unlimited_no_clamp() {
        let mut c = CacheConfig {
            soft_ttl: Duration::from_secs(10),
            hard_ttl: Duration::from_secs(0),
            ..CacheConfig::default()
        };
        c.validate();
        assert_eq!(c.soft_ttl, Duration::from_secs(10));
    }

    #[test]
    fn max_resultset_size_defaults_to_max_size() {
        let mut c = CacheConfig { max_size: 1000, max_resultset_size: 0, ..CacheConfig::default() };
        c.validate();
        assert_eq!(c.max_resultset_size, 1000);
    }

    #[test]
    fn max_resultset_size_clamped_down_to_max_size() {
        let mut c =
            CacheConfig { max_size: 100, max_resultset_size: 500, ..CacheConfig::default() };
        c.validate();
        assert_eq!(c.max_resultset_size, 100);
    }
}
