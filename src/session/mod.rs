//! The per-session request/response state machine and query pipeline
//! (spec §4.7) — the component every other module (rules, storage, lru,
//! engine) exists to serve.

pub mod config;
pub mod filter;
pub mod state;

pub use config::{
    CacheConfig, CacheInTransactions, CachedData, SelectsMode, UsersMode, CACHE_DEBUG_DECISIONS,
    CACHE_DEBUG_MATCHING, CACHE_DEBUG_NON_MATCHING, CACHE_DEBUG_NON_USE, CACHE_DEBUG_USE,
};
pub use filter::{BackendOutcome, ClientCommand, ClientPacket, FilterAction, ResponseAction, SessionFilter};
pub use state::{CacheAction, SessionState};
