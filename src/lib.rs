//! Query-result caching filter for a MySQL/MariaDB proxy.
//!
//! A [`session::SessionFilter`] sits between a client connection and the
//! backend: it classifies each statement, consults a [`engine::CacheEngine`]
//! (one [`rules::RuleSet`] group, one [`lru::LruStorage`]-wrapped
//! [`storage::Storage`] backend) and tells its host whether to serve a
//! cached response, forward the request, or both. Wire-protocol framing —
//! reading packets off a socket, the backend connection itself — is a
//! host concern and stays outside this crate (§1).

pub mod bootstrap;
pub mod clock;
pub mod engine;
pub mod error;
pub mod key;
pub mod lru;
pub mod parser;
pub mod rules;
pub mod session;
pub mod storage;
pub mod testkit;

pub use error::{CacheError, Result};
pub use key::CacheKey;
pub use session::{CacheConfig, SessionFilter};
