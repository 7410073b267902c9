//! Crate-wide error type.
//!
//! This is deliberately narrow: the cache contract (§4.3 of the spec) has
//! its own non-exceptional result type, [`crate::storage::CacheResult`],
//! for the routine OK/NOT_FOUND/PENDING/ERROR/OUT_OF_RESOURCES outcomes a
//! get/put/invalidate can have. `CacheError` is reserved for the smaller
//! set of things that are fatal to loading or constructing something:
//! a malformed rules document, a storage plugin that refuses to start, a
//! config value that fails validation.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("rules document error: {0}")]
    Rules(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("SQL parse error: {0}")]
    SqlParse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("out of resources: {0}")]
    OutOfResources(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Rules(e.to_string())
    }
}

impl From<regex::Error> for CacheError {
    fn from(e: regex::Error) -> Self {
        CacheError::Rules(e.to_string())
    }
}
