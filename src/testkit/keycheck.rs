//! Utilities to assert `CacheKey` determinism across repeated
//! construction and across threads (spec §8 testable property 6),
//! recovered from `original_source/.../test/testkeygeneration.cc` and
//! `.../test/keycheck.cc`.

use crate::key::CacheKey;
use std::sync::Arc;
use std::thread;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCheckInput {
    pub user: String,
    pub host: String,
    pub default_db: String,
    pub query: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCheckReport {
    pub input: KeyCheckInput,
    pub key_hex: String,
    pub stable_within_process: bool,
    pub stable_across_threads: bool,
}

impl KeyCheckReport {
    pub fn is_ok(&self) -> bool {
        self.stable_within_process && self.stable_across_threads
    }
}

/// Constructs `CacheKey` from `input` `iterations` times in this thread
/// and `threads` more times concurrently, confirming every one is equal.
pub fn check(input: KeyCheckInput, iterations: usize, threads: usize) -> KeyCheckReport {
    let expected = CacheKey::new(&input.user, &input.host, &input.default_db, &input.query);

    let stable_within_process =
        (0..iterations).all(|_| CacheKey::new(&input.user, &input.host, &input.default_db, &input.query) == expected);

    let shared = Arc::new(input.clone());
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let shared = shared.clone();
            let expected = expected.clone();
            thread::spawn(move || {
                CacheKey::new(&shared.user, &shared.host, &shared.default_db, &shared.query) == expected
            })
        })
        .collect();
    let stable_across_threads = handles.into_iter().all(|h| h.join().unwrap_or(false));

    KeyCheckReport {
        key_hex: expected.to_hex(),
        input,
        stable_within_process,
        stable_across_threads,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_input_reports_ok() {
        let input = KeyCheckInput {
            user: "bob".to_string(),
            host: "10.0.0.1".to_string(),
            default_db: "app".to_string(),
            query: b"SELECT 1".to_vec(),
        };
        let report = check(input, 50, 8);
        assert!(report.is_ok());
        // hex-encoded user||host||data_hash(8)||full_hash(8)
        assert_eq!(report.key_hex.len(), ("bob".len() + "10.0.0.1".len() + 16) * 2);
    }
}
