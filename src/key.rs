//! Cache key generation (spec §4.1).
//!
//! A [`CacheKey`] identifies one cached response: the account it was
//! produced for (`user`/`host`, both empty for a non-user-specific cache)
//! plus two 64-bit fingerprints of the statement itself. `data_hash` covers
//! the default database and query bytes only, so two different accounts
//! that happen to run the identical query share the same `data_hash` but
//! never collide on the key as a whole, because `full_hash` folds in the
//! account too and equality compares every field.

use crc::{Crc, CRC_64_XZ};

static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

/// Stable, 4-tuple identity of a cached response.
///
/// Equality and hashing: equality compares all four fields; `Hash` is
/// derived from `full_hash` alone, matching the spec's "hashing uses
/// `full_hash`" contract while keeping equality exact (hash collisions
/// on `full_hash` do not make two different accounts/queries equal).
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    pub user: String,
    pub host: String,
    pub data_hash: u64,
    pub full_hash: u64,
}

impl CacheKey {
    /// Computes the key for `(user, host)` running `query` against
    /// `default_db`. An empty `user` must be paired with an empty `host`
    /// (and vice versa) — that invariant is the caller's responsibility
    /// (the session filter only ever passes both or neither); this
    /// function does not itself enforce it so it stays a pure,
    /// infallible computation as the spec requires.
    pub fn new(user: &str, host: &str, default_db: &str, query: &[u8]) -> Self {
        let mut digest = CRC64.digest();
        digest.update(default_db.as_bytes());
        digest.update(query);
        let data_hash = digest.finalize();

        let mut digest = CRC64.digest();
        digest.update(default_db.as_bytes());
        digest.update(query);
        digest.update(user.as_bytes());
        digest.update(host.as_bytes());
        let full_hash = digest.finalize();

        CacheKey {
            user: user.to_string(),
            host: host.to_string(),
            data_hash,
            full_hash,
        }
    }

    /// Wire form used by remote storages: `user || host || data_hash(LE) ||
    /// full_hash(LE)`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.user.len() + self.host.len() + 16);
        buf.extend_from_slice(self.user.as_bytes());
        buf.extend_from_slice(self.host.as_bytes());
        buf.extend_from_slice(&self.data_hash.to_le_bytes());
        buf.extend_from_slice(&self.full_hash.to_le_bytes());
        buf
    }

    /// A printable identifier suitable for use as a remote-storage key
    /// string (hex of [`Self::to_bytes`]).
    pub fn to_hex(&self) -> String {
        self.to_bytes().iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.user == other.user
            && self.host == other.host
            && self.data_hash == other.data_hash
            && self.full_hash == other.full_hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.full_hash.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_same_inputs_same_key() {
        let k1 = CacheKey::new("bob", "%", "test", b"SELECT * FROM t");
        let k2 = CacheKey::new("bob", "%", "test", b"SELECT * FROM t");
        assert_eq!(k1, k2);
        assert_eq!(k1.full_hash, k2.full_hash);
    }

    #[test]
    fn different_users_never_collide_even_if_data_hash_matches() {
        let k1 = CacheKey::new("alice", "%", "test", b"SELECT 1");
        let k2 = CacheKey::new("bob", "%", "test", b"SELECT 1");
        assert_eq!(k1.data_hash, k2.data_hash);
        assert_ne!(k1, k2);
        assert_ne!(k1.full_hash, k2.full_hash);
    }

    #[test]
    fn different_query_different_key() {
        let k1 = CacheKey::new("", "", "test", b"SELECT 1");
        let k2 = CacheKey::new("", "", "test", b"SELECT 2");
        assert_ne!(k1, k2);
    }

    #[test]
    fn to_bytes_round_trips_fields() {
        let k = CacheKey::new("bob", "localhost", "db", b"SELECT 1");
        let bytes = k.to_bytes();
        assert_eq!(bytes.len(), "bob".len() + "localhost".len() + 16);
    }

    #[test]
    fn stable_across_repeated_calls_from_multiple_threads() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| CacheKey::new("u", "h", "db", b"SELECT * FROM t WHERE x=1")))
            .collect();
        let keys: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for k in &keys[1..] {
            assert_eq!(k, &keys[0]);
        }
    }
}
