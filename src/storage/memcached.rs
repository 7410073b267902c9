//! The memcached-like remote storage (spec §4.6).
//!
//! No memcached client crate is present anywhere in this crate's
//! dependency corpus, so rather than fabricate one this is a small
//! hand-rolled client over the real memcached text protocol
//! (`set`/`get`/`delete`), grounded in the teacher's own hand-rolled wire
//! handling in `network/server.rs`/`network/protocol.rs`. Semantics
//! follow `original_source/.../memcachedstorage.cc`: the backend's own
//! expiry (seconds, rounded up) is used for TTL, and a sub-second
//! hard-TTL is re-checked against a stored timestamp prefix on every
//! read (§9 Q3 — replicated as specified, see `DESIGN.md`).
//!
//! Invalidation is not supported by the memcached protocol itself; like
//! [`crate::storage::inmemory::InMemoryStorage`], it fails with
//! `OUT_OF_RESOURCES` and relies on the LRU wrapper when invalidation is
//! required.

use crate::clock::Clock;
use crate::key::CacheKey;
use crate::storage::{CacheResult, Capabilities, GetFlags, Storage, StorageConfig, StorageKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Per-connection reconnect state: a connection failure flips the token
/// to disconnected, and subsequent calls fail fast until a timed
/// reconnect attempt succeeds (spec §4.6).
struct Connection {
    stream: Option<BufReader<TcpStream>>,
    attempts: u32,
    next_attempt_ms: u64,
}

pub struct MemcachedStorage {
    config: StorageConfig,
    clock: Arc<dyn Clock>,
    addr: String,
    conn: Mutex<Connection>,
    consecutive_errors: AtomicU32,
}

impl MemcachedStorage {
    pub fn new(config: StorageConfig, clock: Arc<dyn Clock>, addr: String) -> Self {
        MemcachedStorage {
            config,
            clock,
            addr,
            conn: Mutex::new(Connection { stream: None, attempts: 0, next_attempt_ms: 0 }),
            consecutive_errors: AtomicU32::new(0),
        }
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

    /// `min(timeout * 2^attempts, 60s)` (SPEC_FULL §E, recovered from the
    /// redis/memcached reconnect backoff in `original_source/`), with a
    /// small random jitter so a thundering herd of connections that all
    /// dropped together doesn't retry in lockstep.
    fn backoff(&self, attempts: u32) -> Duration {
        let base = self.config.remote_timeout.as_millis() as u64;
        let scaled = base.saturating_mul(1u64 << attempts.min(20)).min(60_000);
        let jitter = rand::rng().random_range(0..=scaled / 10 + 1);
        Duration::from_millis(scaled + jitter)
    }

    async fn ensure_connected(&self) -> Result<(), ()> {
        let now = self.clock.now_ms();
        let needs_connect = {
            let conn = self.conn.lock();
            conn.stream.is_none() && now >= conn.next_attempt_ms
        };
        if !needs_connect {
            let has_stream = self.conn.lock().stream.is_some();
            return if has_stream { Ok(()) } else { Err(()) };
        }

        match TcpStream::connect(&self.addr).await {
            Ok(stream) => {
                let mut conn = self.conn.lock();
                conn.stream = Some(BufReader::new(stream));
                conn.attempts = 0;
                self.consecutive_errors.store(0, Ordering::SeqCst);
                Ok(())
            }
            Err(_) => {
                let mut conn = self.conn.lock();
                conn.attempts += 1;
                conn.next_attempt_ms = now + self.backoff(conn.attempts).as_millis() as u64;
                Err(())
            }
        }
    }

    fn drop_connection(&self) {
        self.conn.lock().stream = None;
    }

    /// Takes the connection's stream out of the mutex for the duration
    /// of one request/response round trip (never held across an
    /// `.await` point), and puts it back on success.
    async fn send_command(&self, line: &str, payload: Option<&[u8]>) -> Result<String, ()> {
        self.ensure_connected().await?;
        let Some(mut stream) = self.conn.lock().stream.take() else { return Err(()) };

        let outcome: Result<String, ()> = async {
            stream.write_all(line.as_bytes()).await.map_err(|_| ())?;
            if let Some(p) = payload {
                stream.write_all(p).await.map_err(|_| ())?;
                stream.write_all(b"\r\n").await.map_err(|_| ())?;
            }
            stream.flush().await.map_err(|_| ())?;
            let mut reply = String::new();
            stream.read_line(&mut reply).await.map_err(|_| ())?;
            Ok(reply)
        }
        .await;

        match outcome {
            Ok(reply) => {
                self.conn.lock().stream = Some(stream);
                self.consecutive_errors.store(0, Ordering::SeqCst);
                Ok(reply)
            }
            Err(()) => {
                self.drop_connection();
                self.consecutive_errors.fetch_add(1, Ordering::SeqCst);
                Err(())
            }
        }
    }

    fn wire_key(key: &CacheKey) -> String {
        key.to_hex()
    }
}

#[async_trait]
impl Storage for MemcachedStorage {
    fn config(&self) -> &StorageConfig {
        &self.config
    }

    fn kind(&self) -> StorageKind {
        StorageKind::Shared
    }

    async fn get_value(
        &self,
        key: &CacheKey,
        flags: GetFlags,
        soft_ttl: Option<Duration>,
        hard_ttl: Option<Duration>,
    ) -> (CacheResult, Option<Vec<u8>>) {
        let wkey = Self::wire_key(key);
        let Ok(reply) = self.send_command(&format!("get {wkey}\r\n"), None).await else {
            return (CacheResult::error(), None);
        };
        if reply.starts_with("END") || reply.trim().is_empty() {
            return (CacheResult::not_found(), None);
        }

        // VALUE <key> <flags> <bytes> <stored_ms>\r\n<data>\r\nEND\r\n
        let parts: Vec<&str> = reply.split_whitespace().collect();
        let Some(len_str) = parts.get(3) else { return (CacheResult::error(), None) };
        let Ok(len) = len_str.parse::<usize>() else { return (CacheResult::error(), None) };
        let stored_ms: u64 = parts.get(4).and_then(|s| s.parse().ok()).unwrap_or(0);

        let Some(mut stream) = self.conn.lock().stream.take() else {
            return (CacheResult::error(), None);
        };
        let mut buf = vec![0u8; len + 2];
        let read_ok = tokio::io::AsyncReadExt::read_exact(&mut stream, &mut buf).await.is_ok();
        let mut trailer = String::new();
        let _ = stream.read_line(&mut trailer).await;
        self.conn.lock().stream = Some(stream);
        if !read_ok {
            return (CacheResult::error(), None);
        }
        buf.truncate(len);

        let hard_ttl = hard_ttl.unwrap_or(self.config.hard_ttl);
        let soft_ttl = soft_ttl.unwrap_or(self.config.soft_ttl);
        let age_ms = self.clock.now_ms().saturating_sub(stored_ms);

        let hard_ms = hard_ttl.as_millis() as u64;
        if hard_ms > 0 && age_ms > hard_ms {
            let _ = self.del_value(key).await;
            return (CacheResult::discarded(), None);
        }

        let soft_ms = soft_ttl.as_millis() as u64;
        if soft_ms > 0 && age_ms > soft_ms {
            if flags.include_stale {
                return (CacheResult::ok_stale(), Some(buf));
            }
            return (CacheResult::not_found_stale(), None);
        }

        (CacheResult::ok(), Some(buf))
    }

    async fn put_value(&self, key: &CacheKey, value: &[u8], _invalidation_words: &[String]) -> CacheResult {
        let wkey = Self::wire_key(key);
        let stored_ms = self.clock.now_ms();
        let mut payload = format!("{stored_ms} ").into_bytes();
        payload.extend_from_slice(value);

        let exptime_secs = {
            let hard = self.config.hard_ttl.as_secs();
            if hard == 0 { 0 } else { hard.max(1) }
        };
        let line = format!("set {} 0 {} {}\r\n", wkey, exptime_secs, payload.len());
        match self.send_command(&line, Some(&payload)).await {
            Ok(reply) if reply.trim() == "STORED" => CacheResult::ok(),
            Ok(_) => CacheResult::error(),
            Err(()) => CacheResult::out_of_resources(),
        }
    }

    async fn del_value(&self, key: &CacheKey) -> CacheResult {
        let wkey = Self::wire_key(key);
        match self.send_command(&format!("delete {wkey}\r\n"), None).await {
            Ok(_) => CacheResult::ok(),
            Err(()) => CacheResult::error(),
        }
    }

    async fn invalidate(&self, _words: &[String]) -> CacheResult {
        CacheResult::out_of_resources()
    }

    async fn clear(&self) -> CacheResult {
        match self.send_command("flush_all\r\n", None).await {
            Ok(_) => CacheResult::ok(),
            Err(()) => CacheResult::error(),
        }
    }

    async fn size(&self) -> (CacheResult, u64) {
        (CacheResult::out_of_resources(), 0)
    }

    async fn item_count(&self) -> (CacheResult, u64) {
        (CacheResult::out_of_resources(), 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    /// The jitter added on top means exact equality would be flaky; assert
    /// the base grows exponentially and the result always lands in
    /// `[base, base + 10%]`, capped at one minute.
    #[test]
    fn backoff_grows_and_caps_at_one_minute() {
        let clock = Arc::new(ManualClock::new());
        let config = StorageConfig { remote_timeout: Duration::from_millis(500), ..StorageConfig::default() };
        let storage = MemcachedStorage::new(config, clock, "127.0.0.1:0".to_string());
        let assert_in_range = |attempts: u32, base_ms: u64| {
            let d = storage.backoff(attempts).as_millis() as u64;
            assert!(d >= base_ms && d <= base_ms + base_ms / 10 + 1, "{d} not in range for base {base_ms}");
        };
        assert_in_range(0, 500);
        assert_in_range(1, 1000);
        assert_in_range(2, 2000);
        assert_in_range(20, 60_000);
    }
}
