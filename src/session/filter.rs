//! Per-session query pipeline and response path (spec §4.7).
//!
//! Wire-protocol framing (reading a packet off the socket, reassembling
//! the backend's reply) is out of scope (§1) and stays with the host; a
//! [`SessionFilter`] only ever sees the already-decoded shapes in this
//! module and tells its caller what to do next via [`FilterAction`] /
//! [`ResponseAction`] — the "narrow contract" §6 calls for.

use crate::engine::{CacheEngine, SessionId, Token, WorkerId};
use crate::key::CacheKey;
use crate::parser::{self, StatementKind};
use crate::session::config::{
    CacheInTransactions, CacheConfig, SelectsMode, UsersMode, CACHE_DEBUG_DECISIONS, CACHE_DEBUG_MATCHING,
    CACHE_DEBUG_NON_MATCHING, CACHE_DEBUG_NON_USE, CACHE_DEBUG_USE,
};
use crate::session::state::{CacheAction, SessionState};
use crate::storage::GetFlags;
use bytes::BytesMut;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::Span;
use uuid::Uuid;

/// Functions MySQL documents as non-deterministic; a SELECT referencing
/// one is never cacheable under `selects = verify_cacheable` (spec §4.7
/// step 3).
const NON_CACHEABLE_FUNCTIONS: &[&str] = &[
    "now",
    "curdate",
    "curtime",
    "current_timestamp",
    "current_date",
    "current_time",
    "localtime",
    "localtimestamp",
    "sysdate",
    "unix_timestamp",
    "rand",
    "uuid",
    "uuid_short",
    "connection_id",
    "last_insert_id",
    "found_rows",
    "row_count",
    "sleep",
    "benchmark",
    "get_lock",
    "release_lock",
    "is_free_lock",
    "is_used_lock",
];

/// An already-decoded client request the filter acts on.
#[derive(Debug, Clone)]
pub enum ClientCommand {
    /// `COM_INIT_DB` / `USE <db>`.
    InitDb(String),
    /// `COM_STMT_PREPARE` / `COM_STMT_EXECUTE` and friends: forwarded
    /// untouched, the cache is never consulted for prepared statements
    /// (spec §1 Non-goals: binary protocol support is out of scope).
    Prepare,
    Execute,
    /// `COM_QUERY` carrying `sql`.
    Query(String),
    Other,
}

#[derive(Debug, Clone)]
pub struct ClientPacket {
    pub command: ClientCommand,
    /// True for a packet that is a wire-level continuation of an
    /// already-dispatched multi-packet command (e.g. more `LOAD DATA
    /// LOCAL INFILE` payload) and so must bypass the queue to preserve
    /// framing (spec §4.7, §5).
    pub is_continuation: bool,
}

/// What the caller should do with a just-handled client packet.
#[derive(Debug, Clone)]
pub enum FilterAction {
    /// Serve the client directly from cache; the session is already
    /// back in `EXPECTING_NOTHING`.
    ReplyFromCache(Vec<u8>),
    /// Forward the packet to the backend unchanged; a response is
    /// expected and must be driven through `on_response_chunk` /
    /// `on_response_complete`.
    Forward,
    /// Queued behind an in-flight request (spec §4.7, §5); `pop_queued`
    /// will return it once the in-flight response completes.
    Queued,
}

/// How the backend's completed response is classified (spec §4.7
/// "Response path").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendOutcome {
    Ok,
    Error,
    ResultSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseAction {
    /// Ordinary completion; any caching/invalidation side effects have
    /// already run.
    Flush,
    /// A `clear` triggered by this response failed; caching has been
    /// disabled for the rest of this session (spec §7).
    FlushAndDisableCaching,
}

pub struct SessionFilter {
    engine: Arc<CacheEngine>,
    config: CacheConfig,
    worker: WorkerId,
    session_id: SessionId,

    user: String,
    host: String,
    default_db: String,
    pending_use_db: Option<String>,

    state: SessionState,
    current_key: Option<CacheKey>,
    current_populate: bool,
    response_buffer: BytesMut,
    response_rows: u64,
    tables: HashSet<String>,

    use_enabled: bool,
    populate_enabled: bool,
    soft_ttl: Duration,
    hard_ttl: Duration,
    invalidate_static: bool,
    invalidate_now: bool,
    clear_cache: bool,
    refreshing: bool,

    in_transaction: bool,
    is_read_only_trx: bool,
    declared_read_only_trx: bool,
    autocommit: bool,

    user_specific: bool,

    processing: bool,
    queue: VecDeque<ClientPacket>,

    /// Per-session scope for the debug-bitmask trace logging below (spec
    /// SPEC_FULL §B); entered around individual log calls rather than
    /// held open across an `.await`.
    span: Span,
}

impl SessionFilter {
    pub fn new(
        engine: Arc<CacheEngine>,
        config: CacheConfig,
        worker: WorkerId,
        user: impl Into<String>,
        host: impl Into<String>,
        default_db: impl Into<String>,
    ) -> Self {
        let invalidate_static = !matches!(config.invalidate, crate::storage::InvalidationMode::Never);
        let user_specific = matches!(config.users, UsersMode::Isolated);
        let soft_ttl = config.soft_ttl;
        let hard_ttl = config.hard_ttl;
        let populate_enabled = config.enabled;
        let use_enabled = config.enabled;
        let session_id = Uuid::new_v4();
        let user = user.into();
        let host = host.into();
        let span = tracing::info_span!("cache_session", %session_id, user = %user, host = %host, worker);
        SessionFilter {
            engine,
            config,
            worker,
            session_id,
            user,
            host,
            default_db: default_db.into(),
            pending_use_db: None,
            state: SessionState::ExpectingNothing,
            current_key: None,
            current_populate: false,
            response_buffer: BytesMut::new(),
            response_rows: 0,
            tables: HashSet::new(),
            use_enabled,
            populate_enabled,
            soft_ttl,
            hard_ttl,
            invalidate_static,
            invalidate_now: false,
            clear_cache: false,
            refreshing: false,
            in_transaction: false,
            is_read_only_trx: true,
            declared_read_only_trx: false,
            autocommit: true,
            user_specific,
            processing: false,
            queue: VecDeque::new(),
            span,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether a given `CACHE_DEBUG_*` bit (spec SPEC_FULL §B) is set in
    /// this session's configured debug mask.
    fn debug_enabled(&self, bit: u32) -> bool {
        self.config.debug & bit != 0
    }

    /// `@maxscale.cache.populate` override (SPEC_FULL §E).
    pub fn set_populate_override(&mut self, enabled: bool) {
        self.populate_enabled = enabled;
    }

    /// `@maxscale.cache.use` override (SPEC_FULL §E).
    pub fn set_use_override(&mut self, enabled: bool) {
        self.use_enabled = enabled;
    }

    pub fn set_soft_ttl_override(&mut self, secs: u64) {
        self.soft_ttl = Duration::from_secs(secs);
    }

    pub fn set_hard_ttl_override(&mut self, secs: u64) {
        self.hard_ttl = Duration::from_secs(secs);
    }

    fn account_user(&self) -> &str {
        if self.user_specific {
            &self.user
        } else {
            ""
        }
    }

    fn account_host(&self) -> &str {
        if self.user_specific {
            &self.host
        } else {
            ""
        }
    }

    /// `0` means "defer to the storage's own configured TTL" (spec §3);
    /// only a genuinely positive session-level value overrides it.
    fn effective_soft_ttl(&self) -> Option<Duration> {
        if self.soft_ttl.is_zero() {
            None
        } else {
            Some(self.soft_ttl)
        }
    }

    fn effective_hard_ttl(&self) -> Option<Duration> {
        if self.hard_ttl.is_zero() {
            None
        } else {
            Some(self.hard_ttl)
        }
    }

    /// Dispatches one client packet (spec §4.7 "Command dispatch"). If a
    /// request is already in flight, the packet is queued unless it is a
    /// wire-level continuation of that in-flight request.
    pub async fn handle_packet(&mut self, packet: ClientPacket) -> FilterAction {
        if self.processing {
            if packet.is_continuation {
                return FilterAction::Forward;
            }
            self.queue.push_back(packet);
            return FilterAction::Queued;
        }
        self.processing = true;

        match packet.command.clone() {
            ClientCommand::InitDb(db) => {
                self.pending_use_db = Some(db);
                self.state = SessionState::ExpectingUseResponse;
                FilterAction::Forward
            }
            ClientCommand::Prepare | ClientCommand::Execute | ClientCommand::Other => {
                self.current_populate = false;
                self.current_key = None;
                self.state = SessionState::IgnoringResponse;
                FilterAction::Forward
            }
            ClientCommand::Query(sql) => self.handle_query(sql).await,
        }
    }

    /// Pops the next packet queued behind an in-flight request, if any
    /// (spec §5). The caller re-drives it through `handle_packet` once
    /// the session is back in `EXPECTING_NOTHING`.
    pub fn pop_queued(&mut self) -> Option<ClientPacket> {
        self.queue.pop_front()
    }

    fn maybe_update_autocommit(&mut self, sql: &str) {
        let upper = sql.trim_start().to_ascii_uppercase();
        if !upper.starts_with("SET") || !upper.contains("AUTOCOMMIT") {
            return;
        }
        if upper.contains('0') || upper.contains("OFF") || upper.contains("FALSE") {
            self.autocommit = false;
        } else if upper.contains('1') || upper.contains("ON") || upper.contains("TRUE") {
            self.autocommit = true;
        }
    }

    /// Spec §4.7 step 1: transaction-state bookkeeping and the
    /// cache-in-transactions decision table.
    fn transaction_action(&mut self, kind: StatementKind, sql: &str) -> CacheAction {
        if kind == StatementKind::Begin {
            self.in_transaction = true;
            self.is_read_only_trx = true;
            self.declared_read_only_trx = sql.to_ascii_uppercase().contains("READ ONLY");
            return CacheAction::IGNORE;
        }

        if kind == StatementKind::Commit || is_rollback(sql) {
            self.in_transaction = false;
            self.is_read_only_trx = true;
            self.declared_read_only_trx = false;
            return CacheAction::IGNORE;
        }

        if !self.in_transaction {
            return CacheAction::USE_AND_POPULATE;
        }

        if !self.is_read_only_trx {
            return CacheAction::IGNORE;
        }

        if self.declared_read_only_trx {
            if self.config.cache_in_transactions.at_least(CacheInTransactions::ReadOnlyTransactions) {
                CacheAction::USE_AND_POPULATE
            } else {
                CacheAction::POPULATE
            }
        } else if self.config.cache_in_transactions == CacheInTransactions::AllTransactions {
            CacheAction::USE_AND_POPULATE
        } else {
            CacheAction::POPULATE
        }
    }

    /// The full query pipeline (spec §4.7 steps 1-5).
    async fn handle_query(&mut self, sql: String) -> FilterAction {
        self.maybe_update_autocommit(&sql);

        if parser::is_multi_statement(&sql) {
            self.current_populate = false;
            self.current_key = None;
            self.state = SessionState::IgnoringResponse;
            return FilterAction::Forward;
        }

        let kind = parser::classify(&sql);
        let mut action = self.transaction_action(kind, &sql);

        if kind == StatementKind::Commit && self.invalidate_static {
            self.invalidate_now = true;
        }

        if kind == StatementKind::Select
            && self.config.selects == SelectsMode::VerifyCacheable
            && !is_verified_cacheable(&sql)
        {
            action = CacheAction::IGNORE;
        }

        if matches!(kind, StatementKind::Dralter | StatementKind::Dupsert) {
            self.handle_dml_invalidation(kind, &sql);
            self.is_read_only_trx = false;
            action = CacheAction::IGNORE;
        } else if kind == StatementKind::Select {
            // A populated entry is tagged with the tables *it* reads, so a
            // later DML on any of them can invalidate it (spec §4.2
            // GLOSSARY "invalidation word").
            if let Some(refs) = parser::extract_refs(&sql) {
                for t in refs.tables {
                    let db = t.database.unwrap_or_else(|| self.default_db.clone());
                    self.tables.insert(format!("{db}.{}", t.table));
                }
            }
        }

        action = action.mask(self.use_enabled, self.populate_enabled);

        if action.can_use || action.can_populate {
            let rule_set = self.engine.should_store(self.worker, &self.default_db, &sql);
            match rule_set {
                None => {
                    if self.debug_enabled(CACHE_DEBUG_NON_MATCHING) {
                        tracing::trace!(parent: &self.span, sql = %sql, "no store-rule matched this statement");
                    }
                    action = CacheAction::IGNORE;
                }
                Some(rs) => {
                    if self.debug_enabled(CACHE_DEBUG_MATCHING) {
                        tracing::trace!(parent: &self.span, sql = %sql, "store-rule matched this statement");
                    }
                    if action.can_use && !rs.should_use(self.account_user(), self.account_host()) {
                        if self.debug_enabled(CACHE_DEBUG_NON_USE) {
                            tracing::trace!(
                                parent: &self.span,
                                user = self.account_user(),
                                host = self.account_host(),
                                "use-rule rejected this account; populate only"
                            );
                        }
                        action.can_use = false;
                    } else if action.can_use && self.debug_enabled(CACHE_DEBUG_USE) {
                        tracing::trace!(
                            parent: &self.span,
                            user = self.account_user(),
                            host = self.account_host(),
                            "use-rule accepted this account"
                        );
                    }
                }
            }
        }

        if self.debug_enabled(CACHE_DEBUG_DECISIONS) {
            tracing::trace!(parent: &self.span, can_use = action.can_use, can_populate = action.can_populate, "final cache decision");
        }

        if action.can_use {
            return self.try_cache_lookup(action, &sql).await;
        }

        if action.can_populate {
            let key = self.engine.get_key(self.account_user(), self.account_host(), &self.default_db, sql.as_bytes());
            self.current_key = Some(key);
            self.current_populate = true;
            self.state = SessionState::ExpectingResponse;
            return FilterAction::Forward;
        }

        self.current_key = None;
        self.current_populate = false;
        self.state = SessionState::IgnoringResponse;
        FilterAction::Forward
    }

    fn handle_dml_invalidation(&mut self, kind: StatementKind, sql: &str) {
        if !self.invalidate_static {
            return;
        }
        match parser::extract_refs(sql) {
            Some(refs) => {
                for t in refs.tables {
                    let db = t.database.unwrap_or_else(|| self.default_db.clone());
                    self.tables.insert(format!("{db}.{}", t.table));
                }
            }
            None => {
                if self.config.clear_cache_on_parse_errors {
                    self.clear_cache = true;
                    self.invalidate_now = true;
                } else {
                    tracing::warn!(
                        kind = ?kind,
                        "unparseable statement under invalidation; skipping invalidation for it"
                    );
                }
            }
        }
        match kind {
            StatementKind::Dralter => self.invalidate_now = true,
            StatementKind::Dupsert if !self.in_transaction && self.autocommit => self.invalidate_now = true,
            _ => {}
        }
    }

    async fn try_cache_lookup(&mut self, action: CacheAction, sql: &str) -> FilterAction {
        let key = self.engine.get_key(self.account_user(), self.account_host(), &self.default_db, sql.as_bytes());
        self.current_key = Some(key.clone());
        let flags = GetFlags { include_stale: true };
        let (result, value) = self
            .engine
            .get_value(self.worker, Token::null(), &key, flags, self.effective_soft_ttl(), self.effective_hard_ttl())
            .await;

        if result.is_ok() && !result.stale {
            self.reset_to_idle();
            return FilterAction::ReplyFromCache(value.unwrap_or_default());
        }

        if result.is_ok() && result.stale {
            if self.engine.must_refresh(self.worker, &key, self.session_id) {
                self.refreshing = true;
                self.current_populate = true;
                self.state = SessionState::ExpectingResponse;
                return FilterAction::Forward;
            }
            self.reset_to_idle();
            return FilterAction::ReplyFromCache(value.unwrap_or_default());
        }

        // NOT_FOUND, possibly DISCARDED.
        self.current_populate = action.can_populate || result.discarded;
        self.state = if self.current_populate { SessionState::ExpectingResponse } else { SessionState::IgnoringResponse };
        FilterAction::Forward
    }

    fn reset_to_idle(&mut self) {
        self.state = SessionState::ExpectingNothing;
        self.current_key = None;
        self.current_populate = false;
        self.processing = false;
    }

    /// Feeds a chunk of the backend's response through (spec §4.7
    /// "Response path": "accumulate bytes into the pending response
    /// buffer"). Only meaningful while populate is armed; an ignored
    /// response needs no local copy.
    pub fn on_response_chunk(&mut self, bytes: &[u8], row_increment: u64) {
        if self.state == SessionState::ExpectingResponse && self.current_populate {
            self.state = SessionState::StoringResponse;
        }
        if self.state != SessionState::StoringResponse {
            return;
        }
        self.response_buffer.extend_from_slice(bytes);
        self.response_rows += row_increment;

        let rows_over = self.config.max_resultset_rows != 0 && self.response_rows > self.config.max_resultset_rows;
        let size_over =
            self.config.max_resultset_size != 0 && (self.response_buffer.len() as u64) > self.config.max_resultset_size;
        if rows_over || size_over {
            self.state = SessionState::IgnoringResponse;
            self.response_buffer.clear();
        }
    }

    /// Spec §4.7 "On the backend indicating the response is complete".
    pub async fn on_response_complete(&mut self, outcome: BackendOutcome) -> ResponseAction {
        let mut action = ResponseAction::Flush;

        match self.state {
            SessionState::ExpectingUseResponse => {
                if outcome == BackendOutcome::Ok {
                    if let Some(db) = self.pending_use_db.take() {
                        self.default_db = db;
                    }
                } else {
                    self.pending_use_db = None;
                }
            }
            SessionState::StoringResponse => {
                self.store_completed_response().await;
                self.release_refresh_slot();
            }
            SessionState::IgnoringResponse => {
                self.release_refresh_slot();
            }
            _ => {}
        }

        if self.invalidate_now {
            action = self.run_invalidation(outcome).await;
        }

        self.state = SessionState::ExpectingNothing;
        self.response_buffer.clear();
        self.response_rows = 0;
        self.tables.clear();
        self.current_key = None;
        self.current_populate = false;
        self.processing = false;

        action
    }

    async fn store_completed_response(&mut self) {
        let Some(key) = self.current_key.clone() else { return };
        let has_information_schema =
            self.tables.iter().any(|t| t.to_ascii_lowercase().starts_with("information_schema."));
        if has_information_schema {
            return;
        }
        let words: Vec<String> = self.tables.iter().cloned().collect();
        let result =
            self.engine.put_value(self.worker, Token::null(), &key, &words, &self.response_buffer[..]).await;
        if !result.is_ok() {
            tracing::error!("cache put_value failed, issuing a compensating delete");
            self.engine.del_value(self.worker, Token::null(), &key).await;
        }
    }

    fn release_refresh_slot(&mut self) {
        if self.refreshing {
            if let Some(key) = self.current_key.clone() {
                self.engine.refreshed(self.worker, &key, self.session_id);
            }
            self.refreshing = false;
        }
    }

    async fn run_invalidation(&mut self, outcome: BackendOutcome) -> ResponseAction {
        self.invalidate_now = false;
        let clear_cache = std::mem::replace(&mut self.clear_cache, false);

        if !matches!(outcome, BackendOutcome::Ok | BackendOutcome::ResultSet) {
            // The statement that would have triggered invalidation itself
            // failed; nothing actually changed (spec §7: only a
            // successful write needs invalidating).
            return ResponseAction::Flush;
        }

        if clear_cache {
            return self.clear_or_disable().await;
        }

        let words: Vec<String> = self.tables.iter().cloned().collect();
        let result = self.engine.invalidate(self.worker, Token::null(), &words).await;
        if result.is_ok() {
            return ResponseAction::Flush;
        }
        tracing::warn!("invalidate failed, falling back to a full clear");
        self.clear_or_disable().await
    }

    async fn clear_or_disable(&mut self) -> ResponseAction {
        let result = self.engine.clear(self.worker, Token::null()).await;
        if result.is_ok() {
            ResponseAction::Flush
        } else {
            tracing::error!("cache clear failed, disabling caching for the rest of this session");
            self.use_enabled = false;
            self.populate_enabled = false;
            ResponseAction::FlushAndDisableCaching
        }
    }
}

fn is_rollback(sql: &str) -> bool {
    parser::first_keyword(sql).eq_ignore_ascii_case("ROLLBACK")
}

/// Spec §4.7 step 3: a SELECT is cacheable under `verify_cacheable`
/// unless it reads a user/system variable or calls a non-deterministic
/// function. An unparseable SELECT is treated as cacheable — verification
/// is a best-effort narrowing, not a gate (spec §7 only calls out
/// `clear_cache_on_parse_errors` for DML parse failures, not SELECTs).
fn is_verified_cacheable(sql: &str) -> bool {
    let Some(refs) = parser::extract_refs(sql) else {
        return true;
    };
    if !refs.variables.is_empty() {
        return false;
    }
    !refs.functions.iter().any(|f| NON_CACHEABLE_FUNCTIONS.contains(&f.to_ascii_lowercase().as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rules::RuleSet;
    use crate::storage::inmemory::InMemoryStorage;
    use crate::storage::{Storage, StorageConfig};

    fn filter_with(config: CacheConfig) -> SessionFilter {
        let clock = Arc::new(ManualClock::new());
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new(StorageConfig::default(), clock));
        let engine = Arc::new(CacheEngine::shared(storage, vec![RuleSet::empty()]));
        SessionFilter::new(engine, config, 0, "bob", "10.0.0.1", "app")
    }

    fn default_filter() -> SessionFilter {
        filter_with(CacheConfig::default())
    }

    #[tokio::test]
    async fn select_outside_transaction_populates_then_serves_from_cache() {
        let mut f = default_filter();

        let action = f.handle_packet(ClientPacket {
            command: ClientCommand::Query("SELECT * FROM orders".to_string()),
            is_continuation: false,
        }).await;
        assert!(matches!(action, FilterAction::Forward));
        assert_eq!(f.state(), SessionState::ExpectingResponse);

        f.on_response_chunk(b"row-bytes", 1);
        assert_eq!(f.state(), SessionState::StoringResponse);
        let resp = f.on_response_complete(BackendOutcome::ResultSet).await;
        assert!(matches!(resp, ResponseAction::Flush));
        assert_eq!(f.state(), SessionState::ExpectingNothing);

        let action = f.handle_packet(ClientPacket {
            command: ClientCommand::Query("SELECT * FROM orders".to_string()),
            is_continuation: false,
        }).await;
        match action {
            FilterAction::ReplyFromCache(bytes) => assert_eq!(bytes, b"row-bytes"),
            other => panic!("expected a cache hit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn active_transaction_with_prior_write_ignores_selects() {
        let mut f = default_filter();
        f.handle_packet(ClientPacket { command: ClientCommand::Query("BEGIN".to_string()), is_continuation: false })
            .await;
        f.on_response_complete(BackendOutcome::Ok).await;

        let action = f
            .handle_packet(ClientPacket {
                command: ClientCommand::Query("UPDATE orders SET total = 1".to_string()),
                is_continuation: false,
            })
            .await;
        assert!(matches!(action, FilterAction::Forward));
        assert_eq!(f.state(), SessionState::IgnoringResponse);
        f.on_response_complete(BackendOutcome::Ok).await;

        let action = f
            .handle_packet(ClientPacket {
                command: ClientCommand::Query("SELECT * FROM orders".to_string()),
                is_continuation: false,
            })
            .await;
        assert!(matches!(action, FilterAction::Forward));
        assert_eq!(f.state(), SessionState::IgnoringResponse);
    }

    #[tokio::test]
    async fn dml_under_invalidation_arms_invalidate_now_and_clears_words() {
        let mut config = CacheConfig::default();
        config.invalidate = crate::storage::InvalidationMode::Current;
        let mut f = filter_with(config);

        // Prime the cache with a SELECT so there's something to invalidate.
        f.handle_packet(ClientPacket {
            command: ClientCommand::Query("SELECT * FROM orders".to_string()),
            is_continuation: false,
        }).await;
        f.on_response_chunk(b"v", 1);
        f.on_response_complete(BackendOutcome::ResultSet).await;

        let action = f
            .handle_packet(ClientPacket {
                command: ClientCommand::Query("UPDATE orders SET total = 1".to_string()),
                is_continuation: false,
            })
            .await;
        assert!(matches!(action, FilterAction::Forward));
        assert_eq!(f.state(), SessionState::IgnoringResponse);
        let resp = f.on_response_complete(BackendOutcome::Ok).await;
        assert!(matches!(resp, ResponseAction::Flush));

        // The prior SELECT's cached entry must now be gone.
        let action = f
            .handle_packet(ClientPacket {
                command: ClientCommand::Query("SELECT * FROM orders".to_string()),
                is_continuation: false,
            })
            .await;
        assert!(matches!(action, FilterAction::Forward), "entry should have been invalidated");
    }

    #[tokio::test]
    async fn oversize_response_is_not_stored() {
        let mut config = CacheConfig::default();
        config.max_resultset_size = 4;
        let mut f = filter_with(config);

        f.handle_packet(ClientPacket {
            command: ClientCommand::Query("SELECT * FROM orders".to_string()),
            is_continuation: false,
        }).await;
        f.on_response_chunk(b"way more than four bytes", 1);
        assert_eq!(f.state(), SessionState::IgnoringResponse);
        f.on_response_complete(BackendOutcome::ResultSet).await;

        let action = f
            .handle_packet(ClientPacket {
                command: ClientCommand::Query("SELECT * FROM orders".to_string()),
                is_continuation: false,
            })
            .await;
        assert!(matches!(action, FilterAction::Forward), "nothing should have been cached");
    }

    #[tokio::test]
    async fn second_packet_is_queued_while_one_is_in_flight() {
        let mut f = default_filter();
        f.handle_packet(ClientPacket {
            command: ClientCommand::Query("SELECT * FROM orders".to_string()),
            is_continuation: false,
        }).await;

        let action = f
            .handle_packet(ClientPacket {
                command: ClientCommand::Query("SELECT * FROM customers".to_string()),
                is_continuation: false,
            })
            .await;
        assert!(matches!(action, FilterAction::Queued));
        assert!(f.pop_queued().is_some());
        assert!(f.pop_queued().is_none());
    }

    #[tokio::test]
    async fn use_db_switches_default_database_only_on_ok() {
        let mut f = default_filter();
        f.handle_packet(ClientPacket { command: ClientCommand::InitDb("other".to_string()), is_continuation: false })
            .await;
        assert_eq!(f.state(), SessionState::ExpectingUseResponse);
        f.on_response_complete(BackendOutcome::Ok).await;
        assert_eq!(f.default_db, "other");
    }

    #[tokio::test]
    async fn debug_bitmask_enabled_does_not_change_cache_behavior() {
        let mut config = CacheConfig::default();
        config.debug = CACHE_DEBUG_MATCHING | CACHE_DEBUG_NON_MATCHING | CACHE_DEBUG_USE | CACHE_DEBUG_NON_USE
            | CACHE_DEBUG_DECISIONS;
        let mut f = filter_with(config);

        f.handle_packet(ClientPacket {
            command: ClientCommand::Query("SELECT * FROM orders".to_string()),
            is_continuation: false,
        })
        .await;
        f.on_response_chunk(b"row-bytes", 1);
        f.on_response_complete(BackendOutcome::ResultSet).await;

        let action = f
            .handle_packet(ClientPacket {
                command: ClientCommand::Query("SELECT * FROM orders".to_string()),
                is_continuation: false,
            })
            .await;
        match action {
            FilterAction::ReplyFromCache(bytes) => assert_eq!(bytes, b"row-bytes"),
            other => panic!("expected a cache hit even with every debug bit set, got {other:?}"),
        }
    }

    #[test]
    fn verified_cacheable_rejects_non_deterministic_functions_and_variables() {
        assert!(!is_verified_cacheable("SELECT NOW()"));
        assert!(!is_verified_cacheable("SELECT @my_var"));
        assert!(is_verified_cacheable("SELECT * FROM orders WHERE id = 1"));
    }
}
