//! The per-session request/response state machine (spec §4.7).
//!
//! ```text
//! EXPECTING_NOTHING --client request--> EXPECTING_RESPONSE | EXPECTING_USE_RESPONSE | IGNORING_RESPONSE
//! EXPECTING_RESPONSE --first resultset byte, populate armed--> STORING_RESPONSE
//! STORING_RESPONSE --size/row overflow--> IGNORING_RESPONSE
//! STORING_RESPONSE | IGNORING_RESPONSE | EXPECTING_USE_RESPONSE --response complete--> EXPECTING_NOTHING
//! ```

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    ExpectingNothing,
    ExpectingResponse,
    ExpectingUseResponse,
    StoringResponse,
    IgnoringResponse,
}

/// The two independent axes a dispatch decision sets (spec §4.7 step 1):
/// may this request be served from the cache, and may its response be
/// written to the cache. Kept as two flags rather than a four-variant
/// enum because both §4.7's transaction logic and the session/account
/// rule-set checks mask them independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheAction {
    pub can_use: bool,
    pub can_populate: bool,
}

impl CacheAction {
    pub const IGNORE: CacheAction = CacheAction { can_use: false, can_populate: false };
    pub const USE: CacheAction = CacheAction { can_use: true, can_populate: false };
    pub const POPULATE: CacheAction = CacheAction { can_use: false, can_populate: true };
    pub const USE_AND_POPULATE: CacheAction = CacheAction { can_use: true, can_populate: true };

    pub fn mask(self, use_enabled: bool, populate_enabled: bool) -> CacheAction {
        CacheAction { can_use: self.can_use && use_enabled, can_populate: self.can_populate && populate_enabled }
    }

    pub fn is_ignore(self) -> bool {
        !self.can_use && !self.can_populate
    }
}
