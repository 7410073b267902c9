//! The declarative rule engine (spec §4.2, §6).
//!
//! A [`RuleSet`] holds two independent, ordered lists: *store* rules
//! (should a response be written to the cache?) and *use* rules (should a
//! cached response be consulted at all, for this account?). Both lists
//! use the same "first match wins, empty list means always" contract:
//! `should_store`/`should_use` walk the list in order and return as soon
//! as one rule matches; an empty list means the corresponding question is
//! answered `true` unconditionally.

mod rule;

pub use rule::{Attribute, ConcreteRule, Op, UserRule};

use crate::error::{CacheError, Result};
use crate::parser::QueryRefs;
use serde::Deserialize;
use serde_json::Value as Json;

/// The caching rule document (spec §6): `{"store": [...], "use": [...]}`.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    store_rules: Vec<ConcreteRule>,
    use_rules: Vec<UserRule>,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    attribute: String,
    op: String,
    value: String,
}

#[derive(Debug, Deserialize, Default)]
struct RawDocument {
    #[serde(default)]
    store: Vec<RawRule>,
    #[serde(default)]
    r#use: Vec<RawRule>,
}

impl RuleSet {
    /// An empty rule set: everything is stored, the cache is always
    /// consulted. This is the default when no rules document is
    /// configured (spec §4.2).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parses a rules document from JSON text (spec §6). Unknown
    /// attribute/op strings and a malformed regex fail the whole
    /// document — there is no partial rule set.
    pub fn parse(json_text: &str) -> Result<Self> {
        let doc: RawDocument = serde_json::from_str(json_text)?;
        Self::from_raw(doc)
    }

    fn from_raw(doc: RawDocument) -> Result<Self> {
        let mut store_rules = Vec::with_capacity(doc.store.len());
        for raw in doc.store {
            let attribute = parse_store_attribute(&raw.attribute)?;
            let op = parse_op(&raw.op)?;
            store_rules.push(ConcreteRule::new(attribute, op, &raw.value)?);
        }

        let mut use_rules = Vec::with_capacity(doc.r#use.len());
        for raw in doc.r#use {
            if raw.attribute != "user" {
                return Err(CacheError::Rules(format!(
                    "use rules only support the \"user\" attribute, got \"{}\"",
                    raw.attribute
                )));
            }
            let op = parse_op(&raw.op)?;
            if !matches!(op, Op::Eq | Op::Neq) {
                return Err(CacheError::Rules(
                    "use rules only support \"=\" and \"!=\"".to_string(),
                ));
            }
            use_rules.push(UserRule::new(op, &raw.value)?);
        }

        Ok(RuleSet { store_rules, use_rules })
    }

    /// Loads a rules document from a JSON [`serde_json::Value`] already
    /// parsed by the host (spec §4.2/§6).
    pub fn from_value(value: Json) -> Result<Self> {
        let doc: RawDocument = serde_json::from_value(value)?;
        Self::from_raw(doc)
    }

    /// Loads a rules *document* (spec §6: "top-level JSON object or array
    /// of objects") as the ordered list of rule-set groups the engine
    /// consults one at a time (spec §4.3: "first matching rule-set
    /// group"). A bare object is one group; an array is several, tried in
    /// array order.
    pub fn parse_document(json_text: &str) -> Result<Vec<Self>> {
        let value: Json = serde_json::from_str(json_text)?;
        Self::from_document_value(value)
    }

    /// As [`Self::parse_document`], from an already-parsed
    /// [`serde_json::Value`].
    pub fn from_document_value(value: Json) -> Result<Vec<Self>> {
        match value {
            Json::Array(groups) => groups.into_iter().map(Self::from_value).collect(),
            other => Ok(vec![Self::from_value(other)?]),
        }
    }

    /// Whether the result of `query` (run against `default_db`) should be
    /// written to the cache. An empty store-rule list always answers
    /// `true` (spec §4.2).
    pub fn should_store(&self, default_db: &str, query: &str) -> bool {
        if self.store_rules.is_empty() {
            return true;
        }
        let refs = crate::parser::extract_refs(query);
        self.store_rules
            .iter()
            .any(|rule| rule.matches(default_db, query, refs.as_ref()))
    }

    /// Whether the cache should be consulted at all for `user`@`host`. An
    /// empty use-rule list always answers `true` (spec §4.2).
    pub fn should_use(&self, user: &str, host: &str) -> bool {
        if self.use_rules.is_empty() {
            return true;
        }
        let account = format!("{user}@{host}");
        self.use_rules.iter().any(|rule| rule.matches(&account))
    }

    pub fn store_rule_count(&self) -> usize {
        self.store_rules.len()
    }

    pub fn use_rule_count(&self) -> usize {
        self.use_rules.len()
    }
}

fn parse_store_attribute(s: &str) -> Result<Attribute> {
    match s {
        "column" => Ok(Attribute::Column),
        "database" => Ok(Attribute::Database),
        "query" => Ok(Attribute::Query),
        "table" => Ok(Attribute::Table),
        other => Err(CacheError::Rules(format!(
            "unknown store-rule attribute \"{other}\" (expected column, database, query or table)"
        ))),
    }
}

fn parse_op(s: &str) -> Result<Op> {
    match s {
        "=" => Ok(Op::Eq),
        "!=" => Ok(Op::Neq),
        "like" => Ok(Op::Like),
        "unlike" => Ok(Op::Unlike),
        other => Err(CacheError::Rules(format!(
            "unknown rule operator \"{other}\" (expected =, !=, like or unlike)"
        ))),
    }
}

/// Re-exported for the `QueryRefs` bound on [`ConcreteRule::matches`].
pub(crate) type Refs<'a> = Option<&'a QueryRefs>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ruleset_always_stores_and_uses() {
        let rules = RuleSet::empty();
        assert!(rules.should_store("db", "SELECT 1"));
        assert!(rules.should_use("anyone", "anywhere"));
    }

    #[test]
    fn store_rule_table_eq() {
        let rules = RuleSet::parse(
            r#"{"store": [{"attribute": "table", "op": "=", "value": "orders"}]}"#,
        )
        .unwrap();
        assert!(rules.should_store("db", "SELECT * FROM orders"));
        assert!(!rules.should_store("db", "SELECT * FROM customers"));
    }

    #[test]
    fn store_rule_table_neq_matches_anything_else() {
        let rules = RuleSet::parse(
            r#"{"store": [{"attribute": "table", "op": "!=", "value": "orders"}]}"#,
        )
        .unwrap();
        assert!(rules.should_store("db", "SELECT * FROM customers"));
        assert!(!rules.should_store("db", "SELECT * FROM orders"));
    }

    #[test]
    fn store_rule_query_like() {
        let rules = RuleSet::parse(
            r#"{"store": [{"attribute": "query", "op": "like", "value": "(?i)^select"}]}"#,
        )
        .unwrap();
        assert!(rules.should_store("db", "SELECT 1"));
        assert!(!rules.should_store("db", "INSERT INTO t VALUES (1)"));
    }

    #[test]
    fn use_rule_user_wildcard_host() {
        let rules =
            RuleSet::parse(r#"{"use": [{"attribute": "user", "op": "=", "value": "bob@%"}]}"#)
                .unwrap();
        assert!(rules.should_use("bob", "10.0.0.1"));
        assert!(!rules.should_use("alice", "10.0.0.1"));
    }

    #[test]
    fn unknown_attribute_rejected() {
        let err = RuleSet::parse(r#"{"store": [{"attribute": "bogus", "op": "=", "value": "x"}]}"#);
        assert!(err.is_err());
    }

    #[test]
    fn malformed_regex_fails_whole_document() {
        let err = RuleSet::parse(
            r#"{"store": [{"attribute": "query", "op": "like", "value": "(unterminated"}]}"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn bare_object_document_is_one_group() {
        let groups =
            RuleSet::parse_document(r#"{"store": [{"attribute": "table", "op": "=", "value": "orders"}]}"#)
                .unwrap();
        assert_eq!(groups.len(), 1);
        assert!(groups[0].should_store("db", "SELECT * FROM orders"));
    }

    #[test]
    fn array_document_is_multiple_ordered_groups() {
        let groups = RuleSet::parse_document(
            r#"[
                {"store": [{"attribute": "table", "op": "=", "value": "orders"}]},
                {"use": [{"attribute": "user", "op": "=", "value": "bob@%"}]}
            ]"#,
        )
        .unwrap();
        assert_eq!(groups.len(), 2);
        assert!(groups[0].should_store("db", "SELECT * FROM orders"));
        assert!(!groups[0].should_store("db", "SELECT * FROM customers"));
        assert!(groups[1].should_use("bob", "10.0.0.1"));
        assert!(!groups[1].should_use("alice", "10.0.0.1"));
    }

    #[test]
    fn array_document_one_bad_group_fails_the_whole_document() {
        let err = RuleSet::parse_document(
            r#"[
                {"store": [{"attribute": "table", "op": "=", "value": "orders"}]},
                {"store": [{"attribute": "bogus", "op": "=", "value": "x"}]}
            ]"#,
        );
        assert!(err.is_err());
    }
}
