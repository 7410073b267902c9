//! Concrete (store) and user (use) rule matching.

use crate::error::{CacheError, Result};
use crate::parser::QueryRefs;
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    Column,
    Database,
    Query,
    Table,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Neq,
    Like,
    Unlike,
}

#[derive(Debug, Clone)]
enum Predicate {
    Exact(String),
    Regex(Regex),
}

/// A single store rule: `{attribute, op, value}` evaluated against a
/// query's table/column/database references or its raw text (spec §4.2).
#[derive(Debug, Clone)]
pub struct ConcreteRule {
    attribute: Attribute,
    op: Op,
    raw_value: String,
    predicate: Predicate,
    /// Dot-qualified parse of `raw_value` for EQ/NEQ Column/Table/Database
    /// rules only (e.g. `db.table.column` -> all three; `table.column` ->
    /// table+column; `column` -> column only). Unused for QUERY and for
    /// LIKE/UNLIKE rules, where `predicate` is matched directly.
    qualifier: Qualifier,
}

#[derive(Debug, Clone, Default)]
struct Qualifier {
    database: Option<String>,
    table: Option<String>,
    name: String,
}

impl ConcreteRule {
    pub fn new(attribute: Attribute, op: Op, raw_value: &str) -> Result<Self> {
        let predicate = match op {
            Op::Eq | Op::Neq => Predicate::Exact(raw_value.to_string()),
            Op::Like | Op::Unlike => Predicate::Regex(Regex::new(raw_value)?),
        };

        let qualifier = if matches!(op, Op::Eq | Op::Neq) {
            parse_qualifier(attribute, raw_value)?
        } else {
            Qualifier::default()
        };

        Ok(ConcreteRule {
            attribute,
            op,
            raw_value: raw_value.to_string(),
            predicate,
            qualifier,
        })
    }

    pub fn attribute(&self) -> Attribute {
        self.attribute
    }

    pub fn op(&self) -> Op {
        self.op
    }

    pub fn value(&self) -> &str {
        &self.raw_value
    }

    /// Whether this rule matches `query` (run against `default_db`).
    /// `refs` is the already-extracted table/column/function references,
    /// or `None` if the statement could not be parsed — in which case
    /// only the QUERY attribute (which works on raw text) can match.
    pub fn matches(&self, default_db: &str, query: &str, refs: Option<&QueryRefs>) -> bool {
        match self.attribute {
            Attribute::Query => self.compare(query),
            Attribute::Database => {
                let Some(refs) = refs else { return false };
                refs.databases(default_db).iter().any(|db| self.compare(db))
            }
            Attribute::Table => {
                let Some(refs) = refs else { return false };
                refs.tables.iter().any(|t| self.matches_table(default_db, t))
            }
            Attribute::Column => {
                let Some(refs) = refs else { return false };
                let default_table = if refs.tables.len() == 1 {
                    Some(refs.tables[0].table.as_str())
                } else {
                    None
                };
                refs.columns
                    .iter()
                    .any(|c| self.matches_column(default_db, default_table, c))
            }
        }
    }

    fn matches_table(&self, default_db: &str, t: &crate::parser::TableRef) -> bool {
        match self.op {
            Op::Eq | Op::Neq => {
                let table_eq = self.qualifier.name.eq_ignore_ascii_case(&t.table);
                let db_eq = match &self.qualifier.database {
                    Some(want_db) => {
                        let actual_db = t.database.as_deref().unwrap_or(default_db);
                        want_db.eq_ignore_ascii_case(actual_db)
                    }
                    None => true,
                };
                let base = table_eq && db_eq;
                if self.op == Op::Neq { !base } else { base }
            }
            Op::Like | Op::Unlike => self.compare(&t.table),
        }
    }

    fn matches_column(
        &self,
        default_db: &str,
        default_table: Option<&str>,
        c: &crate::parser::ColumnRef,
    ) -> bool {
        match self.op {
            Op::Eq | Op::Neq => {
                let column_eq = self.qualifier.name == "*" || self.qualifier.name.eq_ignore_ascii_case(&c.column);
                let base = column_eq
                    && match &self.qualifier.table {
                        Some(want_table) => {
                            let actual_table = c.table.as_deref().or(default_table);
                            match actual_table {
                                Some(actual) => {
                                    let table_eq = want_table.eq_ignore_ascii_case(actual);
                                    table_eq
                                        && match &self.qualifier.database {
                                            Some(want_db) => {
                                                let actual_db = c.database.as_deref().unwrap_or(default_db);
                                                want_db.eq_ignore_ascii_case(actual_db)
                                            }
                                            None => true,
                                        }
                                }
                                None => false,
                            }
                        }
                        None => true,
                    };
                if self.op == Op::Neq { !base } else { base }
            }
            Op::Like | Op::Unlike => self.compare(&c.column),
        }
    }

    /// Compares a single already-resolved candidate string against this
    /// rule, handling the empty-candidate polarity rule (spec §4.2: for
    /// an empty candidate, `=`/`like` are false and `!=`/`unlike` are
    /// true).
    fn compare(&self, candidate: &str) -> bool {
        if candidate.is_empty() {
            return matches!(self.op, Op::Neq | Op::Unlike);
        }
        let base = match &self.predicate {
            Predicate::Exact(v) => v == candidate,
            Predicate::Regex(re) => re.is_match(candidate),
        };
        match self.op {
            Op::Eq | Op::Like => base,
            Op::Neq | Op::Unlike => !base,
        }
    }
}

fn parse_qualifier(attribute: Attribute, raw_value: &str) -> Result<Qualifier> {
    let parts: Vec<&str> = raw_value.split('.').collect();
    match attribute {
        Attribute::Column => match parts.len() {
            1 => Ok(Qualifier { database: None, table: None, name: parts[0].to_string() }),
            2 => Ok(Qualifier {
                database: None,
                table: Some(parts[0].to_string()),
                name: parts[1].to_string(),
            }),
            3 => Ok(Qualifier {
                database: Some(parts[0].to_string()),
                table: Some(parts[1].to_string()),
                name: parts[2].to_string(),
            }),
            _ => Err(CacheError::Rules(format!(
                "a column rule value can contain at most two dots: \"{raw_value}\""
            ))),
        },
        Attribute::Table => match parts.len() {
            1 => Ok(Qualifier { database: None, table: None, name: parts[0].to_string() }),
            2 => Ok(Qualifier {
                database: Some(parts[0].to_string()),
                table: None,
                name: parts[1].to_string(),
            }),
            _ => Err(CacheError::Rules(format!(
                "a table rule value cannot contain two dots: \"{raw_value}\""
            ))),
        },
        Attribute::Database => {
            if parts.len() != 1 {
                return Err(CacheError::Rules(format!(
                    "a database rule value cannot contain a dot: \"{raw_value}\""
                )));
            }
            Ok(Qualifier { database: None, table: None, name: parts[0].to_string() })
        }
        Attribute::Query => Ok(Qualifier::default()),
    }
}

/// A use rule: always the `user` attribute, matched against `user@host`.
/// A wildcard host (`%`/`_`, MySQL grant syntax) promotes the operator to
/// its regex form and the value to an equivalent pattern, mirroring the
/// original's `mysql_name_to_pcre` conversion (spec §4.2).
#[derive(Debug, Clone)]
pub struct UserRule {
    op: Op,
    raw_value: String,
    predicate: Predicate,
}

impl UserRule {
    pub fn new(op: Op, raw_value: &str) -> Result<Self> {
        let (user, host) = match raw_value.split_once('@') {
            Some((u, h)) => (u, h),
            None => (raw_value, "%"),
        };
        let user = trim_quotes(user);
        let host = trim_quotes(host);

        if host.contains('%') || host.contains('_') {
            let host_pattern = mysql_wildcard_to_regex(host);
            let user_pattern = if user.is_empty() { ".*".to_string() } else { regex::escape(user) };
            let pattern = format!("^{user_pattern}@{host_pattern}$");
            let op = if op == Op::Eq { Op::Like } else { Op::Unlike };
            Ok(UserRule { op, raw_value: raw_value.to_string(), predicate: Predicate::Regex(Regex::new(&pattern)?) })
        } else {
            Ok(UserRule {
                op,
                raw_value: raw_value.to_string(),
                predicate: Predicate::Exact(format!("{user}@{host}")),
            })
        }
    }

    pub fn value(&self) -> &str {
        &self.raw_value
    }

    pub fn matches(&self, account: &str) -> bool {
        if account.is_empty() {
            return matches!(self.op, Op::Neq | Op::Unlike);
        }
        let base = match &self.predicate {
            Predicate::Exact(v) => v == account,
            Predicate::Regex(re) => re.is_match(account),
        };
        match self.op {
            Op::Eq | Op::Like => base,
            Op::Neq | Op::Unlike => !base,
        }
    }
}

fn trim_quotes(s: &str) -> &str {
    let s = s.trim();
    if s.len() >= 2 {
        let bytes = s.as_bytes();
        if (bytes[0] == b'\'' && bytes[s.len() - 1] == b'\'')
            || (bytes[0] == b'"' && bytes[s.len() - 1] == b'"')
            || (bytes[0] == b'`' && bytes[s.len() - 1] == b'`')
        {
            return &s[1..s.len() - 1];
        }
    }
    s
}

/// Converts a MySQL grant-style host pattern (`%` = any sequence, `_` =
/// any single character) into an equivalent regex fragment.
fn mysql_wildcard_to_regex(host: &str) -> String {
    let mut out = String::with_capacity(host.len() * 2);
    let mut literal = String::new();
    for c in host.chars() {
        match c {
            '%' | '_' => {
                if !literal.is_empty() {
                    out.push_str(&regex::escape(&literal));
                    literal.clear();
                }
                out.push_str(if c == '%' { ".*" } else { "." });
            }
            c => literal.push(c),
        }
    }
    if !literal.is_empty() {
        out.push_str(&regex::escape(&literal));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_table_rule_respects_default_db() {
        let rule = ConcreteRule::new(Attribute::Table, Op::Eq, "shop.orders").unwrap();
        let t_qualified = crate::parser::TableRef { database: Some("shop".into()), table: "orders".into() };
        let t_unqualified = crate::parser::TableRef { database: None, table: "orders".into() };
        assert!(rule.matches_table("shop", &t_qualified));
        assert!(rule.matches_table("shop", &t_unqualified));
        assert!(!rule.matches_table("other", &t_unqualified));
    }

    #[test]
    fn wildcard_host_promotes_to_regex() {
        let rule = UserRule::new(Op::Eq, "bob@10.0.%").unwrap();
        assert!(rule.matches("bob@10.0.0.5"));
        assert!(!rule.matches("bob@10.1.0.5"));
    }

    #[test]
    fn plain_host_is_exact() {
        let rule = UserRule::new(Op::Neq, "bob@localhost").unwrap();
        assert!(!rule.matches("bob@localhost"));
        assert!(rule.matches("alice@localhost"));
    }
}
