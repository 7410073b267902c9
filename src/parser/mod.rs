//! Statement classification and table/column extraction.
//!
//! Two independent layers, deliberately kept apart:
//!
//! - [`classify`] is a cheap, purely lexical first-keyword classification
//!   (spec §4.7 step 2: "Lexically classify the statement's first
//!   keyword"). It never fails and never needs a real parser, which keeps
//!   the hot path of every query — including ones `sqlparser` cannot
//!   parse — cheap and dependable.
//! - [`extract_refs`] asks `sqlparser` for the tables/columns/databases a
//!   statement references, for the rule engine (§4.2) and for DML table
//!   extraction under invalidation (§4.7 step 4). It can fail — an
//!   unparseable statement is an expected, handled case, not a bug (see
//!   `clear_cache_on_parse_errors` in §4.7 and §7's error table).

use sqlparser::ast::{
    Expr, Join, ObjectName, Select, SelectItem, SetExpr, Statement, TableFactor, TableWithJoins,
};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;

/// First-keyword classification of a statement (spec §4.7 step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    /// DELETE / UPDATE / INSERT ("DUPSERT" in the spec's shorthand).
    Dupsert,
    /// DROP / RENAME / ALTER ("DRALTER" in the spec's shorthand).
    Dralter,
    Commit,
    Begin,
    Unknown,
}

/// Lexically classifies `sql` by its first keyword. Never fails: anything
/// it does not recognise is [`StatementKind::Unknown`].
pub fn classify(sql: &str) -> StatementKind {
    match first_keyword(sql).to_ascii_uppercase().as_str() {
        "SELECT" => StatementKind::Select,
        "DELETE" | "UPDATE" | "INSERT" | "REPLACE" => StatementKind::Dupsert,
        "DROP" | "RENAME" | "ALTER" | "TRUNCATE" | "CREATE" => StatementKind::Dralter,
        "COMMIT" => StatementKind::Commit,
        "BEGIN" | "START" => StatementKind::Begin,
        _ => StatementKind::Unknown,
    }
}

/// Extracts the first SQL keyword, skipping leading whitespace and `--`/`#`
/// and `/* */` comments. Returns an empty string for an empty/all-comment
/// statement.
pub fn first_keyword(sql: &str) -> &str {
    let mut s = sql;
    loop {
        s = s.trim_start();
        if let Some(rest) = s.strip_prefix("--") {
            s = rest.split_once('\n').map(|(_, r)| r).unwrap_or("");
        } else if let Some(rest) = s.strip_prefix('#') {
            s = rest.split_once('\n').map(|(_, r)| r).unwrap_or("");
        } else if let Some(rest) = s.strip_prefix("/*") {
            s = rest.split_once("*/").map(|(_, r)| r).unwrap_or("");
        } else {
            break;
        }
    }
    let end = s
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(s.len());
    &s[..end]
}

/// True if `sql` contains more than one statement (separated by an
/// unquoted `;`). Multi-statement requests are forwarded verbatim without
/// caching logic (spec §4.7).
pub fn is_multi_statement(sql: &str) -> bool {
    let mut in_single = false;
    let mut in_double = false;
    let mut in_backtick = false;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' if !in_double && !in_backtick => in_single = !in_single,
            '"' if !in_single && !in_backtick => in_double = !in_double,
            '`' if !in_single && !in_double => in_backtick = !in_backtick,
            ';' if !in_single && !in_double && !in_backtick => {
                let rest: String = chars.clone().collect();
                if !rest.trim().is_empty() {
                    return true;
                }
            }
            _ => {}
        }
    }
    false
}

/// A table reference extracted from a parsed query, with an optional
/// explicit database qualifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub database: Option<String>,
    pub table: String,
}

/// A column reference extracted from a parsed query, with optional table
/// and database qualifiers (as written — the rule engine is responsible
/// for defaulting a missing qualifier, per spec §4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    pub database: Option<String>,
    pub table: Option<String>,
    pub column: String,
}

#[derive(Debug, Clone, Default)]
pub struct QueryRefs {
    pub tables: Vec<TableRef>,
    pub columns: Vec<ColumnRef>,
    /// Lower-cased names of any function calls in the statement (used by
    /// the session filter to detect non-cacheable functions like `now()`).
    pub functions: Vec<String>,
    /// `@user_var` / `@@system_var` references (non-cacheable per §4.7
    /// step 3).
    pub variables: Vec<String>,
}

impl QueryRefs {
    /// Databases referenced by the query, defaulting to `default_db` when
    /// no table in the query carries an explicit qualifier (spec §4.2,
    /// database attribute).
    pub fn databases(&self, default_db: &str) -> Vec<String> {
        let mut dbs: Vec<String> = self
            .tables
            .iter()
            .filter_map(|t| t.database.clone())
            .collect();
        if dbs.is_empty() && !default_db.is_empty() {
            dbs.push(default_db.to_string());
        }
        dbs.sort();
        dbs.dedup();
        dbs
    }
}

/// Parses `sql` and extracts its table/column/function/variable
/// references. Returns `None` if `sqlparser` cannot parse the statement —
/// the caller (rule engine or session filter) decides what an unparseable
/// statement means for its own purposes (§4.7 step 4,
/// `clear_cache_on_parse_errors`).
pub fn extract_refs(sql: &str) -> Option<QueryRefs> {
    let dialect = MySqlDialect {};
    let statements = Parser::parse_sql(&dialect, sql).ok()?;
    let mut refs = QueryRefs::default();
    for stmt in &statements {
        walk_statement(stmt, &mut refs);
    }
    Some(refs)
}

fn object_name_to_table_ref(name: &ObjectName) -> TableRef {
    let parts: Vec<String> = name.0.iter().map(|i| i.value.clone()).collect();
    match parts.len() {
        0 => TableRef { database: None, table: String::new() },
        1 => TableRef { database: None, table: parts[0].clone() },
        _ => TableRef {
            database: Some(parts[parts.len() - 2].clone()),
            table: parts[parts.len() - 1].clone(),
        },
    }
}

fn walk_table_factor(tf: &TableFactor, refs: &mut QueryRefs) {
    match tf {
        TableFactor::Table { name, .. } => refs.tables.push(object_name_to_table_ref(name)),
        TableFactor::Derived { subquery, .. } => walk_set_expr(&subquery.body, refs),
        TableFactor::NestedJoin { table_with_joins, .. } => walk_table_with_joins(table_with_joins, refs),
        _ => {}
    }
}

fn walk_joins(joins: &[Join], refs: &mut QueryRefs) {
    for j in joins {
        walk_table_factor(&j.relation, refs);
    }
}

fn walk_table_with_joins(twj: &TableWithJoins, refs: &mut QueryRefs) {
    walk_table_factor(&twj.relation, refs);
    walk_joins(&twj.joins, refs);
}

fn walk_select(select: &Select, refs: &mut QueryRefs) {
    for twj in &select.from {
        walk_table_with_joins(twj, refs);
    }
    for item in &select.projection {
        match item {
            SelectItem::UnnamedExpr(e) => walk_expr(e, refs),
            SelectItem::ExprWithAlias { expr, .. } => walk_expr(expr, refs),
            _ => {}
        }
    }
    if let Some(selection) = &select.selection {
        walk_expr(selection, refs);
    }
    if let Some(having) = &select.having {
        walk_expr(having, refs);
    }
}

fn walk_set_expr(se: &SetExpr, refs: &mut QueryRefs) {
    match se {
        SetExpr::Select(s) => walk_select(s, refs),
        SetExpr::Query(q) => walk_set_expr(&q.body, refs),
        SetExpr::SetOperation { left, right, .. } => {
            walk_set_expr(left, refs);
            walk_set_expr(right, refs);
        }
        _ => {}
    }
}

fn walk_expr(expr: &Expr, refs: &mut QueryRefs) {
    match expr {
        Expr::Identifier(ident) => push_identifier(&ident.value, refs),
        Expr::CompoundIdentifier(parts) => {
            let names: Vec<String> = parts.iter().map(|p| p.value.clone()).collect();
            match names.len() {
                0 => {}
                1 => push_identifier(&names[0], refs),
                2 => refs.columns.push(ColumnRef {
                    database: None,
                    table: Some(names[0].clone()),
                    column: names[1].clone(),
                }),
                _ => refs.columns.push(ColumnRef {
                    database: Some(names[names.len() - 3].clone()),
                    table: Some(names[names.len() - 2].clone()),
                    column: names[names.len() - 1].clone(),
                }),
            }
        }
        Expr::Function(f) => refs.functions.push(f.name.to_string().to_ascii_lowercase()),
        Expr::BinaryOp { left, right, .. } => {
            walk_expr(left, refs);
            walk_expr(right, refs);
        }
        Expr::UnaryOp { expr, .. } => walk_expr(expr, refs),
        Expr::Nested(e) => walk_expr(e, refs),
        Expr::Cast { expr, .. } => walk_expr(expr, refs),
        Expr::Between { expr, low, high, .. } => {
            walk_expr(expr, refs);
            walk_expr(low, refs);
            walk_expr(high, refs);
        }
        Expr::InList { expr, list, .. } => {
            walk_expr(expr, refs);
            for e in list {
                walk_expr(e, refs);
            }
        }
        Expr::IsNull(e) | Expr::IsNotNull(e) => walk_expr(e, refs),
        Expr::Subquery(q) => walk_set_expr(&q.body, refs),
        _ => {}
    }
}

fn push_identifier(name: &str, refs: &mut QueryRefs) {
    if let Some(rest) = name.strip_prefix("@@") {
        refs.variables.push(format!("@@{}", rest.to_ascii_lowercase()));
    } else if let Some(rest) = name.strip_prefix('@') {
        refs.variables.push(format!("@{}", rest.to_ascii_lowercase()));
    } else {
        refs.columns.push(ColumnRef { database: None, table: None, column: name.to_string() });
    }
}

fn walk_statement(stmt: &Statement, refs: &mut QueryRefs) {
    match stmt {
        Statement::Query(q) => walk_set_expr(&q.body, refs),
        Statement::Insert { table_name, .. } => {
            refs.tables.push(object_name_to_table_ref(table_name));
        }
        Statement::Update { table, assignments, selection, .. } => {
            walk_table_with_joins(table, refs);
            for a in assignments {
                walk_expr(&a.value, refs);
            }
            if let Some(s) = selection {
                walk_expr(s, refs);
            }
        }
        Statement::Delete { from, selection, .. } => {
            for twj in from {
                walk_table_with_joins(twj, refs);
            }
            if let Some(s) = selection {
                walk_expr(s, refs);
            }
        }
        Statement::Drop { names, .. } => {
            for n in names {
                refs.tables.push(object_name_to_table_ref(n));
            }
        }
        Statement::AlterTable { name, .. } => {
            refs.tables.push(object_name_to_table_ref(name));
        }
        Statement::CreateTable { name, .. } => {
            refs.tables.push(object_name_to_table_ref(name));
        }
        Statement::Truncate { table_name, .. } => {
            refs.tables.push(object_name_to_table_ref(table_name));
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_select() {
        assert_eq!(classify("  -- comment\nSELECT 1"), StatementKind::Select);
        assert_eq!(classify("SELECT * FROM t"), StatementKind::Select);
    }

    #[test]
    fn classifies_dupsert_and_dralter() {
        assert_eq!(classify("insert into t values (1)"), StatementKind::Dupsert);
        assert_eq!(classify("UPDATE t SET a=1"), StatementKind::Dupsert);
        assert_eq!(classify("DELETE FROM t"), StatementKind::Dupsert);
        assert_eq!(classify("DROP TABLE t"), StatementKind::Dralter);
        assert_eq!(classify("ALTER TABLE t ADD c INT"), StatementKind::Dralter);
    }

    #[test]
    fn detects_multi_statement() {
        assert!(is_multi_statement("SELECT 1; SELECT 2"));
        assert!(!is_multi_statement("SELECT 1;"));
        assert!(!is_multi_statement("SELECT ';' FROM t"));
    }

    #[test]
    fn extracts_simple_table() {
        let refs = extract_refs("SELECT a FROM db1.t1").unwrap();
        assert_eq!(refs.tables[0].table, "t1");
        assert_eq!(refs.tables[0].database.as_deref(), Some("db1"));
    }

    #[test]
    fn extracts_join_tables() {
        let refs = extract_refs("SELECT * FROM t1 JOIN t2 ON t1.id = t2.id").unwrap();
        let names: Vec<_> = refs.tables.iter().map(|t| t.table.as_str()).collect();
        assert!(names.contains(&"t1"));
        assert!(names.contains(&"t2"));
    }

    #[test]
    fn extracts_functions() {
        let refs = extract_refs("SELECT now() FROM t").unwrap();
        assert!(refs.functions.contains(&"now".to_string()));
    }

    #[test]
    fn unparseable_returns_none() {
        assert!(extract_refs("SELECT ((( FROM").is_none());
    }
}
