//! A reader for the MariaDB mysql-test statement-script format (spec §6
//! "Test-script reader").
//!
//! Comment lines ('#' or "-- "-prefixed) are skipped. `--delimiter`,
//! `--if (cond) { ... }`, `--while (cond) { ... }`, `--error [code]` and
//! `--eval` alter the reader's control flow; `--perl` is fatal, matching
//! `original_source/query_classifier/test/testreader.cc`'s treatment (it
//! has no embedded interpreter either and bails out the same way).
//!
//! Unlike the original, the statement/delimiter search here is
//! quote-aware (see the Open Question recorded in `DESIGN.md`): a
//! semicolon — or whatever the current delimiter is — inside a string
//! literal never terminates a statement early.

use crate::error::{CacheError, Result};
use std::collections::HashMap;

/// A single statement the reader produced, with whatever `--error`
/// annotation preceded it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptStatement {
    pub text: String,
    /// Set by a preceding `--error` line. `true` even when no numeric
    /// code was given (a bare `--error` means "any error").
    pub expect_error: bool,
    /// The numeric code from `--error <code>`, if one was given.
    pub error_code: Option<i32>,
}

/// Boolean flags `--if`/`--while` conditions are evaluated against.
/// Real mysqltest conditions are server-state expressions; since this
/// reader has no live connection to evaluate them, a condition is just a
/// name (optionally `!`-negated) looked up in this map, defaulting to
/// `false` when absent.
#[derive(Debug, Clone, Default)]
pub struct ScriptContext {
    flags: HashMap<String, bool>,
}

impl ScriptContext {
    pub fn new() -> Self {
        ScriptContext::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: bool) -> &mut Self {
        self.flags.insert(name.into(), value);
        self
    }

    fn eval(&self, cond: &str) -> bool {
        let cond = cond.trim();
        if let Some(name) = cond.strip_prefix('!') {
            !self.flags.get(name.trim()).copied().unwrap_or(false)
        } else {
            self.flags.get(cond).copied().unwrap_or(false)
        }
    }
}

/// Reads every statement out of a script, applying delimiter changes and
/// `if`/`while` block skipping along the way.
///
/// `while` is evaluated once per encountered block rather than
/// re-evaluated in a loop: re-running a block would require actually
/// executing its statements and observing their effect on `ctx`, which
/// this reader (no live backend) cannot do. A script that relies on a
/// `while` block running more than once needs a different harness.
pub fn read_script(text: &str, ctx: &ScriptContext) -> Result<Vec<ScriptStatement>> {
    let mut out = Vec::new();
    let mut delimiter = ";".to_string();
    let mut pending_error = false;
    let mut pending_error_code = None;
    let mut buffer = String::new();
    let mut skip_stack: Vec<bool> = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim();

        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("-- ") {
            continue;
        }
        if trimmed == "{" {
            continue;
        }
        if trimmed == "}" {
            skip_stack.pop();
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix("--") {
            let rest = rest.trim_start();
            if let Some(arg) = rest.strip_prefix("delimiter") {
                let new_delim = arg.trim();
                delimiter = if new_delim.is_empty() { ";".to_string() } else { new_delim.to_string() };
                continue;
            }
            if let Some(arg) = rest.strip_prefix("if") {
                let cond = extract_paren(arg);
                skip_stack.push(!ctx.eval(&cond));
                continue;
            }
            if let Some(arg) = rest.strip_prefix("while") {
                let cond = extract_paren(arg);
                skip_stack.push(!ctx.eval(&cond));
                continue;
            }
            if let Some(arg) = rest.strip_prefix("error") {
                pending_error = true;
                pending_error_code = arg.trim().parse::<i32>().ok();
                continue;
            }
            if let Some(arg) = rest.strip_prefix("eval") {
                let after = arg.trim_start();
                if !after.is_empty() {
                    buffer.push_str(after);
                    buffer.push('\n');
                }
                continue;
            }
            if rest.trim_start().starts_with("perl") {
                return Err(CacheError::Other(
                    "the test-script reader does not embed a perl interpreter".to_string(),
                ));
            }
            // Unrecognised `--` command: ignore, forward-compatible.
            continue;
        }

        buffer.push_str(line);
        buffer.push('\n');

        if let Some(end) = find_unquoted(&buffer, &delimiter) {
            let stmt_text = buffer[..end].trim().to_string();
            buffer = buffer[end + delimiter.len()..].to_string();
            let skipped = skip_stack.iter().any(|&s| s);
            if !skipped && !stmt_text.is_empty() {
                out.push(ScriptStatement {
                    text: stmt_text,
                    expect_error: pending_error,
                    error_code: pending_error_code,
                });
            }
            pending_error = false;
            pending_error_code = None;
        }
    }

    Ok(out)
}

fn extract_paren(s: &str) -> String {
    if let Some(start) = s.find('(') {
        if let Some(end_rel) = s[start + 1..].find(')') {
            return s[start + 1..start + 1 + end_rel].trim().to_string();
        }
    }
    String::new()
}

/// Finds the first occurrence of `needle` in `haystack` that is not
/// inside a single-, double-, or backtick-quoted string (assumes ASCII
/// input, like the rest of this reader).
fn find_unquoted(haystack: &str, needle: &str) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    let bytes = haystack.as_bytes();
    let mut in_single = false;
    let mut in_double = false;
    let mut in_backtick = false;
    let mut i = 0;
    while i < bytes.len() {
        if !in_single && !in_double && !in_backtick && haystack[i..].starts_with(needle) {
            return Some(i);
        }
        match bytes[i] {
            b'\\' if in_single || in_double => {
                i += 2;
                continue;
            }
            b'\'' if !in_double && !in_backtick => in_single = !in_single,
            b'"' if !in_single && !in_backtick => in_double = !in_double,
            b'`' if !in_single && !in_double => in_backtick = !in_backtick,
            _ => {}
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comment_lines_are_skipped() {
        let stmts = read_script("# a comment\n-- another comment\nSELECT 1;\n", &ScriptContext::new()).unwrap();
        assert_eq!(stmts.len(), 1);
        assert_eq!(stmts[0].text, "SELECT 1");
    }

    #[test]
    fn delimiter_change_is_honoured() {
        let script = "--delimiter ;;\nSELECT 1;\nSELECT 2;;\n--delimiter ;\nSELECT 3;\n";
        let stmts = read_script(script, &ScriptContext::new()).unwrap();
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0].text, "SELECT 1;\nSELECT 2");
        assert_eq!(stmts[1].text, "SELECT 3");
    }

    #[test]
    fn semicolon_inside_a_string_does_not_terminate_the_statement() {
        let script = "SELECT 'a;b';\n";
        let stmts = read_script(script, &ScriptContext::new()).unwrap();
        assert_eq!(stmts.len(), 1);
        assert_eq!(stmts[0].text, "SELECT 'a;b'");
    }

    #[test]
    fn if_block_is_skipped_when_condition_is_false() {
        let script = "--if (FEATURE_X)\n{\nSELECT 'enabled';\n}\nSELECT 'always';\n";
        let stmts = read_script(script, &ScriptContext::new()).unwrap();
        assert_eq!(stmts.len(), 1);
        assert_eq!(stmts[0].text, "SELECT 'always'");

        let mut ctx = ScriptContext::new();
        ctx.set("FEATURE_X", true);
        let stmts = read_script(script, &ctx).unwrap();
        assert_eq!(stmts.len(), 2);
    }

    #[test]
    fn error_annotates_the_following_statement_only() {
        let script = "--error 1064\nSELECT bogus;\nSELECT 1;\n";
        let stmts = read_script(script, &ScriptContext::new()).unwrap();
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].expect_error);
        assert_eq!(stmts[0].error_code, Some(1064));
        assert!(!stmts[1].expect_error);
    }

    #[test]
    fn perl_block_is_fatal() {
        let err = read_script("--perl\nprint 1;\n--end_perl\n", &ScriptContext::new());
        assert!(err.is_err());
    }
}
