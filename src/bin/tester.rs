//! Thin CLI over `qcache_filter::testkit::script`, mirroring the
//! original's `test/tester.cc` (spec §6 "Exit codes for test harnesses").
//!
//! Usage: `qcache-tester [-s <statement>] [-v <mask>] [file]`
//!
//! With `-s`, the single statement is read directly instead of a file.
//! `-v` sets a verbosity bitmask (reusing the session debug bits,
//! `qcache_filter::session::CACHE_DEBUG_*`) controlling how much of each
//! read statement is echoed. Exits 0 if the script was read and every
//! statement parsed without a reader error, non-zero otherwise.

use qcache_filter::session::CACHE_DEBUG_DECISIONS;
use qcache_filter::testkit::{read_script, ScriptContext};
use std::process::ExitCode;

struct Args {
    statement: Option<String>,
    verbosity: u32,
    file: Option<String>,
}

fn parse_args() -> Result<Args, String> {
    let mut statement = None;
    let mut verbosity = 0u32;
    let mut file = None;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-s" => {
                statement = Some(it.next().ok_or("-s requires a statement argument")?);
            }
            "-v" => {
                let raw = it.next().ok_or("-v requires a bitmask argument")?;
                verbosity = raw.parse::<u32>().map_err(|_| format!("invalid -v mask: {raw}"))?;
            }
            other => file = Some(other.to_string()),
        }
    }

    Ok(Args { statement, verbosity, file })
}

fn main() -> ExitCode {
    let _ = tracing_subscriber::fmt::try_init();

    let args = match parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("qcache-tester: {e}");
            return ExitCode::FAILURE;
        }
    };

    let text = if let Some(stmt) = &args.statement {
        format!("{stmt};\n")
    } else if let Some(path) = &args.file {
        match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) => {
                eprintln!("qcache-tester: could not read {path}: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        eprintln!("qcache-tester: need -s <statement> or a script file");
        return ExitCode::FAILURE;
    };

    let ctx = ScriptContext::new();
    match read_script(&text, &ctx) {
        Ok(statements) => {
            for (i, stmt) in statements.iter().enumerate() {
                if args.verbosity & CACHE_DEBUG_DECISIONS != 0 {
                    println!("[{i}] expect_error={} :: {}", stmt.expect_error, stmt.text);
                } else {
                    println!("{}", stmt.text);
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("qcache-tester: {e}");
            ExitCode::FAILURE
        }
    }
}
