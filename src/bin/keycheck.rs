//! Thin CLI over `qcache_filter::testkit::keycheck`, mirroring the
//! original's `test/keycheck.cc` (spec §6 "Exit codes for test
//! harnesses").
//!
//! Usage: `qcache-keycheck [-v <mask>] [file]`
//!
//! Each line of `file` (or stdin if no file is given) is
//! tab-separated `user\thost\tdefault_db\tquery` and is checked for
//! `CacheKey` determinism across repeated construction and across
//! threads. Exits 0 if every line checked out, non-zero if any line was
//! malformed or produced an unstable key.

use qcache_filter::testkit::{check, KeyCheckInput};
use std::io::Read;
use std::process::ExitCode;

struct Args {
    verbosity: u32,
    file: Option<String>,
}

fn parse_args() -> Result<Args, String> {
    let mut verbosity = 0u32;
    let mut file = None;
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-v" => {
                let raw = it.next().ok_or("-v requires a bitmask argument")?;
                verbosity = raw.parse::<u32>().map_err(|_| format!("invalid -v mask: {raw}"))?;
            }
            other => file = Some(other.to_string()),
        }
    }
    Ok(Args { verbosity, file })
}

fn read_input(args: &Args) -> Result<String, String> {
    match &args.file {
        Some(path) => std::fs::read_to_string(path).map_err(|e| format!("could not read {path}: {e}")),
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf).map_err(|e| format!("could not read stdin: {e}"))?;
            Ok(buf)
        }
    }
}

fn main() -> ExitCode {
    let _ = tracing_subscriber::fmt::try_init();

    let args = match parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("qcache-keycheck: {e}");
            return ExitCode::FAILURE;
        }
    };

    let text = match read_input(&args) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("qcache-keycheck: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut all_ok = true;
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() != 4 {
            eprintln!("qcache-keycheck: line {}: expected 4 tab-separated fields, got {}", lineno + 1, parts.len());
            all_ok = false;
            continue;
        }
        let input = KeyCheckInput {
            user: parts[0].to_string(),
            host: parts[1].to_string(),
            default_db: parts[2].to_string(),
            query: parts[3].as_bytes().to_vec(),
        };
        let report = check(input, 200, 8);
        if args.verbosity != 0 {
            println!("line {}: key={} ok={}", lineno + 1, report.key_hex, report.is_ok());
        }
        if !report.is_ok() {
            eprintln!("qcache-keycheck: line {}: unstable key for {:?}", lineno + 1, report.input);
            all_ok = false;
        }
    }

    if all_ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
