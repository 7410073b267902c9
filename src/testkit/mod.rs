//! Test tooling (spec §2 "Test harness", §6 "Test-script reader").

pub mod keycheck;
pub mod script;

pub use keycheck::{check, KeyCheckInput, KeyCheckReport};
pub use script::{read_script, ScriptContext, ScriptStatement};
