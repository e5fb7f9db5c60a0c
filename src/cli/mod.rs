//! Command-line interface for swe-bench-harness.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};
