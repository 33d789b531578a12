//! Command-line interface for recurq.
//!
//! Provides job scheduler management, a worker command and a metrics dump.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
