//! Command-line interface for harbor.
//!
//! Provides commands for listing, checking, running and self-checking task
//! bundles, and for computing base-tree digests.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
