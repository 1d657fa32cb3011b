//! CLI module for claimr - command-line interface and subcommands.
//!
//! One binary plays both roles: `serve` runs the registry server, the other
//! subcommands are clients of it.

pub mod commands;

pub use commands::Cli;
