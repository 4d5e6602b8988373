//! CLI module for offsync - command-line interface and subcommands.
//!
//! Provides subcommands for writing and inspecting local collections,
//! running the legacy migration and draining the offline queue.

pub mod commands;

pub use commands::Cli;
