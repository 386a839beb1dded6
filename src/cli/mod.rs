//! CLI module for jobctl - command-line interface and subcommands.
//!
//! Provides the main entry point with subcommands for staging, execution,
//! configuration and recovery of the job folder.

pub mod commands;

pub use commands::Cli;
