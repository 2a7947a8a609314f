//! CLI module for the Tierform engine.
//!
//! This module provides the command-line interface for planning,
//! applying and destroying resource graphs.

mod commands;
mod output;

pub use commands::{Cli, Commands, GraphFormat, LogFormat, OutputFormat, StateCommands};
pub use output::OutputFormatter;
