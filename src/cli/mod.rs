//! CLI module for the converge tool.
//!
//! This module provides the command-line interface: the clap command
//! tree and the formatting of plans, reports and state.

mod commands;
mod output;

pub use commands::{Cli, Commands, LogFormat, OutputFormat, RunArgs, StateCommands};
pub use output::{ConsoleHook, OutputFormatter};
