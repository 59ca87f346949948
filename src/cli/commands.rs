//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::address::ResourceAddress;

/// Converge - plan and apply declarative infrastructure.
#[derive(Parser, Debug)]
#[command(name = "converge")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "CONVERGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Log format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new project.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the configuration.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Show what apply would change.
    Plan {
        /// Plan the destruction of every recorded instance.
        #[arg(long)]
        destroy: bool,

        /// Options shared by plan, apply and destroy
        #[command(flatten)]
        run: RunArgs,
    },

    /// Converge real objects towards the configuration.
    Apply {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Options shared by plan, apply and destroy
        #[command(flatten)]
        run: RunArgs,
    },

    /// Destroy every recorded instance.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Options shared by plan, apply and destroy
        #[command(flatten)]
        run: RunArgs,
    },

    /// Update state from the real objects.
    Refresh,

    /// Check for drift between state and the real objects.
    Drift,

    /// Adopt an existing object into state.
    Import {
        /// Address to record the object under.
        address: ResourceAddress,

        /// Provider-specific id of the object.
        id: String,
    },

    /// Inspect and manage state.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// Options shared by plan, apply and destroy.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Refresh recorded instances before planning.
    #[arg(long)]
    pub refresh: bool,

    /// Force replacement of an instance. May be repeated.
    #[arg(long, value_name = "ADDRESS")]
    pub replace: Vec<ResourceAddress>,
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show current state.
    Show,

    /// List recorded addresses.
    List,

    /// Forget instances without destroying them.
    Rm {
        /// Addresses to remove.
        #[arg(required = true)]
        addresses: Vec<ResourceAddress>,
    },

    /// Show who holds the state lock.
    Lock,

    /// Remove a lock left behind by a crashed run.
    Unlock {
        /// Lock ID shown by `state lock`.
        lock_id: String,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

/// Log format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable log lines.
    #[default]
    Text,
    /// One JSON object per log line.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_command_tree_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_apply_with_replace() {
        let cli = Cli::try_parse_from([
            "converge",
            "apply",
            "--yes",
            "--replace",
            "null_resource.a",
            "--replace",
            "null_resource.b",
        ])
        .unwrap();
        match cli.command {
            Commands::Apply { yes, run } => {
                assert!(yes);
                assert_eq!(run.replace.len(), 2);
                assert_eq!(run.replace[0], ResourceAddress::new("null_resource", "a"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_invalid_address_is_rejected() {
        assert!(Cli::try_parse_from(["converge", "import", "not-an-address", "id"]).is_err());
    }

    #[test]
    fn test_state_unlock_takes_lock_id() {
        let cli = Cli::try_parse_from(["converge", "--output", "json", "state", "unlock", "abc"]).unwrap();
        assert!(matches!(cli.output, OutputFormat::Json));
        assert!(matches!(
            cli.command,
            Commands::State { command: StateCommands::Unlock { ref lock_id } } if lock_id == "abc"
        ));
    }
}
