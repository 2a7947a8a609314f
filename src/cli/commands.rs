//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Tierform - declarative resource-graph engine.
#[derive(Parser, Debug)]
#[command(name = "tierform")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the plan file.
    #[arg(short, long, global = true, env = "TIERFORM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Log line format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new Tierform project.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the plan file.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Show the dependency graph.
    Graph {
        /// How to render the graph.
        #[arg(long, default_value = "order")]
        format: GraphFormat,
    },

    /// Compare the plan against recorded state.
    Plan {
        /// Preview a destroy instead of an apply.
        #[arg(long)]
        destroy: bool,

        /// List unchanged resources too.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Realize the plan.
    Apply {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Only apply these resources and what they depend on.
        #[arg(long = "target", value_name = "ID")]
        targets: Vec<String>,
    },

    /// Delete recorded resources, dependents first.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Only destroy these resources and what depends on them.
        #[arg(long = "target", value_name = "ID")]
        targets: Vec<String>,
    },

    /// Print resolved outputs.
    Output {
        /// Output name (prints all outputs if not specified).
        name: Option<String>,
    },

    /// Show recorded resource status.
    Status {
        /// Show realized attributes.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Manage state backend.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show current state.
    Show,

    /// List recorded resource identifiers.
    List,

    /// Unlock the state.
    Unlock {
        /// Lock ID to unlock.
        #[arg(long)]
        lock_id: Option<String>,

        /// Force unlock (dangerous).
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

/// Log line format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable log lines.
    #[default]
    Text,
    /// One JSON object per log line.
    Json,
}

/// Graph rendering options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum GraphFormat {
    /// Apply order, one resource per line.
    #[default]
    Order,
    /// Resources grouped by topological depth.
    Waves,
    /// Graphviz DOT.
    Dot,
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

    #[test]
    fn test_parse_apply_with_targets() {
        let cli = Cli::try_parse_from(["tierform", "apply", "--yes", "--target", "lb", "--target", "db"]).unwrap();
        match cli.command {
            Commands::Apply { yes, targets } => {
                assert!(yes);
                assert_eq!(targets, vec!["lb", "db"]);
            }
            other => panic!("expected apply, got {other:?}"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "tierform",
            "status",
            "-v",
            "--output",
            "json",
            "--log-format",
            "json",
            "--config",
            "stack.yaml",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.output, OutputFormat::Json);
        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(cli.config, Some(PathBuf::from("stack.yaml")));
    }

    #[test]
    fn test_parse_graph_and_plan() {
        let cli = Cli::try_parse_from(["tierform", "graph", "--format", "dot"]).unwrap();
        assert!(matches!(cli.command, Commands::Graph { format: GraphFormat::Dot }));

        let cli = Cli::try_parse_from(["tierform", "plan", "--destroy"]).unwrap();
        assert!(matches!(cli.command, Commands::Plan { destroy: true, detailed: false }));
    }

    #[test]
    fn test_parse_output_and_state() {
        let cli = Cli::try_parse_from(["tierform", "output", "lb_dns"]).unwrap();
        assert!(matches!(cli.command, Commands::Output { name: Some(ref n) } if n == "lb_dns"));

        let cli = Cli::try_parse_from(["tierform", "state", "unlock", "--force"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::State {
                command: StateCommands::Unlock { force: true, lock_id: None }
            }
        ));
    }

    #[test]
    fn test_unknown_format_rejected() {
        assert!(Cli::try_parse_from(["tierform", "graph", "--format", "svg"]).is_err());
    }
}
