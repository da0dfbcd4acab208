//! CLI interface using clap
//!
//! Provides the command-line interface for Faultline

mod commands;

pub use commands::*;

use clap::{Parser, Subcommand};

/// Faultline - error tracking and performance monitoring backend
#[derive(Parser, Debug)]
#[command(name = "faultline")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the data directory (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".")]
    pub path: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json)
    #[arg(short = 'o', long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize the database and default configuration
    Init(InitArgs),

    /// Create a project (with default alert rules) to ingest into
    Project(ProjectArgs),

    /// Ingest error and performance payloads from a file or stdin
    Ingest(IngestArgs),

    /// Run a rollup pass over raw performance samples
    Rollup(RollupArgs),

    /// Evaluate incident state for all projects
    Evaluate,

    /// Run the minute scheduler (rollup + evaluation) until interrupted
    Run(RunArgs),

    /// Show database and incident status
    Status(StatusArgs),
}

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Arguments for init command
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Overwrite an existing configuration file with defaults
    #[arg(short, long)]
    pub force: bool,
}

/// Arguments for project command
#[derive(Parser, Debug)]
pub struct ProjectArgs {
    /// Project name
    pub name: String,
}

/// Arguments for ingest command
#[derive(Parser, Debug)]
pub struct IngestArgs {
    /// Project id to ingest into
    #[arg(short = 'P', long)]
    pub project: i64,

    /// JSON file holding one payload or an array of payloads (stdin if omitted)
    #[arg(short, long)]
    pub file: Option<String>,

    /// Batch id for retry-safe deduplication
    #[arg(short, long)]
    pub batch_id: Option<String>,
}

/// Arguments for rollup command
#[derive(Parser, Debug)]
pub struct RollupArgs {
    /// Run the hour pass instead of the minute pass
    #[arg(long)]
    pub hour: bool,
}

/// Arguments for run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Seconds between scheduler ticks
    #[arg(short, long, default_value = "60")]
    pub interval: u64,
}

/// Arguments for status command
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// How many recent notifications to show
    #[arg(short, long, default_value = "10")]
    pub limit: usize,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
