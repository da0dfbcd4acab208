//! Faultline - error tracking and performance monitoring backend
//!
//! Ingests error and performance payloads, groups errors into issues by
//! fingerprint, rolls performance samples into percentile aggregates and
//! tracks latency incidents with rate-limited alerting.

use anyhow::Result;
use clap::Parser;
use faultline::cli::{
    create_project, evaluate, ingest, init, rollup, run_loop, status, Cli, Commands,
};
use std::path::Path;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    // Get data directory
    let data_path = Path::new(&cli.path);

    // Execute command
    match cli.command {
        Commands::Init(args) => {
            init(data_path, args.force)?;
        }

        Commands::Project(args) => {
            create_project(data_path, &args.name, cli.format)?;
        }

        Commands::Ingest(args) => {
            ingest(data_path, &args, cli.format).await?;
        }

        Commands::Rollup(args) => {
            rollup(data_path, args.hour)?;
        }

        Commands::Evaluate => {
            evaluate(data_path).await?;
        }

        Commands::Run(args) => {
            run_loop(data_path, args.interval).await?;
        }

        Commands::Status(args) => {
            status(data_path, &args, cli.format)?;
        }
    }

    Ok(())
}
