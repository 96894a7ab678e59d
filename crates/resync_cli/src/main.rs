//! resync CLI
//!
//! Command-line tools for resync record directories.
//!
//! # Commands
//!
//! - `inspect` - List records with their sync state
//! - `clear` - Delete one record or every record of a user
//! - `retry-failed` - Re-arm Failed records for the next sync
//!
//! The directory must not be open by a running engine; its lock file makes
//! every command fail in that case.

mod commands;

use clap::{Parser, Subcommand};
use commands::Target;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// resync command-line record tools.
#[derive(Parser)]
#[command(name = "resync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the record directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Application namespace the records belong to
    #[arg(global = true, short, long, default_value = "resync")]
    namespace: String,

    /// User whose records to operate on
    #[arg(global = true, short, long, default_value = "local")]
    user: String,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List records with their sync state
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Delete records
    Clear {
        /// Only delete this key (default: every record of the user)
        #[arg(short, long)]
        key: Option<String>,
    },

    /// Re-arm Failed records so the next sync retries them
    RetryFailed {
        /// Only re-arm this key
        #[arg(short, long)]
        key: Option<String>,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let target = |command: &str| -> Result<Target, String> {
        let path = cli
            .path
            .clone()
            .ok_or_else(|| format!("Record directory path required for {command}"))?;
        Ok(Target::new(path, &cli.namespace, &cli.user))
    };
    let mut out = io::stdout().lock();

    match &cli.command {
        Commands::Inspect { format } => {
            commands::inspect::run(&target("inspect")?, format, &mut out)?;
        }
        Commands::Clear { key } => {
            commands::clear::run(&target("clear")?, key.as_deref(), &mut out)?;
        }
        Commands::RetryFailed { key } => {
            commands::retry::run(&target("retry-failed")?, key.as_deref(), &mut out)?;
        }
        Commands::Version => {
            writeln!(out, "resync CLI v{}", env!("CARGO_PKG_VERSION"))?;
            writeln!(out, "record format v{}", resync_engine::RECORD_FORMAT)?;
        }
    }

    Ok(())
}
