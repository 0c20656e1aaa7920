//! mvdb CLI
//!
//! Command-line tools for mvdb database maintenance.
//!
//! # Commands
//!
//! - `inspect` - Display the manifest: maps, chunks, checkpoint mark
//! - `verify` - Verify pages and redo log records
//! - `dump-log` - Dump redo log records for debugging
//! - `checkpoint` - Replay the redo log and write a checkpoint

mod commands;

use clap::{Parser, Subcommand};
use commands::{CliResult, OutputFormat};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// mvdb command-line database tools.
#[derive(Parser)]
#[command(name = "mvdb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the database directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display manifest contents
    Inspect {
        /// Show per-chunk details
        #[arg(short, long)]
        chunks: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Verify database integrity
    Verify {
        /// Check redo log records
        #[arg(short, long)]
        log: bool,

        /// Check pages
        #[arg(short = 'g', long)]
        pages: bool,

        /// Check all (default if no flags specified)
        #[arg(short, long)]
        all: bool,
    },

    /// Dump redo log records for debugging
    DumpLog {
        /// Maximum number of records to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Only records touching this map
        #[arg(short, long)]
        map: Option<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Replay the redo log into pages and trim it
    Checkpoint {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Show version information
    Version,
}

fn run(cli: Cli) -> CliResult<()> {
    match cli.command {
        Commands::Inspect { chunks, format } => {
            let path = commands::require_path(cli.path, "inspect")?;
            commands::inspect::run(&path, chunks, format)
        }
        Commands::Verify { log, pages, all } => {
            let path = commands::require_path(cli.path, "verify")?;
            let check_all = all || (!log && !pages);
            commands::verify::run(&path, log || check_all, pages || check_all)
        }
        Commands::DumpLog { limit, map, format } => {
            let path = commands::require_path(cli.path, "dump-log")?;
            commands::dump_log::run(&path, limit, map.as_deref(), format)
        }
        Commands::Checkpoint { format } => {
            let path = commands::require_path(cli.path, "checkpoint")?;
            commands::checkpoint::run(&path, format)
        }
        Commands::Version => {
            println!("mvdb CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("manifest format v{}", mvdb_core::manifest::MANIFEST_VERSION);
            println!("redo log format v{}", mvdb_core::redo::REDO_VERSION);
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
