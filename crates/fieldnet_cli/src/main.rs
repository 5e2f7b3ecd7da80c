//! FieldNet CLI
//!
//! Operator tools for FieldNet clients.
//!
//! # Commands
//!
//! - `inspect` - List the tasks pending in a sync log
//! - `verify` - Check every record of a sync log
//! - `compact` - Rewrite a sync log down to its live tasks
//! - `adapt` - Show how a request is shaped at a bandwidth level
//! - `usage` - Classify a byte count against a data cap

mod commands;

use clap::{Parser, Subcommand};
use commands::adapt::LevelArg;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// FieldNet command-line tools.
#[derive(Parser)]
#[command(name = "fieldnet")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the sync task log
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
    /// List pending sync tasks
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify sync log integrity
    Verify,

    /// Rewrite the sync log so it only holds live tasks
    Compact {
        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Show the request the queue would run at a bandwidth level
    Adapt {
        /// Bandwidth level
        #[arg(short, long, value_enum)]
        level: LevelArg,

        /// Payload cap of the original request
        #[arg(long, default_value_t = fieldnet_core::DEFAULT_MAX_PAYLOAD_BYTES)]
        max_bytes: u64,

        /// Per-attempt timeout of the original request, in milliseconds
        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,

        /// Retry budget of the original request
        #[arg(long, default_value_t = fieldnet_core::DEFAULT_RETRY_BUDGET)]
        retries: u32,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Classify data usage against a cap
    Usage {
        /// Bytes used this period
        #[arg(short, long)]
        bytes: u64,

        /// Cap in bytes (defaults to 50 MiB)
        #[arg(short, long)]
        cap: Option<u64>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
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
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Sync log path required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Sync log path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Compact { dry_run } => {
            let path = cli.path.ok_or("Sync log path required for compact")?;
            commands::compact::run(&path, dry_run)?;
        }
        Commands::Adapt {
            level,
            max_bytes,
            timeout_ms,
            retries,
            format,
        } => {
            commands::adapt::run(level.into(), max_bytes, timeout_ms, retries, &format)?;
        }
        Commands::Usage { bytes, cap, format } => {
            commands::usage::run(bytes, cap, &format)?;
        }
        Commands::Version => {
            println!("FieldNet CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("FieldNet Core v{}", fieldnet_core::VERSION);
        }
    }

    Ok(())
}
