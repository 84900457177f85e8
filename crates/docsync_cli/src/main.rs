//! docsync CLI
//!
//! Command-line tools for replicating between JSON store snapshots.
//!
//! # Commands
//!
//! - `replicate` - Run a one-shot replication from a source to a target snapshot
//! - `pending` - List source documents not yet pushed to the target
//! - `reset-checkpoint` - Forget how far the source has replicated with the target

mod commands;
mod snapshot;

use clap::{Parser, Subcommand, ValueEnum};
use docsync_engine::ReplicatorType;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// docsync command-line replication tools.
#[derive(Parser)]
#[command(name = "docsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Replication direction, as seen from the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DirectionArg {
    Push,
    Pull,
    PushAndPull,
}

impl From<DirectionArg> for ReplicatorType {
    fn from(direction: DirectionArg) -> Self {
        match direction {
            DirectionArg::Push => ReplicatorType::Push,
            DirectionArg::Pull => ReplicatorType::Pull,
            DirectionArg::PushAndPull => ReplicatorType::PushAndPull,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a one-shot replication between two snapshots
    Replicate {
        /// Snapshot of the active (local) store; created if missing
        #[arg(short, long)]
        source: PathBuf,

        /// Snapshot of the passive (remote) store; created if missing
        #[arg(short, long)]
        target: PathBuf,

        /// Replication direction
        #[arg(short, long, value_enum, default_value = "push-and-pull")]
        direction: DirectionArg,

        /// Collections to replicate (repeatable)
        #[arg(short, long = "collection", default_value = "default")]
        collections: Vec<String>,

        /// Discard checkpoints and scan everything again
        #[arg(short, long)]
        reset: bool,
    },

    /// List source documents the target has not received
    Pending {
        /// Snapshot of the active (local) store
        #[arg(short, long)]
        source: PathBuf,

        /// Snapshot of the passive (remote) store
        #[arg(short, long)]
        target: PathBuf,

        /// Collection to inspect
        #[arg(short, long, default_value = "default")]
        collection: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Clear the stored checkpoint of the source for one collection
    ResetCheckpoint {
        /// Snapshot of the active (local) store
        #[arg(short, long)]
        source: PathBuf,

        /// Snapshot of the passive (remote) store
        #[arg(short, long)]
        target: PathBuf,

        /// Collection whose checkpoint is cleared
        #[arg(short, long, default_value = "default")]
        collection: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Replicate {
            source,
            target,
            direction,
            collections,
            reset,
        } => {
            let report =
                commands::replicate::run(&source, &target, direction.into(), &collections, reset)?;
            report.print();
            if let Some(err) = report.error {
                return Err(err.into());
            }
        }
        Commands::Pending {
            source,
            target,
            collection,
            format,
        } => {
            commands::pending::run(&source, &target, &collection, &format)?;
        }
        Commands::ResetCheckpoint {
            source,
            target,
            collection,
        } => {
            commands::reset::run(&source, &target, &collection)?;
        }
        Commands::Version => {
            println!("docsync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("replication protocol v{}", docsync_protocol::PROTOCOL_VERSION);
        }
    }

    Ok(())
}
