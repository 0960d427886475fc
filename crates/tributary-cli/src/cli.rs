use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tributary")]
#[command(about = "Capture SQLite table changes and replicate them to a replica table")]
#[command(version)]
pub struct Cli {
    /// Path to tributary.toml config file
    #[arg(short, long, global = true, default_value = "tributary.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new tributary project (creates config files)
    Init {
        /// Directory to initialize (defaults to current directory)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Install capture triggers and create the replica table
    Setup,

    /// Start the replication loop
    Run {
        /// Exit after the first cycle that delivers nothing
        #[arg(long)]
        once: bool,
    },

    /// Replicate everything currently pending, then exit
    Sync {
        /// Override the configured batch size
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Show captured tables and delivery counts
    Status,

    /// Print a health report for the captured table
    Health {
        /// Emit the report as JSON
        #[arg(long)]
        json: bool,

        /// Exit with a non-zero status when the report is not healthy
        #[arg(long)]
        strict: bool,
    },

    /// Manage the dead letter queue
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },

    /// Remove the capture triggers (the change log is kept)
    Teardown,
}

#[derive(Subcommand)]
pub enum DlqCommands {
    /// List dead-lettered changes
    List {
        /// Maximum number of entries to show
        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Return dead-lettered changes to the pending set
    Retry {
        /// Retry a specific change by sequence id
        #[arg(long, conflicts_with = "all")]
        id: Option<u64>,

        /// Retry every dead-lettered change
        #[arg(long)]
        all: bool,
    },
}
