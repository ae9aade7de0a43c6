use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "sitesync")]
#[command(about = "Offline-first record store with background sync for site teams")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the local database file (falls back to SITESYNC_DB_PATH)
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Sync server base URL (falls back to SITESYNC_SERVER_URL)
    #[arg(long, global = true, value_name = "URL")]
    pub server_url: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a record
    #[command(alias = "new")]
    Add {
        /// Entity kind (project, transaction, equipment, ...)
        kind: String,
        /// Fields as key=value pairs
        fields: Vec<String>,
        /// Fields as a JSON object (merged under key=value pairs)
        #[arg(long, value_name = "JSON")]
        json: Option<String>,
    },
    /// List records of a kind
    List {
        kind: String,
        #[arg(long)]
        company: Option<String>,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        status: Option<String>,
        /// Only records in this sync status (synced, pending, conflict)
        #[arg(long, value_name = "STATUS")]
        sync_status: Option<String>,
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one record
    Show { kind: String, id: String },
    /// Patch fields of a record
    Update {
        kind: String,
        id: String,
        /// Fields as key=value pairs
        fields: Vec<String>,
        #[arg(long, value_name = "JSON")]
        json: Option<String>,
    },
    /// Delete a record
    Delete { kind: String, id: String },
    /// Load demo records without queueing them for sync
    Seed,
    /// Show pending work, conflicts and the last sync time
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Run one sync cycle against the server
    Sync {
        /// Drop the pull cursor and request a full snapshot
        #[arg(long)]
        full: bool,
    },
    /// Keep syncing in the background until interrupted
    Watch {
        /// Seconds between connectivity probes
        #[arg(long, default_value = "15")]
        probe_interval: u64,
    },
    /// Inspect and settle sync conflicts
    Conflicts {
        #[command(subcommand)]
        command: ConflictCommands,
    },
    /// Inspect the outbox of queued mutations
    Outbox {
        #[command(subcommand)]
        command: OutboxCommands,
    },
    /// Compare the local version with the server's
    Version {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub enum ConflictCommands {
    /// List conflicts
    List {
        /// Include resolved conflicts that have not been pruned yet
        #[arg(long)]
        all: bool,
        #[arg(long)]
        json: bool,
    },
    /// Settle a conflict with local, server or merge
    Resolve {
        id: i64,
        #[arg(value_name = "STRATEGY")]
        strategy: String,
    },
}

#[derive(Subcommand)]
pub enum OutboxCommands {
    /// List queued actions
    List {
        /// Only actions in this status (pending, syncing, failed)
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Return failed actions to the queue
    Retry,
}
