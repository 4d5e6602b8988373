//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - save: write a record locally and deliver it
//! - list/count/clear: inspect or empty a collection
//! - migrate: seed collections from legacy keys
//! - drain/status/run: work the offline queue

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Offsync - offline-first persistence with deferred remote sync
#[derive(Parser, Debug)]
#[command(name = "offsync")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Save a JSON payload locally and send it to the remote endpoint
    Save {
        /// Remote endpoint (POST /api/<endpoint>)
        endpoint: String,

        /// Local collection to store the record in
        collection: String,

        /// JSON payload
        payload: String,
    },

    /// List records in a collection
    List {
        /// Collection name
        collection: String,

        /// Only records not yet acknowledged by the remote
        #[arg(short, long)]
        unsynced: bool,
    },

    /// Count records in a collection
    Count {
        /// Collection name
        collection: String,
    },

    /// Delete every record in a collection
    Clear {
        /// Collection name
        collection: String,
    },

    /// Migrate legacy flat keys into collections
    Migrate,

    /// Drain the offline queue once, ignoring backoff
    Drain,

    /// Show backend and queue status
    Status,

    /// Run the sync scheduler until interrupted
    Run,
}
