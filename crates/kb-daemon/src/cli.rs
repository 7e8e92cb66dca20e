//! CLI argument parsing for the kb daemon.
//!
//! CLI flags override every other configuration source.

use clap::{Parser, Subcommand};

/// Knowledge-base retrieval daemon
///
/// Embeds extracted document chunks into a local similarity index and answers
/// ranked searches over it.
#[derive(Parser, Debug)]
#[command(name = "kb-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default ~/.config/kb-retrieval/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Set log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Override the data directory (index snapshot, progress, spool)
    #[arg(long, global = true)]
    pub data_dir: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the ingestion loop until Ctrl+C or SIGTERM
    Start {
        /// JSON-lines work spool to ingest from
        #[arg(long)]
        spool: Option<String>,
    },

    /// Search the index
    Search {
        /// Query text
        query: String,

        /// Number of results
        #[arg(short = 'k', long, default_value = "5")]
        top_k: usize,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show index statistics
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config,

    /// Administrative commands
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },
}

/// Admin subcommands
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum AdminCommands {
    /// Remove every chunk of a document
    RemoveDocument {
        /// Parent document id
        document_id: String,
    },

    /// Remove chunks whose URL contains a pattern
    RemoveUrl {
        pattern: String,
    },

    /// Remove chunks whose file path contains a pattern
    RemoveFile {
        pattern: String,
    },

    /// Remove every chunk
    Clear {
        /// Confirm the index should be emptied
        #[arg(long)]
        yes: bool,
    },

    /// Drop the in-memory index and report how many chunks it held
    Unload,

    /// Reload the index from its snapshot
    Reload,
}
