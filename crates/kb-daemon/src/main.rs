//! kb retrieval daemon
//!
//! Embeds extracted document chunks into a local similarity index and serves
//! ranked searches over it.
//!
//! # Usage
//!
//! ```bash
//! kb-daemon start [--spool PATH]
//! kb-daemon search "lupus nephritis" [-k 5] [--json]
//! kb-daemon stats
//! kb-daemon admin remove-document <ID>
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded in order (later sources override earlier):
//! 1. Built-in defaults
//! 2. Config file (~/.config/kb-retrieval/config.toml)
//! 3. Environment variables (KB_*, `__` between nested keys)
//! 4. CLI flags

use anyhow::Result;
use clap::Parser;

use kb_daemon::{
    handle_admin, handle_search, show_config, show_stats, start_daemon, Cli, Commands, Overrides,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let overrides = Overrides {
        config: cli.config.as_deref(),
        log_level: cli.log_level.as_deref(),
        data_dir: cli.data_dir.as_deref(),
    };

    match cli.command {
        Commands::Start { spool } => {
            start_daemon(overrides, spool.as_deref()).await?;
        }
        Commands::Search { query, top_k, json } => {
            handle_search(overrides, &query, top_k, json).await?;
        }
        Commands::Stats { json } => {
            show_stats(overrides, json).await?;
        }
        Commands::Config => {
            show_config(overrides)?;
        }
        Commands::Admin { command } => {
            handle_admin(overrides, command).await?;
        }
    }

    Ok(())
}
