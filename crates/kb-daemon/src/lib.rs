//! kb daemon library exports.
//!
//! - `cli`: command-line argument parsing with clap
//! - `commands`: command implementations (start, search, stats, admin, config)

pub mod cli;
pub mod commands;

pub use cli::{AdminCommands, Cli, Commands};
pub use commands::{
    handle_admin, handle_search, init_logging, load_settings, run_admin, show_config, show_stats,
    start_daemon, Overrides,
};
