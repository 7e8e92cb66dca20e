//! Command implementations for the kb daemon.
//!
//! Handles:
//! - start: load config, build the application context, run ingestion
//! - search / stats: one-shot reads against the on-disk index
//! - admin: removals and index lifecycle operations
//! - config: print the effective settings

use anyhow::{bail, Context, Result};
use kb_retrieval::RankedChunk;
use kb_service::{AdminResponse, AdminService, AppContext, Settings};
use kb_vector::IndexStats;
use serde::Serialize;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::AdminCommands;

/// Flags that override loaded settings.
#[derive(Debug, Default, Clone, Copy)]
pub struct Overrides<'a> {
    pub config: Option<&'a str>,
    pub log_level: Option<&'a str>,
    pub data_dir: Option<&'a str>,
}

/// Load settings and apply CLI overrides (highest precedence).
pub fn load_settings(overrides: Overrides<'_>) -> Result<Settings> {
    let mut settings = Settings::load(overrides.config).context("Failed to load configuration")?;

    if let Some(data_dir) = overrides.data_dir {
        settings.data_dir = data_dir.to_string();
    }
    if let Some(log_level) = overrides.log_level {
        settings.log_level = log_level.to_string();
    }
    settings.validate().context("Invalid configuration")?;
    Ok(settings)
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_logging(settings: &Settings) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.log_level)),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;
    Ok(())
}

async fn open_context(settings: Settings) -> Result<AppContext> {
    AppContext::new(settings)
        .await
        .context("Failed to open knowledge base")
}

/// Start the ingestion daemon and block until shutdown.
///
/// 1. Load configuration (defaults -> file -> env -> CLI)
/// 2. Build the application context (index, embedder, scheduler)
/// 3. Run the sampler and ingestion loop
/// 4. On SIGINT/SIGTERM cancel, persist and exit
pub async fn start_daemon(overrides: Overrides<'_>, spool: Option<&str>) -> Result<()> {
    let mut settings = load_settings(overrides)?;
    if let Some(spool) = spool {
        settings.spool_path = Some(spool.to_string());
    }
    init_logging(&settings)?;

    info!("kb daemon starting...");
    info!("Configuration:");
    info!("  Data directory: {}", settings.expanded_data_dir().display());
    info!("  Spool: {}", settings.spool_path().display());
    info!("  Index: {} x {}", settings.index.kind.as_str(), settings.index.dimension);
    info!("  Embedding provider: {:?}", settings.embedding.provider);
    info!("  Log level: {}", settings.log_level);

    let ctx = open_context(settings).await?;

    let token = CancellationToken::new();
    let signals = {
        let token = token.clone();
        tokio::spawn(async move {
            if let Err(e) = wait_for_shutdown().await {
                warn!(error = %e, "Signal handling failed, shutting down");
            }
            token.cancel();
        })
    };

    let result = ctx.run(token).await;
    signals.abort();
    result.context("Ingestion loop failed")?;

    info!("kb daemon stopped");
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    #[cfg(unix)]
    let terminate = terminate.recv();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        result = signal::ctrl_c() => {
            result.context("Failed to install Ctrl+C handler")?;
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
    Ok(())
}

/// Run a search and print the ranked results.
pub async fn handle_search(
    overrides: Overrides<'_>,
    query: &str,
    top_k: usize,
    json: bool,
) -> Result<()> {
    let settings = load_settings(overrides)?;
    init_logging(&settings)?;
    let ctx = open_context(settings).await?;

    let results = ctx
        .knowledge_base()
        .search(query, top_k)
        .await
        .context("Search failed")?;

    if json {
        print_json(&results)
    } else {
        print!("{}", render_results(query, &results));
        Ok(())
    }
}

fn render_results(query: &str, results: &[RankedChunk]) -> String {
    if results.is_empty() {
        return format!("No results for '{}'\n", query);
    }

    let mut out = String::new();
    for (rank, result) in results.iter().enumerate() {
        out.push_str(&format!(
            "{}. [{}] score={:.4} distance={:.4} overlap={}\n",
            rank + 1,
            result.source_type(),
            result.score,
            result.distance,
            result.keyword_overlap
        ));
        if let Some(title) = &result.metadata.title {
            out.push_str(&format!("   {}\n", title));
        }
        let location = result
            .metadata
            .url
            .as_deref()
            .or(result.metadata.file_path.as_deref());
        match (location, result.metadata.page_number) {
            (Some(location), Some(page)) => out.push_str(&format!("   {} (page {})\n", location, page)),
            (Some(location), None) => out.push_str(&format!("   {}\n", location)),
            _ => {}
        }
        out.push_str(&format!("   {}\n", preview(&result.text, 160)));
    }
    out
}

fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{}...", cut.trim_end())
}

/// Print index statistics.
pub async fn show_stats(overrides: Overrides<'_>, json: bool) -> Result<()> {
    let settings = load_settings(overrides)?;
    init_logging(&settings)?;
    let ctx = open_context(settings).await?;

    let stats = ctx
        .knowledge_base()
        .stats()
        .context("Failed to read index statistics")?;

    if json {
        print_json(&stats)
    } else {
        print!("{}", render_stats(&stats));
        Ok(())
    }
}

fn render_stats(stats: &IndexStats) -> String {
    let mut out = format!(
        "Index: {} ({} dimensions, {})\nTotal chunks: {}\n",
        stats.kind.as_str(),
        stats.dimension,
        if stats.loaded { "loaded" } else { "unloaded" },
        stats.total
    );
    for (source_type, count) in &stats.by_type {
        out.push_str(&format!("  {:<8} {}\n", source_type.as_str(), count));
    }
    if stats.pending_reembed > 0 {
        out.push_str(&format!("Awaiting re-embed: {}\n", stats.pending_reembed));
    }
    out
}

/// Print the effective configuration with secrets masked.
pub fn show_config(overrides: Overrides<'_>) -> Result<()> {
    let settings = load_settings(overrides)?;
    print!("{}", render_config(&settings)?);
    Ok(())
}

fn render_config(settings: &Settings) -> Result<String> {
    let mut shown = settings.clone();
    if shown.embedding.api_key.is_some() {
        shown.embedding.api_key = Some("********".to_string());
    }
    toml::to_string_pretty(&shown).context("Failed to render configuration")
}

/// Handle an admin command; a failed operation exits non-zero.
pub async fn handle_admin(overrides: Overrides<'_>, command: AdminCommands) -> Result<()> {
    let settings = load_settings(overrides)?;
    init_logging(&settings)?;
    let ctx = open_context(settings).await?;

    let response = run_admin(&ctx.admin(), &command)?;
    print_json(&response)?;
    if !response.success {
        bail!(response.message);
    }
    Ok(())
}

/// Execute one admin command against the service.
pub fn run_admin(
    admin: &AdminService,
    command: &AdminCommands,
) -> Result<AdminResponse<serde_json::Value>> {
    match command {
        AdminCommands::RemoveDocument { document_id } => to_value(admin.remove_by_id(document_id)),
        AdminCommands::RemoveUrl { pattern } => to_value(admin.remove_by_url_pattern(pattern)),
        AdminCommands::RemoveFile { pattern } => {
            to_value(admin.remove_by_filename_pattern(pattern))
        }
        AdminCommands::Clear { yes } => {
            if !yes {
                bail!("Refusing to clear the index without --yes");
            }
            to_value(admin.clear_all())
        }
        AdminCommands::Unload => to_value(admin.unload()),
        AdminCommands::Reload => to_value(admin.reload()),
    }
}

fn to_value<T: Serialize>(response: AdminResponse<T>) -> Result<AdminResponse<serde_json::Value>> {
    let data = response
        .data
        .map(serde_json::to_value)
        .transpose()
        .context("Failed to serialize admin response")?;
    Ok(AdminResponse {
        success: response.success,
        message: response.message,
        data,
    })
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", rendered);
    Ok(())
}
