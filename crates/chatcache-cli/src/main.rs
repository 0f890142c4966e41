//! chatcache CLI - local message cache for group chats

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chatcache_core::indexer::ReconcileReport;
use chatcache_core::models::Conversation;
use chatcache_core::scheduler::TaskState;
use chatcache_core::{Config, Database, HttpSource, Indexer, MessageSource};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "chatcache",
    author,
    version,
    about = "Local message cache with incremental sync",
    propagate_version = true
)]
struct Cli {
    /// Config file path
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// API access token (overrides config)
    #[arg(long, env = "CHATCACHE_TOKEN", global = true, hide_env_values = true)]
    token: Option<String>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Reconcile the cache with the remote service
    Sync {
        /// Wait for scheduled backfills to finish
        #[arg(long)]
        wait: bool,
    },

    /// Show indexing watermarks
    Status,

    /// Show cached messages of a conversation
    Show {
        /// Conversation ID (group id or chat composite id)
        conversation: String,

        /// Maximum messages
        #[arg(short, long, default_value = "20")]
        limit: i64,

        /// Only messages older than this message ID
        #[arg(long)]
        before: Option<String>,
    },

    /// Show cache statistics
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over -v
    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config_path = cli.config.unwrap_or_else(Config::default_config_path);
    let mut config = Config::ensure_at(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    if let Some(token) = cli.token {
        config.remote.token = Some(token);
    }

    let db = Database::open(&config.database)
        .await
        .with_context(|| format!("Failed to open cache at {}", config.database.display()))?;

    match cli.command {
        Command::Sync { wait } => cmd_sync(db, &config, wait, cli.json).await,
        Command::Status => cmd_status(&db, cli.json).await,
        Command::Show {
            conversation,
            limit,
            before,
        } => cmd_show(&db, &conversation, limit, before.as_deref(), cli.json).await,
        Command::Stats => cmd_stats(&db, cli.json).await,
    }
}

async fn list_conversations(source: &dyn MessageSource) -> chatcache_core::Result<Vec<Conversation>> {
    let (mut groups, chats) = futures::future::try_join(source.list_groups(), source.list_chats()).await?;
    groups.extend(chats);
    Ok(groups)
}

async fn cmd_sync(db: Database, config: &Config, wait: bool, json: bool) -> Result<()> {
    let source: Arc<dyn MessageSource> = Arc::new(
        HttpSource::new(&config.remote).context("Set CHATCACHE_TOKEN or pass --token to sync")?,
    );
    let indexer = Indexer::new(db, source.clone(), config);

    indexer.begin_transaction(None);
    let cycle = indexer.end_transaction();
    match list_conversations(source.as_ref()).await {
        Ok(listing) => indexer.supply_listing(listing),
        Err(err) => tracing::warn!(
            "Listing failed, retrying after {}s: {err}",
            config.sync.listing_timeout_secs
        ),
    }
    let report = cycle.await??;
    print_report(&report, json)?;

    if report.backfills_scheduled == 0 {
        return Ok(());
    }
    if !wait {
        if !json {
            println!("Backfills stop when this process exits; use --wait to let them finish.");
        }
        return Ok(());
    }

    if !json {
        println!("Waiting for backfills (Ctrl-C to cancel)...");
    }
    let scheduler = indexer.scheduler();
    tokio::select! {
        () = scheduler.wait_idle() => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("Interrupted, cancelling backfills");
            scheduler.cancel_all();
            scheduler.wait_idle().await;
        }
    }

    let finished = scheduler.list_finished();
    if json {
        println!("{}", serde_json::to_string_pretty(&finished)?);
        return Ok(());
    }
    for task in finished {
        let state = match &task.state {
            TaskState::Completed => "done".to_string(),
            TaskState::Cancelled => "cancelled".to_string(),
            TaskState::Failed(reason) => format!("failed: {reason}"),
        };
        println!("  {} | {}", task.info.name, state);
    }

    Ok(())
}

fn print_report(report: &ReconcileReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("Conversations: {} ({:?} listing)", report.conversations, report.listing);
    println!("Outdated:      {}", report.outdated);
    println!(
        "Caught up:     {} ({} new messages)",
        report.delta_resolved, report.delta_inserted
    );
    println!(
        "Backfills:     {} scheduled, {} already running",
        report.backfills_scheduled, report.backfills_skipped
    );
    Ok(())
}

async fn cmd_status(db: &Database, json: bool) -> Result<()> {
    let statuses = db.index_statuses().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }
    if statuses.is_empty() {
        println!("No conversations indexed yet.");
        return Ok(());
    }

    for status in statuses {
        let watermark = if status.last_indexed_id.is_empty() {
            "-"
        } else {
            status.last_indexed_id.as_str()
        };
        let updated = status
            .updated_at
            .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!("{} | {} | {}", status.conversation_id, watermark, updated);
    }

    Ok(())
}

async fn cmd_show(db: &Database, conversation: &str, limit: i64, before: Option<&str>, json: bool) -> Result<()> {
    let mut messages = db.get_messages_page(conversation, before, limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&messages)?);
        return Ok(());
    }
    if messages.is_empty() {
        println!("No cached messages.");
        return Ok(());
    }

    // Oldest first reads like a chat
    messages.reverse();
    for msg in messages {
        let date = msg.created_at.format("%Y-%m-%d %H:%M");
        let text = msg.text.as_deref().unwrap_or("");
        let mut extras = String::new();
        if let Some(count) = msg.attachments.as_array().map(Vec::len).filter(|n| *n > 0) {
            extras.push_str(&format!(" [{count} attachment(s)]"));
        }
        if !msg.liked_by.is_empty() {
            extras.push_str(&format!(" (+{})", msg.liked_by.len()));
        }
        println!("{} {} | {}: {}{}", msg.id, date, msg.sender_name, text, extras);
    }

    Ok(())
}

async fn cmd_stats(db: &Database, json: bool) -> Result<()> {
    let conv_count = db.count_conversations().await?;
    let msg_count = db.count_messages().await?;
    let indexed = db.index_statuses().await?.len();

    if json {
        let stats = serde_json::json!({
            "conversations": conv_count,
            "messages": msg_count,
            "indexed": indexed,
        });
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Cache Statistics");
    println!("----------------");
    println!("Conversations: {conv_count}");
    println!("Messages:      {msg_count}");
    println!("Indexed:       {indexed}");

    Ok(())
}
