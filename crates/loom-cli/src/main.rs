//! # loom-cli
//!
//! Maintenance command line for the Loom conversation store: inspect,
//! export and import conversations, compact and verify event logs, and run
//! the background compaction loop.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use loom_core::{BranchId, ConversationId, UserId};
use loom_settings::LoomSettings;
use loom_store::sqlite::repositories::conversation::ConversationRepo;
use loom_store::{
    CompactionOptions, ConversationExport, ConversationStore, ListConversationsOptions,
    spawn_compaction_task,
};

/// Loom conversation store maintenance.
#[derive(Parser, Debug)]
#[command(name = "loom", about = "Loom conversation store maintenance")]
struct Cli {
    /// Settings file (defaults to `~/.loom/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Database file, overriding settings.
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Log level filter, overriding settings.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List conversations visible to a user.
    List {
        /// Acting user.
        #[arg(long)]
        user: String,
        /// Include archived conversations.
        #[arg(long)]
        archived: bool,
    },
    /// Print the linear history ending at a branch as JSON.
    History {
        /// Conversation ID.
        conversation: String,
        /// Acting user.
        #[arg(long)]
        user: String,
        /// Leaf branch; defaults to the active branch of the last message.
        #[arg(long)]
        branch: Option<String>,
        /// Shape the history as the model sees it.
        #[arg(long)]
        ai: bool,
    },
    /// Write a conversation export document.
    Export {
        /// Conversation ID.
        conversation: String,
        /// Acting user.
        #[arg(long)]
        user: String,
        /// Output file; stdout when omitted.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Create a conversation from an export document.
    Import {
        /// Export file.
        file: PathBuf,
        /// Owner of the imported conversation.
        #[arg(long)]
        user: String,
    },
    /// Compact one conversation's event log.
    Compact {
        /// Conversation ID.
        conversation: String,
    },
    /// Compact every conversation past the event threshold.
    CompactAll {
        /// Event threshold, overriding settings.
        #[arg(long)]
        min_events: Option<i64>,
    },
    /// Replay logs and check them against stored counters.
    Verify {
        /// Conversation ID; every conversation when omitted.
        conversation: Option<String>,
    },
    /// List log backups of a conversation.
    Backups {
        /// Conversation ID.
        conversation: String,
        /// Owner.
        #[arg(long)]
        user: String,
    },
    /// Replace a conversation's log with a backup.
    RestoreBackup {
        /// Conversation ID.
        conversation: String,
        /// Backup ID.
        backup: String,
        /// Owner.
        #[arg(long)]
        user: String,
    },
    /// Show counters and event mix of a conversation.
    Stats {
        /// Conversation ID.
        conversation: String,
        /// Acting user.
        #[arg(long)]
        user: String,
    },
    /// Run background compaction until interrupted.
    Maintain,
}

fn load_settings(cli: &Cli) -> Result<LoomSettings> {
    let path = cli.settings.clone().unwrap_or_else(loom_settings::settings_path);
    let mut settings = loom_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    if let Some(db_path) = &cli.db_path {
        settings.storage.database_path = db_path.to_string_lossy().into_owned();
    }
    if let Some(level) = &cli.log_level {
        settings.logging.level.clone_from(level);
    }
    settings.logging.json |= cli.json_logs;
    Ok(settings)
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("Failed to encode JSON")?);
    Ok(())
}

fn read_export(path: &Path) -> Result<ConversationExport> {
    let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("{} is not a conversation export", path.display()))
}

fn verify(store: &ConversationStore, ids: Vec<String>) -> Result<bool> {
    let mut healthy = true;
    for id in ids {
        let id = ConversationId::from(id);
        let Some(report) = store.verify_conversation(&id)? else {
            println!("{id}: not found");
            healthy = false;
            continue;
        };
        if report.is_healthy() {
            println!("{id}: ok ({} events)", report.events);
        } else {
            healthy = false;
            println!(
                "{id}: FAILED replay_error={:?} cache_matches={:?} counters_match={}",
                report.replay_error, report.cache_matches, report.counters_match
            );
        }
    }
    Ok(healthy)
}

#[allow(clippy::too_many_lines)]
async fn run(cli: Cli, settings: LoomSettings) -> Result<()> {
    let store = Arc::new(ConversationStore::open(&settings).context("Failed to open conversation store")?);
    let options = CompactionOptions::from(&settings.compaction);

    match cli.command {
        Command::List { user, archived } => {
            let rows = store.list_conversations(
                &UserId::from(user),
                &ListConversationsOptions {
                    include_archived: archived,
                    ..Default::default()
                },
            )?;
            for row in rows {
                println!(
                    "{}\t{}\t{} messages\t{} events\t{}",
                    row.id, row.updated_at, row.message_count, row.event_count, row.title
                );
            }
        }
        Command::History {
            conversation,
            user,
            branch,
            ai,
        } => {
            let conversation = ConversationId::from(conversation);
            let user = UserId::from(user);
            let branch = match branch {
                Some(branch) => BranchId::from(branch),
                None => store
                    .get_messages(&conversation, &user)?
                    .last()
                    .map(|m| m.active_branch_id.clone())
                    .context("Conversation has no messages")?,
            };
            let history = if ai {
                store.get_ai_history(&conversation, &user, &branch)?
            } else {
                store.get_history(&conversation, &user, &branch)?
            };
            print_json(&history)?;
        }
        Command::Export {
            conversation,
            user,
            out,
        } => {
            let export = store
                .export_conversation(&ConversationId::from(conversation), &UserId::from(user))?
                .context("Conversation not found")?;
            match out {
                Some(path) => {
                    let json = serde_json::to_string_pretty(&export)?;
                    std::fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
                    tracing::info!(path = %path.display(), messages = export.messages.len(), "export written");
                }
                None => print_json(&export)?,
            }
        }
        Command::Import { file, user } => {
            let export = read_export(&file)?;
            let row = store.import_conversation(&UserId::from(user), &export)?;
            println!("{}", row.id);
        }
        Command::Compact { conversation } => {
            let report = store
                .compact_conversation(&ConversationId::from(conversation), &options)?
                .context("Conversation not found")?;
            println!(
                "{} -> {} events (dropped {}, merged {}, stripped {}, externalized {}), backup {}",
                report.events_before,
                report.events_after,
                report.stats.dropped,
                report.stats.merged,
                report.stats.debug_stripped,
                report.stats.externalized,
                report.backup_id.as_deref().unwrap_or("none")
            );
        }
        Command::CompactAll { min_events } => {
            let min_events = min_events.unwrap_or(settings.compaction.min_events);
            let sweep = store.compact_eligible(min_events, &options)?;
            println!(
                "examined {}, rewritten {}, failed {}",
                sweep.reports.len(),
                sweep.rewritten(),
                sweep.failures.len()
            );
            for (id, error) in &sweep.failures {
                println!("{id}: {error}");
            }
            if !sweep.failures.is_empty() {
                bail!("{} conversations failed to compact", sweep.failures.len());
            }
        }
        Command::Verify { conversation } => {
            let ids = match conversation {
                Some(id) => vec![id],
                None => {
                    let conn = store.pool().get().context("Failed to get DB connection")?;
                    ConversationRepo::list_ids(&conn)?
                }
            };
            if !verify(&store, ids)? {
                bail!("verification failed");
            }
        }
        Command::Backups { conversation, user } => {
            for backup in store.list_backups(&ConversationId::from(conversation), &UserId::from(user))? {
                println!("{}\t{}\t{} events", backup.id, backup.created_at, backup.event_count);
            }
        }
        Command::RestoreBackup {
            conversation,
            backup,
            user,
        } => {
            let report = store
                .restore_backup(&ConversationId::from(conversation), &UserId::from(user), &backup)?
                .context("Conversation not found")?;
            println!(
                "restored {} events from {}; previous log saved as {}",
                report.events, report.restored_from, report.replaced_backup_id
            );
        }
        Command::Stats { conversation, user } => {
            let stats = store
                .conversation_stats(&ConversationId::from(conversation), &UserId::from(user))?
                .context("Conversation not found")?;
            let row = &stats.conversation;
            println!("{} ({})", row.title, row.id);
            println!(
                "messages {}, branches {}, events {}, backups {}",
                row.message_count, row.total_branch_count, row.event_count, stats.backups
            );
            for (event_type, count) in &stats.events_by_type {
                println!("  {event_type:<28} {count}");
            }
        }
        Command::Maintain => {
            if !settings.compaction.enabled {
                tracing::warn!("compaction is disabled in settings; running anyway");
            }
            let task = spawn_compaction_task(Arc::clone(&store), settings.compaction.clone());
            tracing::info!(interval_secs = settings.compaction.interval_secs, "maintenance loop started");
            tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
            tracing::info!("Shutting down...");
            task.abort();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    if settings.logging.json {
        loom_core::logging::init_json_subscriber(&settings.logging.level);
    } else {
        loom_core::logging::init_subscriber(&settings.logging.level);
    }
    run(cli, settings).await
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
