//! Log maintenance: compaction, backups, verification, blobs and the
//! background compaction task.

use std::sync::Arc;
use std::time::Duration;

use loom_core::{ConversationId, UserId};
use loom_settings::CompactionSettings;
use tracing::{debug, error, info, instrument, warn};

use super::{ConversationStore, count};
use crate::access::Capability;
use crate::compaction::CompactionOptions;
use crate::errors::Result;
use crate::event_log::{CompactionReport, EventLog, RestoreReport};
use crate::sqlite::repositories::blob::{BlobRepo, LoadedBlob};
use crate::sqlite::repositories::conversation::ConversationRepo;
use crate::sqlite::repositories::event::EventRepo;
use crate::sqlite::row_types::{BackupRow, ConversationRow};

/// Result of one compaction sweep over many conversations.
#[derive(Debug, Default)]
pub struct CompactionSweep {
    /// Conversations that were examined, including no-op passes.
    pub reports: Vec<CompactionReport>,
    /// Conversations whose compaction failed, with the error.
    pub failures: Vec<(ConversationId, String)>,
}

impl CompactionSweep {
    /// Conversations whose log was actually rewritten.
    pub fn rewritten(&self) -> usize {
        self.reports.iter().filter(|r| r.backup_id.is_some()).count()
    }
}

/// Consistency check of one conversation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifyReport {
    /// Conversation checked.
    pub conversation_id: ConversationId,
    /// Events in the log.
    pub events: usize,
    /// Replay failure, if any.
    pub replay_error: Option<String>,
    /// Whether the cached tree matches the replayed one; `None` when not cached
    /// or when replay failed.
    pub cache_matches: Option<bool>,
    /// Whether the stored counters match the replayed tree and log.
    pub counters_match: bool,
}

impl VerifyReport {
    /// No problem found.
    pub fn is_healthy(&self) -> bool {
        self.replay_error.is_none() && self.cache_matches != Some(false) && self.counters_match
    }
}

/// Metadata and log composition of one conversation.
#[derive(Clone, Debug)]
pub struct ConversationStats {
    /// Conversation row with its counters.
    pub conversation: ConversationRow,
    /// Logged events per type, most frequent first.
    pub events_by_type: Vec<(String, i64)>,
    /// Stored log backups.
    pub backups: usize,
}

impl ConversationStore {
    // ─────────────────────────────────────────────────────────────────────
    // Compaction and backups
    // ─────────────────────────────────────────────────────────────────────

    /// Compact a conversation's log without an access check.
    ///
    /// `None` if the conversation does not exist. The cached tree is dropped
    /// so the next read replays the rewritten log.
    #[instrument(skip_all, fields(conversation_id = %conversation_id))]
    pub fn compact_conversation(
        &self,
        conversation_id: &ConversationId,
        options: &CompactionOptions,
    ) -> Result<Option<CompactionReport>> {
        self.with_conversation_write_lock(conversation_id, || {
            let conn = self.conn()?;
            let Some(row) = ConversationRepo::get_by_id(&conn, conversation_id)? else {
                return Ok(None);
            };
            let report = self.retry_on_sqlite_busy(|| {
                EventLog::compact(&conn, conversation_id, row.conversation_format(), options)
            })?;
            if report.backup_id.is_some() {
                let _ = self.cache.invalidate(conversation_id);
            }
            Ok(Some(report))
        })
    }

    /// [`compact_conversation`](Self::compact_conversation) on behalf of the owner.
    pub fn compact_conversation_as(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
        options: &CompactionOptions,
    ) -> Result<Option<CompactionReport>> {
        let conn = self.conn()?;
        if self.authorize(&conn, conversation_id, user, Capability::Own)?.is_none() {
            return Ok(None);
        }
        drop(conn);
        self.compact_conversation(conversation_id, options)
    }

    /// Compact every conversation with at least `min_events` logged events.
    ///
    /// One conversation failing does not stop the sweep.
    #[instrument(skip_all, fields(min_events))]
    pub fn compact_eligible(&self, min_events: i64, options: &CompactionOptions) -> Result<CompactionSweep> {
        let ids = {
            let conn = self.conn()?;
            ConversationRepo::ids_with_event_count_at_least(&conn, min_events)?
        };
        let mut sweep = CompactionSweep::default();
        for id in ids {
            let id = ConversationId::from(id);
            match self.compact_conversation(&id, options) {
                Ok(Some(report)) => sweep.reports.push(report),
                Ok(None) => debug!(conversation_id = %id, "conversation vanished before compaction"),
                Err(e) => {
                    warn!(conversation_id = %id, error = %e, "compaction failed");
                    sweep.failures.push((id, e.to_string()));
                }
            }
        }
        info!(
            examined = sweep.reports.len(),
            rewritten = sweep.rewritten(),
            failed = sweep.failures.len(),
            "compaction sweep finished"
        );
        Ok(sweep)
    }

    /// Replace the log with a backup. Owner only; `None` if the
    /// conversation does not exist.
    #[instrument(skip_all, fields(conversation_id = %conversation_id, backup_id))]
    pub fn restore_backup(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
        backup_id: &str,
    ) -> Result<Option<RestoreReport>> {
        self.with_conversation_write_lock(conversation_id, || {
            let conn = self.conn()?;
            let Some(row) = self.authorize(&conn, conversation_id, user, Capability::Own)? else {
                return Ok(None);
            };
            let format = row.conversation_format();
            let report =
                self.retry_on_sqlite_busy(|| EventLog::restore_backup(&conn, conversation_id, format, backup_id))?;
            let _ = self.cache.invalidate(conversation_id);

            let handle = self.handle_locked(&conn, &row)?;
            let (messages, branches) = {
                let state = handle.read();
                (state.message_count(), state.branch_count())
            };
            if let Err(e) = self.retry_on_sqlite_busy(|| {
                ConversationRepo::set_tree_counters(&conn, conversation_id, count(messages), count(branches))
            }) {
                warn!(error = %e, "failed to update tree counters after restore");
            }
            Ok(Some(report))
        })
    }

    /// Stored backups, newest first. Owner only.
    pub fn list_backups(&self, conversation_id: &ConversationId, user: &UserId) -> Result<Vec<BackupRow>> {
        let conn = self.conn()?;
        if self.authorize(&conn, conversation_id, user, Capability::Own)?.is_none() {
            return Ok(Vec::new());
        }
        EventLog::list_backups(&conn, conversation_id)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Diagnostics
    // ─────────────────────────────────────────────────────────────────────

    /// Replay the log and compare it with the cache and stored counters.
    ///
    /// `None` if the conversation does not exist. Replay failures are
    /// reported, not returned as errors.
    #[instrument(skip_all, fields(conversation_id = %conversation_id))]
    pub fn verify_conversation(&self, conversation_id: &ConversationId) -> Result<Option<VerifyReport>> {
        self.with_conversation_write_lock(conversation_id, || {
            let conn = self.conn()?;
            let Some(row) = ConversationRepo::get_by_id(&conn, conversation_id)? else {
                return Ok(None);
            };
            let events = usize::try_from(EventRepo::count(&conn, conversation_id)?).unwrap_or(usize::MAX);
            let event_count_matches = count(events) == row.event_count;

            let report = match EventLog::load_state(&conn, conversation_id, row.conversation_format()) {
                Ok(replayed) => {
                    let cache_matches = self
                        .cache
                        .get(conversation_id)
                        .map(|handle| handle.read().observable() == replayed.observable());
                    VerifyReport {
                        conversation_id: conversation_id.clone(),
                        events,
                        replay_error: None,
                        cache_matches,
                        counters_match: event_count_matches
                            && count(replayed.message_count()) == row.message_count
                            && count(replayed.branch_count()) == row.total_branch_count,
                    }
                }
                Err(e) => {
                    error!(error = %e, "conversation failed verification");
                    VerifyReport {
                        conversation_id: conversation_id.clone(),
                        events,
                        replay_error: Some(e.to_string()),
                        cache_matches: None,
                        counters_match: event_count_matches,
                    }
                }
            };
            Ok(Some(report))
        })
    }

    /// Row, event mix and backup count. Any reader may ask.
    pub fn conversation_stats(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
    ) -> Result<Option<ConversationStats>> {
        let conn = self.conn()?;
        let Some(conversation) = self.authorize(&conn, conversation_id, user, Capability::Read)? else {
            return Ok(None);
        };
        let events_by_type = EventRepo::count_by_type(&conn, conversation_id)?;
        let backups = EventLog::list_backups(&conn, conversation_id)?.len();
        Ok(Some(ConversationStats {
            conversation,
            events_by_type,
            backups,
        }))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Blobs
    // ─────────────────────────────────────────────────────────────────────

    /// Store base64 content, returning the blob ID. Identical content
    /// shares one blob.
    pub fn save_blob(&self, data_base64: &str, mime_type: &str) -> Result<String> {
        let conn = self.conn()?;
        self.retry_on_sqlite_busy(|| BlobRepo::save(&conn, data_base64, mime_type))
    }

    /// Blob content and metadata.
    pub fn load_blob(&self, blob_id: &str) -> Result<Option<LoadedBlob>> {
        let conn = self.conn()?;
        BlobRepo::load(&conn, blob_id)
    }

    /// Remove a blob regardless of references.
    pub fn delete_blob(&self, blob_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        self.retry_on_sqlite_busy(|| BlobRepo::delete(&conn, blob_id))
    }

    /// Drop one reference, deleting the blob at zero. Returns the remaining
    /// count, or `None` if the blob does not exist.
    pub fn release_blob(&self, blob_id: &str) -> Result<Option<i64>> {
        let conn = self.conn()?;
        self.retry_on_sqlite_busy(|| BlobRepo::release(&conn, blob_id))
    }
}

/// Spawn a periodic compaction sweep.
///
/// Each tick runs [`ConversationStore::compact_eligible`] on the blocking
/// pool. Abort the returned handle on shutdown.
pub fn spawn_compaction_task(
    store: Arc<ConversationStore>,
    settings: CompactionSettings,
) -> tokio::task::JoinHandle<()> {
    let options = CompactionOptions::from(&settings);
    let period = Duration::from_secs(settings.interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            let _ = interval.tick().await;
            let store = Arc::clone(&store);
            let options = options.clone();
            let min_events = settings.min_events;
            match tokio::task::spawn_blocking(move || store.compact_eligible(min_events, &options)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "compaction sweep failed"),
                Err(e) => error!(error = %e, "compaction sweep panicked"),
            }
        }
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
