//! Durable per-conversation event log.
//!
//! Every tree mutation is recorded as one row of `conversation_events`
//! holding the JSON-serialized [`TreeEvent`]. Folding the rows in sequence
//! order from an empty tree reproduces the conversation exactly.
//!
//! Appends run inside the caller's transaction so the conversation counters
//! and the events land atomically. Compaction and backup restore open their
//! own transaction and swap the whole log in one commit.

use loom_core::{ConversationFormat, ConversationId};
use tracing::{debug, error, info, instrument, warn};

use crate::compaction::{
    CompactionOptions, CompactionStats, LoggedEvent, plan_compaction, rewrite_payloads,
};
use crate::errors::{Result, StoreError};
use crate::events::TreeEvent;
use crate::sqlite::repositories::backup::BackupRepo;
use crate::sqlite::repositories::blob::BlobRepo;
use crate::sqlite::repositories::conversation::ConversationRepo;
use crate::sqlite::repositories::event::EventRepo;
use crate::sqlite::row_types::{BackupRow, EventRow};
use crate::tree::TreeState;

/// Outcome of compacting one conversation's log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompactionReport {
    /// Conversation compacted.
    pub conversation_id: ConversationId,
    /// Backup holding the pre-compaction log; `None` when the pass found
    /// nothing to rewrite and left the log untouched.
    pub backup_id: Option<String>,
    /// Events before compaction.
    pub events_before: usize,
    /// Events after compaction.
    pub events_after: usize,
    /// What the pass did.
    pub stats: CompactionStats,
}

/// Outcome of restoring a log from a backup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestoreReport {
    /// Backup the log was restored from.
    pub restored_from: String,
    /// Backup of the log that was replaced.
    pub replaced_backup_id: String,
    /// Events now in the log.
    pub events: usize,
}

/// Event log operations. Stateless; every method takes `&Connection`.
pub struct EventLog;

impl EventLog {
    /// Append one event and return its sequence number.
    pub fn append(
        conn: &rusqlite::Connection,
        conversation_id: &ConversationId,
        event: &TreeEvent,
    ) -> Result<i64> {
        let sequences = Self::append_batch(conn, conversation_id, std::slice::from_ref(event))?;
        sequences
            .first()
            .copied()
            .ok_or_else(|| StoreError::Internal("append produced no sequence".into()))
    }

    /// Append `events` in order and bump the conversation's event counter.
    pub fn append_batch(
        conn: &rusqlite::Connection,
        conversation_id: &ConversationId,
        events: &[TreeEvent],
    ) -> Result<Vec<i64>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        let first = EventRepo::next_sequence(conn, conversation_id)?;
        let recorded_at = chrono::Utc::now().to_rfc3339();
        let mut sequences = Vec::with_capacity(events.len());
        for (offset, event) in (0_i64..).zip(events) {
            let sequence = first + offset;
            EventRepo::insert(
                conn,
                &EventRow {
                    conversation_id: conversation_id.to_string(),
                    sequence,
                    event_type: event.event_type().as_str().to_string(),
                    payload: serde_json::to_string(event)?,
                    recorded_at: recorded_at.clone(),
                },
            )?;
            sequences.push(sequence);
        }
        let appended = i64::try_from(events.len()).unwrap_or(i64::MAX);
        if !ConversationRepo::record_append(conn, conversation_id, appended)? {
            return Err(StoreError::ConversationNotFound(conversation_id.to_string()));
        }
        debug!(
            conversation_id = %conversation_id,
            first_sequence = first,
            count = events.len(),
            "events appended"
        );
        Ok(sequences)
    }

    /// Every event of the conversation in append order.
    ///
    /// A row whose payload does not parse, or whose type column disagrees
    /// with its payload, aborts with [`StoreError::CorruptLog`].
    pub fn replay(conn: &rusqlite::Connection, conversation_id: &ConversationId) -> Result<Vec<LoggedEvent>> {
        EventRepo::list(conn, conversation_id)?
            .iter()
            .map(decode_row)
            .collect()
    }

    /// Fold the persisted log into a fresh tree.
    #[instrument(skip_all, fields(conversation_id = %conversation_id))]
    pub fn load_state(
        conn: &rusqlite::Connection,
        conversation_id: &ConversationId,
        format: ConversationFormat,
    ) -> Result<TreeState> {
        let events = Self::replay(conn, conversation_id)?;
        let state = fold(conversation_id, format, &events)?;
        debug!(
            events = events.len(),
            messages = state.message_count(),
            "conversation replayed"
        );
        Ok(state)
    }

    /// Rewrite the log into its compacted form.
    ///
    /// The full pre-compaction log is stored as a backup in the same
    /// transaction. A pass that would change nothing writes nothing. If the compacted log does not fold to an observably
    /// identical tree nothing is written and
    /// [`StoreError::CompactionDiverged`] is returned.
    #[instrument(skip_all, fields(conversation_id = %conversation_id))]
    pub fn compact(
        conn: &rusqlite::Connection,
        conversation_id: &ConversationId,
        format: ConversationFormat,
        options: &CompactionOptions,
    ) -> Result<CompactionReport> {
        let tx = conn.unchecked_transaction()?;

        let rows = EventRepo::list(&tx, conversation_id)?;
        let logged = rows.iter().map(decode_row).collect::<Result<Vec<_>>>()?;
        let before = fold(conversation_id, format, &logged)?.observable();

        let mut stats = CompactionStats::default();
        let mut compacted = plan_compaction(logged, &mut stats);
        rewrite_payloads(&mut compacted, options, &mut stats, &mut |data: &str, mime: &str| {
            BlobRepo::save(&tx, data, mime)
        })?;
        if stats == CompactionStats::default() {
            debug!(events = rows.len(), "event log already compact");
            return Ok(CompactionReport {
                conversation_id: conversation_id.clone(),
                backup_id: None,
                events_before: rows.len(),
                events_after: rows.len(),
                stats,
            });
        }

        let diverged = |reason: String| StoreError::CompactionDiverged {
            conversation_id: conversation_id.to_string(),
            reason,
        };
        let after = TreeState::from_events(
            conversation_id.clone(),
            format,
            compacted.iter().map(|l| &l.event),
        )
        .map_err(|(index, e)| diverged(format!("compacted event {index} does not apply: {e}")))?
        .observable();
        if after != before {
            warn!("compacted log does not reproduce the conversation, rolling back");
            return Err(diverged("replayed state differs from the original".into()));
        }

        let backup = BackupRepo::insert(&tx, conversation_id, &rows)?;
        let _ = EventRepo::delete_all(&tx, conversation_id)?;
        for (sequence, logged) in (1_i64..).zip(&compacted) {
            EventRepo::insert(
                &tx,
                &EventRow {
                    conversation_id: conversation_id.to_string(),
                    sequence,
                    event_type: logged.event.event_type().as_str().to_string(),
                    payload: serde_json::to_string(&logged.event)?,
                    recorded_at: logged.recorded_at.clone(),
                },
            )?;
        }
        let events_after = compacted.len();
        let _ = ConversationRepo::set_event_count(
            &tx,
            conversation_id,
            i64::try_from(events_after).unwrap_or(i64::MAX),
        )?;
        tx.commit()?;

        info!(
            backup_id = %backup.id,
            events_before = rows.len(),
            events_after,
            dropped = stats.dropped,
            merged = stats.merged,
            debug_stripped = stats.debug_stripped,
            externalized = stats.externalized,
            "event log compacted"
        );
        Ok(CompactionReport {
            conversation_id: conversation_id.clone(),
            backup_id: Some(backup.id),
            events_before: rows.len(),
            events_after,
            stats,
        })
    }

    /// Replace the live log with the contents of a backup.
    ///
    /// The replaced log is itself backed up first, so a restore can be undone.
    #[instrument(skip_all, fields(conversation_id = %conversation_id))]
    pub fn restore_backup(
        conn: &rusqlite::Connection,
        conversation_id: &ConversationId,
        format: ConversationFormat,
        backup_id: &str,
    ) -> Result<RestoreReport> {
        let tx = conn.unchecked_transaction()?;
        let (meta, rows) = BackupRepo::get(&tx, backup_id)?
            .filter(|(meta, _)| meta.conversation_id == conversation_id.as_str())
            .ok_or_else(|| StoreError::BackupNotFound(backup_id.to_string()))?;

        let logged = rows.iter().map(decode_row).collect::<Result<Vec<_>>>()?;
        let _ = fold(conversation_id, format, &logged)?;

        let current = EventRepo::list(&tx, conversation_id)?;
        let replaced = BackupRepo::insert(&tx, conversation_id, &current)?;
        let _ = EventRepo::delete_all(&tx, conversation_id)?;
        for row in &rows {
            EventRepo::insert(&tx, row)?;
        }
        let _ = ConversationRepo::set_event_count(
            &tx,
            conversation_id,
            i64::try_from(rows.len()).unwrap_or(i64::MAX),
        )?;
        tx.commit()?;

        info!(
            restored_from = %meta.id,
            replaced_backup_id = %replaced.id,
            events = rows.len(),
            "event log restored from backup"
        );
        Ok(RestoreReport {
            restored_from: meta.id,
            replaced_backup_id: replaced.id,
            events: rows.len(),
        })
    }

    /// Backups of the conversation's log, newest first.
    pub fn list_backups(conn: &rusqlite::Connection, conversation_id: &ConversationId) -> Result<Vec<BackupRow>> {
        BackupRepo::list(conn, conversation_id)
    }
}

fn decode_row(row: &EventRow) -> Result<LoggedEvent> {
    let corrupt = |reason: String| StoreError::CorruptLog {
        conversation_id: row.conversation_id.clone(),
        sequence: row.sequence,
        reason,
    };
    let event: TreeEvent = serde_json::from_str(&row.payload)
        .map_err(|e| corrupt(format!("payload does not parse: {e}")))?;
    if event.event_type().as_str() != row.event_type {
        return Err(corrupt(format!(
            "type column {} disagrees with payload type {}",
            row.event_type,
            event.event_type()
        )));
    }
    Ok(LoggedEvent {
        sequence: row.sequence,
        event,
        recorded_at: row.recorded_at.clone(),
    })
}

fn fold(
    conversation_id: &ConversationId,
    format: ConversationFormat,
    events: &[LoggedEvent],
) -> Result<TreeState> {
    TreeState::from_events(conversation_id.clone(), format, events.iter().map(|l| &l.event)).map_err(
        |(index, e)| {
            let sequence = events.get(index).map_or(-1, |l| l.sequence);
            error!(
                conversation_id = %conversation_id,
                sequence,
                error = %e,
                "event log replay failed"
            );
            StoreError::CorruptLog {
                conversation_id: conversation_id.to_string(),
                sequence,
                reason: e.to_string(),
            }
        },
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
