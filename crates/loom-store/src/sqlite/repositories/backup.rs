//! Backup repository: full copies of event logs taken before compaction.
//!
//! The events column holds a JSON array of `{sequence, type, payload, recordedAt}`
//! objects, so a backup can be restored even if the live log was rewritten.

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::Result;
use crate::sqlite::row_types::{BackupRow, EventRow};

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredEvent {
    sequence: i64,
    #[serde(rename = "type")]
    event_type: String,
    payload: String,
    recorded_at: String,
}

/// Backup repository. Stateless; every method takes `&Connection`.
pub struct BackupRepo;

impl BackupRepo {
    /// Store a copy of `events` and return the backup's metadata.
    pub fn insert(conn: &Connection, conversation_id: &str, events: &[EventRow]) -> Result<BackupRow> {
        let stored: Vec<StoredEvent> = events
            .iter()
            .map(|e| StoredEvent {
                sequence: e.sequence,
                event_type: e.event_type.clone(),
                payload: e.payload.clone(),
                recorded_at: e.recorded_at.clone(),
            })
            .collect();
        let id = format!("bak_{}", Uuid::now_v7());
        let now = chrono::Utc::now().to_rfc3339();
        let event_count = i64::try_from(events.len()).unwrap_or(i64::MAX);
        let _ = conn.execute(
            "INSERT INTO event_log_backups (id, conversation_id, created_at, event_count, events)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, conversation_id, now, event_count, serde_json::to_string(&stored)?],
        )?;
        Ok(BackupRow {
            id,
            conversation_id: conversation_id.to_string(),
            created_at: now,
            event_count,
        })
    }

    /// Metadata and events of one backup.
    pub fn get(conn: &Connection, backup_id: &str) -> Result<Option<(BackupRow, Vec<EventRow>)>> {
        let found = conn
            .query_row(
                "SELECT id, conversation_id, created_at, event_count, events
                 FROM event_log_backups WHERE id = ?1",
                params![backup_id],
                |row| Ok((Self::map_row(row)?, row.get::<_, String>(4)?)),
            )
            .optional()?;
        let Some((meta, events_json)) = found else {
            return Ok(None);
        };
        let stored: Vec<StoredEvent> = serde_json::from_str(&events_json)?;
        let events = stored
            .into_iter()
            .map(|e| EventRow {
                conversation_id: meta.conversation_id.clone(),
                sequence: e.sequence,
                event_type: e.event_type,
                payload: e.payload,
                recorded_at: e.recorded_at,
            })
            .collect();
        Ok(Some((meta, events)))
    }

    /// Backups of a conversation, newest first.
    pub fn list(conn: &Connection, conversation_id: &str) -> Result<Vec<BackupRow>> {
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, created_at, event_count
             FROM event_log_backups WHERE conversation_id = ?1 ORDER BY created_at DESC, id DESC",
        )?;
        let rows = stmt
            .query_map(params![conversation_id], Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BackupRow> {
        Ok(BackupRow {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            created_at: row.get(2)?,
            event_count: row.get(3)?,
        })
    }
}

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use crate::sqlite::migrations::run_migrations;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO conversations (id, owner_user_id, created_at, updated_at)
             VALUES ('conv_1', 'owner', 'now', 'now')",
            [],
        )
        .unwrap();
        conn
    }

    fn event(sequence: i64) -> EventRow {
        EventRow {
            conversation_id: "conv_1".into(),
            sequence,
            event_type: "message.created".into(),
            payload: format!(r#"{{"n":{sequence}}}"#),
            recorded_at: "now".into(),
        }
    }

    #[test]
    fn insert_and_get_round_trip() {
        let conn = setup();
        let events = vec![event(1), event(2)];
        let meta = BackupRepo::insert(&conn, "conv_1", &events).unwrap();
        assert!(meta.id.starts_with("bak_"));
        assert_eq!(meta.event_count, 2);

        let (stored_meta, stored_events) = BackupRepo::get(&conn, &meta.id).unwrap().unwrap();
        assert_eq!(stored_meta, meta);
        assert_eq!(stored_events, events);
    }

    #[test]
    fn list_is_scoped_to_conversation() {
        let conn = setup();
        BackupRepo::insert(&conn, "conv_1", &[event(1)]).unwrap();
        BackupRepo::insert(&conn, "conv_1", &[]).unwrap();
        assert_eq!(BackupRepo::list(&conn, "conv_1").unwrap().len(), 2);
        assert!(BackupRepo::list(&conn, "conv_other").unwrap().is_empty());
        assert!(BackupRepo::get(&conn, "bak_missing").unwrap().is_none());
    }
}
