//! Event repository: the append-only per-conversation log.

use rusqlite::{Connection, params};

use crate::errors::Result;
use crate::sqlite::row_types::EventRow;

/// Event repository. Stateless; every method takes `&Connection`.
pub struct EventRepo;

impl EventRepo {
    /// Sequence number the next appended event will get.
    pub fn next_sequence(conn: &Connection, conversation_id: &str) -> Result<i64> {
        let next: i64 = conn.query_row(
            "SELECT COALESCE(MAX(sequence), 0) + 1 FROM conversation_events WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;
        Ok(next)
    }

    /// Insert one event row at an explicit sequence.
    pub fn insert(conn: &Connection, row: &EventRow) -> Result<()> {
        let _ = conn.execute(
            "INSERT INTO conversation_events (conversation_id, sequence, type, payload, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                row.conversation_id,
                row.sequence,
                row.event_type,
                row.payload,
                row.recorded_at
            ],
        )?;
        Ok(())
    }

    /// Every event of a conversation in sequence order.
    pub fn list(conn: &Connection, conversation_id: &str) -> Result<Vec<EventRow>> {
        let mut stmt = conn.prepare(
            "SELECT conversation_id, sequence, type, payload, recorded_at
             FROM conversation_events WHERE conversation_id = ?1 ORDER BY sequence ASC",
        )?;
        let rows = stmt
            .query_map(params![conversation_id], Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Number of events in a conversation's log.
    pub fn count(conn: &Connection, conversation_id: &str) -> Result<i64> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM conversation_events WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Per-type event counts, most frequent first.
    pub fn count_by_type(conn: &Connection, conversation_id: &str) -> Result<Vec<(String, i64)>> {
        let mut stmt = conn.prepare(
            "SELECT type, COUNT(*) FROM conversation_events WHERE conversation_id = ?1
             GROUP BY type ORDER BY COUNT(*) DESC, type",
        )?;
        let rows = stmt
            .query_map(params![conversation_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Remove a conversation's whole log. Returns rows deleted.
    pub fn delete_all(conn: &Connection, conversation_id: &str) -> Result<usize> {
        let changed = conn.execute(
            "DELETE FROM conversation_events WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        Ok(changed)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRow> {
        Ok(EventRow {
            conversation_id: row.get(0)?,
            sequence: row.get(1)?,
            event_type: row.get(2)?,
            payload: row.get(3)?,
            recorded_at: row.get(4)?,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use crate::sqlite::migrations::run_migrations;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON").unwrap();
        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO conversations (id, owner_user_id, created_at, updated_at)
             VALUES ('conv_1', 'user_1', 'now', 'now')",
            [],
        )
        .unwrap();
        conn
    }

    fn row(sequence: i64, event_type: &str) -> EventRow {
        EventRow {
            conversation_id: "conv_1".into(),
            sequence,
            event_type: event_type.into(),
            payload: "{}".into(),
            recorded_at: "now".into(),
        }
    }

    #[test]
    fn sequences_start_at_one() {
        let conn = setup();
        assert_eq!(EventRepo::next_sequence(&conn, "conv_1").unwrap(), 1);
        EventRepo::insert(&conn, &row(1, "message.created")).unwrap();
        assert_eq!(EventRepo::next_sequence(&conn, "conv_1").unwrap(), 2);
    }

    #[test]
    fn duplicate_sequence_is_rejected() {
        let conn = setup();
        EventRepo::insert(&conn, &row(1, "message.created")).unwrap();
        assert!(EventRepo::insert(&conn, &row(1, "branch.added")).is_err());
    }

    #[test]
    fn list_orders_by_sequence() {
        let conn = setup();
        EventRepo::insert(&conn, &row(2, "branch.added")).unwrap();
        EventRepo::insert(&conn, &row(1, "message.created")).unwrap();
        let rows = EventRepo::list(&conn, "conv_1").unwrap();
        assert_eq!(rows.iter().map(|r| r.sequence).collect::<Vec<_>>(), [1, 2]);
        assert_eq!(EventRepo::count(&conn, "conv_1").unwrap(), 2);
    }

    #[test]
    fn count_by_type_groups() {
        let conn = setup();
        EventRepo::insert(&conn, &row(1, "message.created")).unwrap();
        EventRepo::insert(&conn, &row(2, "branch.added")).unwrap();
        EventRepo::insert(&conn, &row(3, "branch.added")).unwrap();
        let counts = EventRepo::count_by_type(&conn, "conv_1").unwrap();
        assert_eq!(counts[0], ("branch.added".to_string(), 2));
    }

    #[test]
    fn delete_all_empties_log() {
        let conn = setup();
        EventRepo::insert(&conn, &row(1, "message.created")).unwrap();
        assert_eq!(EventRepo::delete_all(&conn, "conv_1").unwrap(), 1);
        assert_eq!(EventRepo::count(&conn, "conv_1").unwrap(), 0);
    }
}
