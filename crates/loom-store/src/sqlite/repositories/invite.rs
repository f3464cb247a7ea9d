//! Invite repository: single-use collaboration tokens.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use loom_core::Permission;
use rusqlite::{Connection, OptionalExtension, params};

use crate::errors::Result;
use crate::sqlite::row_types::InviteRow;

/// Random bytes per token.
const TOKEN_BYTES: usize = 24;

/// Invite repository. Stateless; every method takes `&Connection`.
pub struct InviteRepo;

impl InviteRepo {
    /// Issue a fresh unclaimed token.
    pub fn create(
        conn: &Connection,
        conversation_id: &str,
        permission: Permission,
        created_by: &str,
    ) -> Result<InviteRow> {
        let bytes: [u8; TOKEN_BYTES] = rand::random();
        let token = format!("inv_{}", URL_SAFE_NO_PAD.encode(bytes));
        let now = chrono::Utc::now().to_rfc3339();
        let _ = conn.execute(
            "INSERT INTO collaboration_invites (token, conversation_id, permission, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![token, conversation_id, permission.as_str(), created_by, now],
        )?;
        Ok(InviteRow {
            token,
            conversation_id: conversation_id.to_string(),
            permission: permission.as_str().to_string(),
            created_by: created_by.to_string(),
            created_at: now,
            claimed_by: None,
            claimed_at: None,
        })
    }

    /// Look up a token.
    pub fn get(conn: &Connection, token: &str) -> Result<Option<InviteRow>> {
        let row = conn
            .query_row(
                "SELECT token, conversation_id, permission, created_by, created_at, claimed_by, claimed_at
                 FROM collaboration_invites WHERE token = ?1",
                params![token],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Mark a token claimed. Returns `false` if it was already claimed or does not exist.
    pub fn mark_claimed(conn: &Connection, token: &str, claimed_by: &str) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE collaboration_invites SET claimed_by = ?2, claimed_at = ?3
             WHERE token = ?1 AND claimed_by IS NULL",
            params![token, claimed_by, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    /// Every invite issued for the conversation, oldest first.
    pub fn list(conn: &Connection, conversation_id: &str) -> Result<Vec<InviteRow>> {
        let mut stmt = conn.prepare(
            "SELECT token, conversation_id, permission, created_by, created_at, claimed_by, claimed_at
             FROM collaboration_invites WHERE conversation_id = ?1 ORDER BY created_at, token",
        )?;
        let rows = stmt
            .query_map(params![conversation_id], Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<InviteRow> {
        Ok(InviteRow {
            token: row.get(0)?,
            conversation_id: row.get(1)?,
            permission: row.get(2)?,
            created_by: row.get(3)?,
            created_at: row.get(4)?,
            claimed_by: row.get(5)?,
            claimed_at: row.get(6)?,
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

    #[test]
    fn tokens_are_unique_and_prefixed() {
        let conn = setup();
        let a = InviteRepo::create(&conn, "conv_1", Permission::Viewer, "owner").unwrap();
        let b = InviteRepo::create(&conn, "conv_1", Permission::Viewer, "owner").unwrap();
        assert!(a.token.starts_with("inv_"));
        assert_ne!(a.token, b.token);
        assert_eq!(InviteRepo::list(&conn, "conv_1").unwrap().len(), 2);
    }

    #[test]
    fn claim_is_single_use() {
        let conn = setup();
        let invite = InviteRepo::create(&conn, "conv_1", Permission::Editor, "owner").unwrap();
        assert!(InviteRepo::mark_claimed(&conn, &invite.token, "user_2").unwrap());
        assert!(!InviteRepo::mark_claimed(&conn, &invite.token, "user_3").unwrap());

        let stored = InviteRepo::get(&conn, &invite.token).unwrap().unwrap();
        assert_eq!(stored.claimed_by.as_deref(), Some("user_2"));
        assert!(stored.claimed_at.is_some());
    }

    #[test]
    fn unknown_token_is_none() {
        let conn = setup();
        assert!(InviteRepo::get(&conn, "inv_nope").unwrap().is_none());
        assert!(!InviteRepo::mark_claimed(&conn, "inv_nope", "user_2").unwrap());
    }
}
