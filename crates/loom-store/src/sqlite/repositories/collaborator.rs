//! Collaborator repository: persistent access grants.

use loom_core::Permission;
use rusqlite::{Connection, OptionalExtension, params};

use crate::errors::Result;
use crate::sqlite::row_types::CollaboratorRow;

/// Collaborator repository. Stateless; every method takes `&Connection`.
pub struct CollaboratorRepo;

impl CollaboratorRepo {
    /// Grant `permission` to `user_id`, replacing any earlier grant.
    pub fn grant(
        conn: &Connection,
        conversation_id: &str,
        user_id: &str,
        permission: Permission,
        invite_token: Option<&str>,
    ) -> Result<CollaboratorRow> {
        let now = chrono::Utc::now().to_rfc3339();
        let _ = conn.execute(
            "INSERT INTO collaborators (conversation_id, user_id, permission, granted_at, invite_token)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (conversation_id, user_id)
             DO UPDATE SET permission = excluded.permission,
                           granted_at = excluded.granted_at,
                           invite_token = excluded.invite_token",
            params![conversation_id, user_id, permission.as_str(), now, invite_token],
        )?;
        Ok(CollaboratorRow {
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            permission: permission.as_str().to_string(),
            granted_at: now,
            invite_token: invite_token.map(String::from),
        })
    }

    /// The grant `user_id` holds on the conversation, if any.
    pub fn get(conn: &Connection, conversation_id: &str, user_id: &str) -> Result<Option<CollaboratorRow>> {
        let row = conn
            .query_row(
                "SELECT conversation_id, user_id, permission, granted_at, invite_token
                 FROM collaborators WHERE conversation_id = ?1 AND user_id = ?2",
                params![conversation_id, user_id],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Every grant on the conversation, oldest first.
    pub fn list(conn: &Connection, conversation_id: &str) -> Result<Vec<CollaboratorRow>> {
        let mut stmt = conn.prepare(
            "SELECT conversation_id, user_id, permission, granted_at, invite_token
             FROM collaborators WHERE conversation_id = ?1 ORDER BY granted_at, user_id",
        )?;
        let rows = stmt
            .query_map(params![conversation_id], Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Remove a grant. Returns `false` if none existed.
    pub fn revoke(conn: &Connection, conversation_id: &str, user_id: &str) -> Result<bool> {
        let changed = conn.execute(
            "DELETE FROM collaborators WHERE conversation_id = ?1 AND user_id = ?2",
            params![conversation_id, user_id],
        )?;
        Ok(changed > 0)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CollaboratorRow> {
        Ok(CollaboratorRow {
            conversation_id: row.get(0)?,
            user_id: row.get(1)?,
            permission: row.get(2)?,
            granted_at: row.get(3)?,
            invite_token: row.get(4)?,
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
        conn.execute_batch("PRAGMA foreign_keys = ON").unwrap();
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
    fn grant_get_revoke() {
        let conn = setup();
        CollaboratorRepo::grant(&conn, "conv_1", "user_2", Permission::Viewer, None).unwrap();
        let row = CollaboratorRepo::get(&conn, "conv_1", "user_2").unwrap().unwrap();
        assert_eq!(row.permission_level(), Permission::Viewer);

        assert!(CollaboratorRepo::revoke(&conn, "conv_1", "user_2").unwrap());
        assert!(!CollaboratorRepo::revoke(&conn, "conv_1", "user_2").unwrap());
        assert!(CollaboratorRepo::get(&conn, "conv_1", "user_2").unwrap().is_none());
    }

    #[test]
    fn regrant_replaces_permission() {
        let conn = setup();
        CollaboratorRepo::grant(&conn, "conv_1", "user_2", Permission::Viewer, None).unwrap();
        CollaboratorRepo::grant(&conn, "conv_1", "user_2", Permission::Editor, Some("inv_1")).unwrap();
        let rows = CollaboratorRepo::list(&conn, "conv_1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].permission_level(), Permission::Editor);
        assert_eq!(rows[0].invite_token.as_deref(), Some("inv_1"));
    }

    #[test]
    fn grants_cascade_with_conversation() {
        let conn = setup();
        CollaboratorRepo::grant(&conn, "conv_1", "user_2", Permission::Viewer, None).unwrap();
        conn.execute("DELETE FROM conversations WHERE id = 'conv_1'", []).unwrap();
        assert!(CollaboratorRepo::list(&conn, "conv_1").unwrap().is_empty());
    }
}
