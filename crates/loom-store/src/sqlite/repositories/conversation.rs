//! Conversation repository: metadata rows and cached counters.

use rusqlite::{Connection, OptionalExtension, params};

use crate::errors::Result;
use crate::sqlite::row_types::ConversationRow;

const COLUMNS: &str = "id, owner_user_id, title, format, settings, archived, created_at, updated_at, \
     message_count, total_branch_count, event_count, parent_conversation_id, forked_from_message_id";

/// Options for inserting a conversation row.
#[derive(Debug, Default)]
pub struct CreateConversationOptions<'a> {
    /// Conversation ID.
    pub id: &'a str,
    /// Owning user.
    pub owner_user_id: &'a str,
    /// Display title.
    pub title: &'a str,
    /// Wire format string.
    pub format: &'a str,
    /// JSON settings object; `None` stores `{}`.
    pub settings: Option<&'a str>,
    /// Fork provenance.
    pub parent_conversation_id: Option<&'a str>,
    /// Fork point in the parent.
    pub forked_from_message_id: Option<&'a str>,
}

/// Filters for listing a user's conversations.
#[derive(Debug, Default, Clone, Copy)]
pub struct ListConversationsOptions {
    /// Include archived conversations.
    pub include_archived: bool,
    /// Maximum rows.
    pub limit: Option<i64>,
    /// Rows to skip.
    pub offset: Option<i64>,
}

/// Conversation repository. Stateless; every method takes `&Connection`.
pub struct ConversationRepo;

impl ConversationRepo {
    /// Insert a new conversation with zeroed counters.
    pub fn create(conn: &Connection, opts: &CreateConversationOptions<'_>) -> Result<ConversationRow> {
        let now = chrono::Utc::now().to_rfc3339();
        let _ = conn.execute(
            "INSERT INTO conversations (id, owner_user_id, title, format, settings, created_at, updated_at,
                                        parent_conversation_id, forked_from_message_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7, ?8)",
            params![
                opts.id,
                opts.owner_user_id,
                opts.title,
                opts.format,
                opts.settings.unwrap_or("{}"),
                now,
                opts.parent_conversation_id,
                opts.forked_from_message_id,
            ],
        )?;
        Ok(ConversationRow {
            id: opts.id.to_string(),
            owner_user_id: opts.owner_user_id.to_string(),
            title: opts.title.to_string(),
            format: opts.format.to_string(),
            settings: opts.settings.unwrap_or("{}").to_string(),
            archived: false,
            created_at: now.clone(),
            updated_at: now,
            message_count: 0,
            total_branch_count: 0,
            event_count: 0,
            parent_conversation_id: opts.parent_conversation_id.map(String::from),
            forked_from_message_id: opts.forked_from_message_id.map(String::from),
        })
    }

    /// Get a conversation by ID.
    pub fn get_by_id(conn: &Connection, id: &str) -> Result<Option<ConversationRow>> {
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM conversations WHERE id = ?1"),
                params![id],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Conversations owned by or shared with `user_id`, most recently updated first.
    pub fn list_for_user(
        conn: &Connection,
        user_id: &str,
        opts: &ListConversationsOptions,
    ) -> Result<Vec<ConversationRow>> {
        let columns = COLUMNS
            .split(", ")
            .map(|c| format!("c.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {columns} FROM conversations c
             WHERE (c.owner_user_id = ?1
                    OR EXISTS (SELECT 1 FROM collaborators k
                               WHERE k.conversation_id = c.id AND k.user_id = ?1))
               AND (?2 OR c.archived = 0)
             ORDER BY c.updated_at DESC, c.id
             LIMIT ?3 OFFSET ?4"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![
                    user_id,
                    opts.include_archived,
                    opts.limit.unwrap_or(-1),
                    opts.offset.unwrap_or(0)
                ],
                Self::map_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Every conversation ID, oldest first.
    pub fn list_ids(conn: &Connection) -> Result<Vec<String>> {
        let mut stmt = conn.prepare("SELECT id FROM conversations ORDER BY created_at, id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    /// Conversations whose log holds at least `min_events` events.
    pub fn ids_with_event_count_at_least(conn: &Connection, min_events: i64) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT id FROM conversations WHERE event_count >= ?1 ORDER BY event_count DESC, id",
        )?;
        let ids = stmt
            .query_map(params![min_events], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    /// Update the title. Returns `false` if the row does not exist.
    pub fn update_title(conn: &Connection, id: &str, title: &str) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE conversations SET title = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, title, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    /// Replace the settings object. Returns `false` if the row does not exist.
    pub fn update_settings(conn: &Connection, id: &str, settings: &str) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE conversations SET settings = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, settings, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    /// Set or clear the archived flag. Returns `false` if the row does not exist.
    pub fn set_archived(conn: &Connection, id: &str, archived: bool) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE conversations SET archived = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, archived, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    /// Add `appended` to the event counter and bump `updated_at`.
    pub fn record_append(conn: &Connection, id: &str, appended: i64) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE conversations SET event_count = event_count + ?2, updated_at = ?3 WHERE id = ?1",
            params![id, appended, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    /// Overwrite the event counter (after compaction or restore).
    pub fn set_event_count(conn: &Connection, id: &str, event_count: i64) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE conversations SET event_count = ?2 WHERE id = ?1",
            params![id, event_count],
        )?;
        Ok(changed > 0)
    }

    /// Overwrite the cached tree size counters.
    pub fn set_tree_counters(
        conn: &Connection,
        id: &str,
        message_count: i64,
        total_branch_count: i64,
    ) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE conversations SET message_count = ?2, total_branch_count = ?3 WHERE id = ?1",
            params![id, message_count, total_branch_count],
        )?;
        Ok(changed > 0)
    }

    /// Delete the row; events, backups, collaborators and invites cascade.
    pub fn delete(conn: &Connection, id: &str) -> Result<bool> {
        let changed = conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    /// Count every conversation.
    pub fn count(conn: &Connection) -> Result<i64> {
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))?;
        Ok(count)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRow> {
        Ok(ConversationRow {
            id: row.get(0)?,
            owner_user_id: row.get(1)?,
            title: row.get(2)?,
            format: row.get(3)?,
            settings: row.get(4)?,
            archived: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            message_count: row.get(8)?,
            total_branch_count: row.get(9)?,
            event_count: row.get(10)?,
            parent_conversation_id: row.get(11)?,
            forked_from_message_id: row.get(12)?,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
