//! Rows as stored in `SQLite`.
//!
//! Columns map one-to-one onto fields. Enum columns stay as strings here and
//! are parsed by the accessor helpers, so a row can always be read even if a
//! later version wrote a value this one does not know.

use loom_core::{ConversationFormat, Permission};
use serde_json::Value;

/// A row of `conversations`.
#[derive(Clone, Debug, PartialEq)]
pub struct ConversationRow {
    /// Conversation ID.
    pub id: String,
    /// Owning user.
    pub owner_user_id: String,
    /// Display title.
    pub title: String,
    /// `standard` or `prefill`.
    pub format: String,
    /// Opaque JSON settings object.
    pub settings: String,
    /// Soft-hidden from listings.
    pub archived: bool,
    /// Creation timestamp (RFC 3339).
    pub created_at: String,
    /// Last write timestamp (RFC 3339).
    pub updated_at: String,
    /// Messages currently in the tree.
    pub message_count: i64,
    /// Branches currently in the tree.
    pub total_branch_count: i64,
    /// Events currently in the log.
    pub event_count: i64,
    /// Conversation this one was forked from.
    pub parent_conversation_id: Option<String>,
    /// Message the fork was taken at.
    pub forked_from_message_id: Option<String>,
}

impl ConversationRow {
    /// Parsed format column.
    pub fn conversation_format(&self) -> ConversationFormat {
        self.format.parse().unwrap_or_default()
    }

    /// Parsed settings column; malformed JSON reads as an empty object.
    pub fn settings_value(&self) -> Value {
        serde_json::from_str(&self.settings).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
    }
}

/// A row of `conversation_events`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventRow {
    /// Owning conversation.
    pub conversation_id: String,
    /// Position in the log, starting at 1.
    pub sequence: i64,
    /// Dotted event type.
    pub event_type: String,
    /// JSON payload.
    pub payload: String,
    /// When the event was appended (RFC 3339).
    pub recorded_at: String,
}

/// A row of `blobs`, without the content column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobRow {
    /// Blob ID.
    pub id: String,
    /// Hex SHA-256 of the content.
    pub hash: String,
    /// MIME type.
    pub mime_type: String,
    /// Content length in bytes.
    pub size: i64,
    /// Creation timestamp.
    pub created_at: String,
    /// Live references.
    pub ref_count: i64,
}

/// A row of `collaborators`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollaboratorRow {
    /// Shared conversation.
    pub conversation_id: String,
    /// Collaborating user.
    pub user_id: String,
    /// `viewer`, `collaborator` or `editor`.
    pub permission: String,
    /// When access was granted.
    pub granted_at: String,
    /// Invite the grant came from.
    pub invite_token: Option<String>,
}

impl CollaboratorRow {
    /// Parsed permission; unknown values degrade to read-only.
    pub fn permission_level(&self) -> Permission {
        self.permission.parse().unwrap_or(Permission::Viewer)
    }
}

/// A row of `collaboration_invites`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InviteRow {
    /// Opaque invite token.
    pub token: String,
    /// Conversation the invite grants access to.
    pub conversation_id: String,
    /// Permission granted on claim.
    pub permission: String,
    /// Issuing owner.
    pub created_by: String,
    /// Issue timestamp.
    pub created_at: String,
    /// Claiming user, once claimed.
    pub claimed_by: Option<String>,
    /// Claim timestamp.
    pub claimed_at: Option<String>,
}

impl InviteRow {
    /// Whether the token has been used.
    pub fn is_claimed(&self) -> bool {
        self.claimed_by.is_some()
    }

    /// Parsed permission; unknown values degrade to read-only.
    pub fn permission_level(&self) -> Permission {
        self.permission.parse().unwrap_or(Permission::Viewer)
    }
}

/// A row of `event_log_backups`, without the events column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupRow {
    /// Backup ID.
    pub id: String,
    /// Conversation the backup belongs to.
    pub conversation_id: String,
    /// When the backup was taken.
    pub created_at: String,
    /// Events captured.
    pub event_count: i64,
}
