//! Error types for the conversation store.
//!
//! [`TreeError`] covers structural violations raised while planning or
//! replaying tree mutations; it never touches storage. [`StoreError`] is the
//! error returned by every storage-facing operation and wraps [`TreeError`]
//! as [`StoreError::Invariant`].

use loom_core::{BranchId, MessageId};
use thiserror::Error;

/// Structural violations of the message tree.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TreeError {
    /// Parent pointer names a branch that does not exist in the conversation.
    #[error("parent branch {parent} does not exist")]
    UnknownParent {
        /// The missing branch.
        parent: BranchId,
    },

    /// A branch would be parented to another branch of its own message.
    #[error("branch of message {message_id} cannot have parent {parent} in the same message")]
    SameMessageParent {
        /// Message receiving the branch.
        message_id: MessageId,
        /// Offending parent.
        parent: BranchId,
    },

    /// Following parent pointers from the proposed parent reaches the message itself.
    #[error("parent {parent} would make message {message_id} its own ancestor")]
    CycleDetected {
        /// Message receiving the branch.
        message_id: MessageId,
        /// Offending parent.
        parent: BranchId,
    },

    /// A message with this ID already exists.
    #[error("message {0} already exists")]
    DuplicateMessage(MessageId),

    /// A branch with this ID already exists.
    #[error("branch {0} already exists")]
    DuplicateBranch(BranchId),

    /// A message snapshot has no branches.
    #[error("message {0} has no branches")]
    EmptyMessage(MessageId),

    /// The active branch pointer does not name a branch of the message.
    #[error("active branch {branch_id} is not a branch of message {message_id}")]
    InvalidActiveBranch {
        /// Message being checked.
        message_id: MessageId,
        /// Dangling pointer.
        branch_id: BranchId,
    },

    /// Streaming operation on a branch that is not being generated.
    #[error("branch {0} is not streaming")]
    NotStreaming(BranchId),

    /// Prefill conversations need a participant on every assistant branch.
    #[error("assistant branches in prefill conversations require a participant")]
    MissingParticipant,

    /// Post-hoc operations may only be carried by system branches.
    #[error("post-hoc operations must be carried by a system branch")]
    PostHocRequiresSystemRole,

    /// An event could not be folded into the current state.
    #[error("corrupt event: {0}")]
    Corrupt(String),
}

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `SQLite` database error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool error.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// JSON serialization/deserialization error.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Blob payload was not valid base64.
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Schema migration failed.
    #[error("migration error: {message}")]
    Migration {
        /// Describes which migration failed and why.
        message: String,
    },

    /// Requested conversation was not found.
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    /// A mutation would break a tree invariant.
    #[error("invariant violation: {0}")]
    Invariant(#[from] TreeError),

    /// The persisted event log cannot be replayed.
    #[error("corrupt event log for {conversation_id} at sequence {sequence}: {reason}")]
    CorruptLog {
        /// Conversation whose log is corrupt.
        conversation_id: String,
        /// First sequence number that failed.
        sequence: i64,
        /// What went wrong.
        reason: String,
    },

    /// Caller lacks the permission the operation requires.
    #[error("access denied")]
    AccessDenied,

    /// Invite token does not exist.
    #[error("invite not found")]
    InviteNotFound,

    /// Invite token was already used.
    #[error("invite already claimed")]
    InviteAlreadyClaimed,

    /// Claimer already owns or collaborates on the conversation.
    #[error("user already has access to this conversation")]
    AlreadyHaveAccess,

    /// Requested event log backup was not found.
    #[error("backup not found: {0}")]
    BackupNotFound(String),

    /// Compacted log would not reproduce the same conversation.
    #[error("compaction diverged for {conversation_id}: {reason}")]
    CompactionDiverged {
        /// Conversation being compacted.
        conversation_id: String,
        /// First observed difference.
        reason: String,
    },

    /// Import document is unusable.
    #[error("invalid import: {0}")]
    InvalidImport(String),

    /// Internal error (e.g. poisoned lock).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for store results.
pub type Result<T> = std::result::Result<T, StoreError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_error_display() {
        let err = StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows);
        assert!(err.to_string().contains("sqlite error"));
    }

    #[test]
    fn tree_error_converts_to_invariant() {
        let err: StoreError = TreeError::MissingParticipant.into();
        assert!(matches!(err, StoreError::Invariant(TreeError::MissingParticipant)));
        assert!(err.to_string().starts_with("invariant violation"));
    }

    #[test]
    fn corrupt_log_display_names_sequence() {
        let err = StoreError::CorruptLog {
            conversation_id: "conv_1".into(),
            sequence: 7,
            reason: "unknown message".into(),
        };
        let text = err.to_string();
        assert!(text.contains("conv_1"));
        assert!(text.contains("sequence 7"));
    }

    #[test]
    fn same_message_parent_display() {
        let err = TreeError::SameMessageParent {
            message_id: MessageId::from("msg_a"),
            parent: BranchId::from("br_a"),
        };
        assert!(err.to_string().contains("msg_a"));
    }
}
