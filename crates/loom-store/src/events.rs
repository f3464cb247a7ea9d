//! Tree mutation events.
//!
//! Every change to a conversation's message tree is recorded as exactly one
//! or more [`TreeEvent`]s. Events carry fully resolved data (generated IDs,
//! timestamps, cascade results) so folding them never consults a clock or an
//! RNG and always reproduces the same tree.
//!
//! [`EventType`] is the discriminator persisted alongside each payload.

use std::fmt;
use std::str::FromStr;

use loom_core::{BranchId, ContentBlock, GenerationState, MessageId};
use serde::{Deserialize, Serialize};

use crate::tree::cascade::CascadePlan;
use crate::types::{Bookmark, Branch, Message};

/// Event type discriminators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// New message with its first branch.
    #[serde(rename = "message.created")]
    MessageCreated,
    /// Message removed along with its dependants.
    #[serde(rename = "message.deleted")]
    MessageDeleted,
    /// Message split into two.
    #[serde(rename = "message.split")]
    MessageSplit,
    /// Display position changed.
    #[serde(rename = "message.reordered")]
    MessageReordered,
    /// Previously deleted message put back.
    #[serde(rename = "message.restored")]
    MessageRestored,
    /// Alternative branch added to a message.
    #[serde(rename = "branch.added")]
    BranchAdded,
    /// Active branch switched.
    #[serde(rename = "branch.activated")]
    BranchActivated,
    /// Branch removed along with its dependants.
    #[serde(rename = "branch.deleted")]
    BranchDeleted,
    /// Previously deleted branch put back.
    #[serde(rename = "branch.restored")]
    BranchRestored,
    /// Streaming text appended.
    #[serde(rename = "branch.content_appended")]
    BranchContentAppended,
    /// Streaming finished or aborted.
    #[serde(rename = "branch.generation_ended")]
    BranchGenerationEnded,
    /// Bookmark set or relabelled.
    #[serde(rename = "bookmark.set")]
    BookmarkSet,
    /// Bookmark removed.
    #[serde(rename = "bookmark.removed")]
    BookmarkRemoved,
}

/// Every event type, in declaration order.
pub const ALL_EVENT_TYPES: &[EventType] = &[
    EventType::MessageCreated,
    EventType::MessageDeleted,
    EventType::MessageSplit,
    EventType::MessageReordered,
    EventType::MessageRestored,
    EventType::BranchAdded,
    EventType::BranchActivated,
    EventType::BranchDeleted,
    EventType::BranchRestored,
    EventType::BranchContentAppended,
    EventType::BranchGenerationEnded,
    EventType::BookmarkSet,
    EventType::BookmarkRemoved,
];

impl EventType {
    /// Wire string for this type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MessageCreated => "message.created",
            Self::MessageDeleted => "message.deleted",
            Self::MessageSplit => "message.split",
            Self::MessageReordered => "message.reordered",
            Self::MessageRestored => "message.restored",
            Self::BranchAdded => "branch.added",
            Self::BranchActivated => "branch.activated",
            Self::BranchDeleted => "branch.deleted",
            Self::BranchRestored => "branch.restored",
            Self::BranchContentAppended => "branch.content_appended",
            Self::BranchGenerationEnded => "branch.generation_ended",
            Self::BookmarkSet => "bookmark.set",
            Self::BookmarkRemoved => "bookmark.removed",
        }
    }

    /// Whether a later event of the same kind on the same target fully
    /// overrides this one.
    pub fn is_last_writer_wins(self) -> bool {
        matches!(
            self,
            Self::BranchActivated | Self::MessageReordered | Self::BookmarkSet | Self::BookmarkRemoved
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ALL_EVENT_TYPES
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown event type: {s}"))
    }
}

/// A single recorded tree mutation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum TreeEvent {
    /// New message with one branch.
    #[serde(rename = "message.created")]
    MessageCreated {
        /// Full message as created.
        message: Message,
    },

    /// Message deleted; `cascade` lists everything removed with it.
    #[serde(rename = "message.deleted")]
    MessageDeleted {
        /// Deleted message.
        message_id: MessageId,
        /// Removal set computed when the deletion was planned.
        cascade: CascadePlan,
    },

    /// Branch content split at `position` characters into a new message.
    #[serde(rename = "message.split")]
    MessageSplit {
        /// Message that was split.
        message_id: MessageId,
        /// Branch that was split.
        branch_id: BranchId,
        /// Content kept on the original branch.
        head: String,
        /// New message holding the tail.
        created: Message,
        /// Branches that pointed at the split branch and now point at the
        /// new message's branch.
        reparented: Vec<(MessageId, BranchId)>,
    },

    /// Display position changed.
    #[serde(rename = "message.reordered")]
    MessageReordered {
        /// Moved message.
        message_id: MessageId,
        /// New position.
        order: i64,
    },

    /// Deleted message restored from a snapshot.
    #[serde(rename = "message.restored")]
    MessageRestored {
        /// Snapshot being restored.
        message: Message,
    },

    /// Alternative branch added.
    #[serde(rename = "branch.added")]
    BranchAdded {
        /// Receiving message.
        message_id: MessageId,
        /// New branch.
        branch: Branch,
        /// Whether the new branch became active.
        activate: bool,
    },

    /// Active branch switched.
    #[serde(rename = "branch.activated")]
    BranchActivated {
        /// Message.
        message_id: MessageId,
        /// Newly active branch.
        branch_id: BranchId,
    },

    /// Branch deleted; `cascade` lists everything removed with it.
    #[serde(rename = "branch.deleted")]
    BranchDeleted {
        /// Owning message.
        message_id: MessageId,
        /// Deleted branch.
        branch_id: BranchId,
        /// Removal set computed when the deletion was planned.
        cascade: CascadePlan,
    },

    /// Deleted branch restored from a snapshot.
    #[serde(rename = "branch.restored")]
    BranchRestored {
        /// Owning message.
        message_id: MessageId,
        /// Snapshot being restored.
        branch: Branch,
    },

    /// Streamed text appended to a generating branch.
    #[serde(rename = "branch.content_appended")]
    BranchContentAppended {
        /// Owning message.
        message_id: MessageId,
        /// Streaming branch.
        branch_id: BranchId,
        /// Appended text.
        delta: String,
    },

    /// Generation ended.
    #[serde(rename = "branch.generation_ended")]
    BranchGenerationEnded {
        /// Owning message.
        message_id: MessageId,
        /// Branch that was streaming.
        branch_id: BranchId,
        /// `Complete` or `Aborted`.
        state: GenerationState,
        /// Final structured content, replacing any previous blocks.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content_blocks: Option<Vec<ContentBlock>>,
    },

    /// Bookmark set (upsert).
    #[serde(rename = "bookmark.set")]
    BookmarkSet {
        /// Resulting bookmark.
        bookmark: Bookmark,
    },

    /// Bookmark removed.
    #[serde(rename = "bookmark.removed")]
    BookmarkRemoved {
        /// Bookmarked message.
        message_id: MessageId,
        /// Bookmarked branch.
        branch_id: BranchId,
    },
}

impl TreeEvent {
    /// Discriminator for this event.
    pub fn event_type(&self) -> EventType {
        match self {
            Self::MessageCreated { .. } => EventType::MessageCreated,
            Self::MessageDeleted { .. } => EventType::MessageDeleted,
            Self::MessageSplit { .. } => EventType::MessageSplit,
            Self::MessageReordered { .. } => EventType::MessageReordered,
            Self::MessageRestored { .. } => EventType::MessageRestored,
            Self::BranchAdded { .. } => EventType::BranchAdded,
            Self::BranchActivated { .. } => EventType::BranchActivated,
            Self::BranchDeleted { .. } => EventType::BranchDeleted,
            Self::BranchRestored { .. } => EventType::BranchRestored,
            Self::BranchContentAppended { .. } => EventType::BranchContentAppended,
            Self::BranchGenerationEnded { .. } => EventType::BranchGenerationEnded,
            Self::BookmarkSet { .. } => EventType::BookmarkSet,
            Self::BookmarkRemoved { .. } => EventType::BookmarkRemoved,
        }
    }

    /// Branches carried in full by this event.
    pub(crate) fn branches_mut(&mut self) -> Vec<&mut Branch> {
        match self {
            Self::MessageCreated { message } | Self::MessageRestored { message } => {
                message.branches.iter_mut().collect()
            }
            Self::MessageSplit { created, .. } => created.branches.iter_mut().collect(),
            Self::BranchAdded { branch, .. } | Self::BranchRestored { branch, .. } => vec![branch],
            _ => Vec::new(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
