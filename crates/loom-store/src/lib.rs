//! # loom-store
//!
//! Event-sourced store for branching conversations, backed by `SQLite`.
//!
//! - **Tree**: messages hold alternative branches; every branch points at a
//!   parent branch in another message or at the root. [`TreeState`] is the
//!   in-memory fold of a conversation's events.
//! - **Event log**: append-only, replayable per conversation, with
//!   compaction, backups and restore
//! - **Cascade deletion**: removing a branch removes everything whose
//!   ancestry ran only through it
//! - **Fork engine**: fork, duplicate, export and import with ID remapping
//! - **Access control**: owner and collaborator tiers, invites, private branches
//! - **Cache**: bounded LRU of materialized trees shared by readers and the
//!   single writer per conversation
//! - **Store**: the transactional [`ConversationStore`] facade tying it together

#![deny(unsafe_code)]

pub mod access;
pub mod cache;
pub mod compaction;
pub mod errors;
pub mod event_log;
pub mod events;
pub mod fork;
pub mod sqlite;
pub mod store;
pub mod tree;
pub mod types;

pub use access::{Access, Capability};
pub use cache::{ConversationCache, ConversationHandle};
pub use compaction::{CompactionOptions, CompactionStats};
pub use errors::{Result, StoreError, TreeError};
pub use event_log::{CompactionReport, EventLog, RestoreReport};
pub use events::{EventType, TreeEvent};
pub use fork::ForkMode;
pub use sqlite::connection::{ConnectionConfig, ConnectionPool};
pub use sqlite::repositories::conversation::ListConversationsOptions;
pub use sqlite::row_types::{BackupRow, CollaboratorRow, ConversationRow, InviteRow};
pub use store::{
    CompactionSweep, ConversationStats, ConversationStore, ForkRequest, ForkResult, NewConversation,
    VerifyReport, spawn_compaction_task,
};
pub use tree::{CascadePlan, TreeState};
pub use types::{
    Bookmark, Branch, BranchDeletion, BranchDraft, ConversationExport, Message, SplitOutcome,
};
