//! Copying conversations: fork, duplicate, export and import.
//!
//! Every copy writes the new conversation row and its whole event log in one
//! transaction. The source conversation is only read.

use chrono::Utc;
use loom_core::{BranchId, ConversationFormat, ConversationId, CreationSource, MessageId, UserId};
use tracing::{info, instrument};

use super::{ConversationStore, count};
use crate::access::Capability;
use crate::errors::{Result, StoreError};
use crate::event_log::EventLog;
use crate::events::TreeEvent;
use crate::fork::{CopyPlan, ForkMode, plan_duplicate, plan_export, plan_fork};
use crate::sqlite::repositories::conversation::{ConversationRepo, CreateConversationOptions};
use crate::sqlite::row_types::ConversationRow;
use crate::tree::TreeState;
use crate::types::{ConversationExport, EXPORT_FORMAT_VERSION};

/// Where and how to fork.
#[derive(Clone, Debug)]
pub struct ForkRequest {
    /// Fork point.
    pub message_id: MessageId,
    /// Branch of the fork point defining the history path; defaults to the active one.
    pub branch_id: Option<BranchId>,
    /// How much history to carry.
    pub mode: ForkMode,
    /// Title for the new conversation; defaults to the source title.
    pub title: Option<String>,
}

impl ForkRequest {
    /// Full-history fork at `message_id`'s active branch.
    pub fn at(message_id: MessageId) -> Self {
        Self {
            message_id,
            branch_id: None,
            mode: ForkMode::Full,
            title: None,
        }
    }
}

/// A freshly written fork.
#[derive(Clone, Debug)]
pub struct ForkResult {
    /// New conversation, owned by the forking user.
    pub conversation: ConversationRow,
    /// History messages carried over (copied or folded into the prefix).
    pub history_messages: usize,
    /// Messages copied from the fork point downward.
    pub subtree_messages: usize,
    /// Source branches left out as private or orphaned.
    pub skipped_branches: usize,
}

/// Row metadata for a copy.
struct CopyTarget<'a> {
    id: ConversationId,
    owner: &'a UserId,
    title: &'a str,
    format: ConversationFormat,
    settings: &'a str,
    parent_conversation_id: Option<&'a str>,
    forked_from_message_id: Option<&'a str>,
}

impl ConversationStore {
    /// Fork the conversation at a message into a new conversation owned by `user`.
    ///
    /// `None` if the conversation, message or branch does not exist.
    #[instrument(skip_all, fields(conversation_id = %conversation_id, message_id = %request.message_id, mode = %request.mode))]
    pub fn fork_conversation(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
        request: &ForkRequest,
    ) -> Result<Option<ForkResult>> {
        let conn = self.conn()?;
        let Some(row) = self.authorize(&conn, conversation_id, user, Capability::Read)? else {
            return Ok(None);
        };
        let target = ConversationId::new();
        let planned = {
            let handle = self.handle(&conn, &row)?;
            let state = handle.read();
            plan_fork(
                &state,
                target.clone(),
                &request.message_id,
                request.branch_id.as_ref(),
                request.mode,
                user,
            )
        };
        let Some(plan) = planned else {
            return Ok(None);
        };

        let (history_messages, subtree_messages, skipped_branches) =
            (plan.history_messages, plan.subtree_messages, plan.skipped_branches);
        let conversation = self.write_copy(
            &CopyTarget {
                id: target,
                owner: user,
                title: request.title.as_deref().unwrap_or(&row.title),
                format: row.conversation_format(),
                settings: &row.settings,
                parent_conversation_id: Some(row.id.as_str()),
                forked_from_message_id: Some(request.message_id.as_str()),
            },
            plan,
        )?;
        info!(
            fork_id = %conversation.id,
            history_messages,
            subtree_messages,
            skipped_branches,
            "conversation forked"
        );
        Ok(Some(ForkResult {
            conversation,
            history_messages,
            subtree_messages,
            skipped_branches,
        }))
    }

    /// Copy the whole conversation, as `user` sees it, under fresh IDs.
    ///
    /// Creation sources are kept. `None` if the conversation does not exist.
    #[instrument(skip_all, fields(conversation_id = %conversation_id))]
    pub fn duplicate_conversation(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
        title: Option<&str>,
    ) -> Result<Option<ConversationRow>> {
        let conn = self.conn()?;
        let Some(row) = self.authorize(&conn, conversation_id, user, Capability::Read)? else {
            return Ok(None);
        };
        let target = ConversationId::new();
        let plan = {
            let handle = self.handle(&conn, &row)?;
            let state = handle.read();
            plan_duplicate(&state, target.clone(), Some(user), None)
        };
        let default_title = format!("{} (copy)", row.title);
        let copy = self.write_copy(
            &CopyTarget {
                id: target,
                owner: user,
                title: title.unwrap_or(&default_title),
                format: row.conversation_format(),
                settings: &row.settings,
                parent_conversation_id: Some(row.id.as_str()),
                forked_from_message_id: None,
            },
            plan,
        )?;
        info!(copy_id = %copy.id, "conversation duplicated");
        Ok(Some(copy))
    }

    /// Portable snapshot of what `user` can see. `None` if the conversation
    /// does not exist.
    pub fn export_conversation(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
    ) -> Result<Option<ConversationExport>> {
        let conn = self.conn()?;
        let Some(row) = self.authorize(&conn, conversation_id, user, Capability::Read)? else {
            return Ok(None);
        };
        let plan = {
            let handle = self.handle(&conn, &row)?;
            let state = handle.read();
            plan_export(&state, user)
        };
        Ok(Some(ConversationExport {
            format_version: EXPORT_FORMAT_VERSION,
            exported_at: Utc::now(),
            title: row.title.clone(),
            format: row.conversation_format(),
            settings: row.settings_value(),
            messages: plan.messages,
            bookmarks: plan.bookmarks,
        }))
    }

    /// Create a conversation owned by `user` from an export document.
    ///
    /// IDs are remapped and every branch is marked as imported. Branches
    /// whose parent is missing from the document are dropped with their
    /// descendants.
    #[instrument(skip_all, fields(owner = %user, messages = export.messages.len()))]
    pub fn import_conversation(&self, user: &UserId, export: &ConversationExport) -> Result<ConversationRow> {
        if export.format_version > EXPORT_FORMAT_VERSION {
            return Err(StoreError::InvalidImport(format!(
                "format version {} is newer than supported {EXPORT_FORMAT_VERSION}",
                export.format_version
            )));
        }

        let staged_events: Vec<TreeEvent> = export
            .messages
            .iter()
            .cloned()
            .map(|message| TreeEvent::MessageCreated { message })
            .chain(export.bookmarks.iter().cloned().map(|bookmark| TreeEvent::BookmarkSet { bookmark }))
            .collect();
        let staged = TreeState::from_events(ConversationId::new(), export.format, &staged_events)
            .map_err(|(index, e)| StoreError::InvalidImport(format!("entry {index}: {e}")))?;

        let target = ConversationId::new();
        let plan = plan_duplicate(&staged, target.clone(), None, Some(CreationSource::Import));
        let skipped = plan.skipped_branches;
        let empty = serde_json::Value::Object(serde_json::Map::new());
        let settings = serde_json::to_string(if export.settings.is_null() { &empty } else { &export.settings })?;
        let row = self.write_copy(
            &CopyTarget {
                id: target,
                owner: user,
                title: &export.title,
                format: export.format,
                settings: &settings,
                parent_conversation_id: None,
                forked_from_message_id: None,
            },
            plan,
        )?;
        info!(conversation_id = %row.id, skipped, "conversation imported");
        Ok(row)
    }

    /// Write a new conversation row and its initial log in one transaction,
    /// then cache the resulting tree.
    fn write_copy(&self, target: &CopyTarget<'_>, plan: CopyPlan) -> Result<ConversationRow> {
        let events = plan.into_events();
        let state = TreeState::from_events(target.id.clone(), target.format, &events)
            .map_err(|(index, e)| StoreError::Internal(format!("copy does not replay at event {index}: {e}")))?;

        let conn = self.conn()?;
        let row = self.retry_on_sqlite_busy(|| {
            let tx = conn.unchecked_transaction()?;
            let _ = ConversationRepo::create(
                &tx,
                &CreateConversationOptions {
                    id: &target.id,
                    owner_user_id: target.owner,
                    title: target.title,
                    format: target.format.as_str(),
                    settings: Some(target.settings),
                    parent_conversation_id: target.parent_conversation_id,
                    forked_from_message_id: target.forked_from_message_id,
                },
            )?;
            let _ = EventLog::append_batch(&tx, &target.id, &events)?;
            let _ = ConversationRepo::set_tree_counters(
                &tx,
                &target.id,
                count(state.message_count()),
                count(state.branch_count()),
            )?;
            let row = ConversationRepo::get_by_id(&tx, &target.id)?
                .ok_or_else(|| StoreError::ConversationNotFound(target.id.to_string()))?;
            tx.commit()?;
            Ok(row)
        })?;
        let _ = self.cache.insert(state);
        Ok(row)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
