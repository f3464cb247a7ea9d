//! Tree mutations and queries on [`ConversationStore`].
//!
//! Everything here acts on the tree as the acting user sees it. Branches
//! private to someone else cannot be targeted, used as parents or restored,
//! and are treated as missing. Returned messages are filtered through
//! [`crate::access::visible_message`]; cascade reports list only what the
//! user could see before the deletion.

use loom_core::{BranchId, ContentBlock, ConversationId, MessageId, ParentRef, Role, UserId};
use tracing::instrument;

use super::ConversationStore;
use crate::access::{Capability, visible_bookmarks, visible_message, visible_messages};
use crate::errors::{Result, StoreError, TreeError};
use crate::events::TreeEvent;
use crate::tree::{CascadePlan, TreeState, ai_visible, rules_for};
use crate::types::{Bookmark, Branch, BranchDeletion, BranchDraft, Message, SplitOutcome};

fn created_message_id(event: &TreeEvent) -> Option<MessageId> {
    match event {
        TreeEvent::MessageCreated { message } | TreeEvent::MessageRestored { message } => {
            Some(message.id.clone())
        }
        _ => None,
    }
}

fn sees_branch(state: &TreeState, message_id: &MessageId, branch_id: &BranchId, user: &UserId) -> bool {
    state
        .message(message_id)
        .and_then(|m| m.branch(branch_id))
        .is_some_and(|b| b.visible_to(user))
}

fn sees_message(state: &TreeState, message_id: &MessageId, user: &UserId) -> bool {
    state
        .message(message_id)
        .is_some_and(|m| m.branches.iter().any(|b| b.visible_to(user)))
}

/// Reject drafts private to someone else or parented on a branch `user`
/// cannot see. An unset parent becomes `default_parent`.
fn prepare_draft(
    state: &TreeState,
    draft: &mut BranchDraft,
    user: &UserId,
    default_parent: impl FnOnce() -> ParentRef,
) -> Result<()> {
    if draft.private_to_user_id.as_ref().is_some_and(|owner| owner != user) {
        return Err(StoreError::AccessDenied);
    }
    match &draft.parent {
        Some(ParentRef::Branch(parent)) => {
            if !state.branch(parent).is_some_and(|(_, b)| b.visible_to(user)) {
                return Err(TreeError::UnknownParent { parent: parent.clone() }.into());
            }
        }
        Some(ParentRef::Root) => {}
        None => draft.parent = Some(default_parent()),
    }
    Ok(())
}

/// Last message as `user` sees it.
fn last_visible(state: &TreeState, user: &UserId) -> Option<Message> {
    state
        .ordered()
        .into_iter()
        .rev()
        .find_map(|m| visible_message(m, user))
}

/// `cascade` restricted to what `user` sees in `state`, the pre-deletion tree.
fn visible_cascade(state: &TreeState, cascade: CascadePlan, user: &UserId) -> CascadePlan {
    CascadePlan {
        deleted_messages: cascade
            .deleted_messages
            .into_iter()
            .filter(|id| sees_message(state, id, user))
            .collect(),
        pruned_branches: cascade
            .pruned_branches
            .into_iter()
            .filter(|p| sees_branch(state, &p.message_id, &p.branch_id, user))
            .collect(),
    }
}

impl ConversationStore {
    // ─────────────────────────────────────────────────────────────────────
    // Messages and branches
    // ─────────────────────────────────────────────────────────────────────

    /// Append a new message with one branch.
    ///
    /// Without an explicit parent the branch answers the active branch of
    /// the last message `user` can see.
    #[instrument(skip_all, fields(conversation_id = %conversation_id, role = %draft.role))]
    pub fn create_message(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
        mut draft: BranchDraft,
    ) -> Result<Message> {
        let created = self.write_tree(
            conversation_id,
            user,
            Capability::Write,
            |state| {
                prepare_draft(state, &mut draft, user, || {
                    last_visible(state, user).map_or(ParentRef::Root, |m| ParentRef::Branch(m.active_branch_id))
                })?;
                let event = state.plan_create_message(draft)?;
                let id = created_message_id(&event);
                Ok(Some((vec![event], id)))
            },
            |state, id| id.and_then(|id| state.message(&id)).and_then(|m| visible_message(m, user)),
        )?;
        created
            .flatten()
            .ok_or_else(|| StoreError::Internal("created message missing after apply".into()))
    }

    /// Add an alternative branch to a message.
    ///
    /// `None` if the message does not exist or `user` sees none of its
    /// branches. Without an explicit parent the new branch shares the parent
    /// of the active branch as `user` sees it.
    #[instrument(skip_all, fields(conversation_id = %conversation_id, message_id = %message_id))]
    pub fn add_branch(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
        message_id: &MessageId,
        mut draft: BranchDraft,
        preserve_active: bool,
    ) -> Result<Option<Message>> {
        let updated = self.write_tree(
            conversation_id,
            user,
            Capability::Write,
            |state| {
                let Some(shown) = state.message(message_id).and_then(|m| visible_message(m, user)) else {
                    return Ok(None);
                };
                prepare_draft(state, &mut draft, user, || {
                    shown
                        .active_branch()
                        .map_or(ParentRef::Root, |b| b.parent_branch_id.clone())
                })?;
                Ok(state
                    .plan_add_branch(message_id, draft, preserve_active)?
                    .map(|event| (vec![event], ())))
            },
            |state, ()| state.message(message_id).and_then(|m| visible_message(m, user)),
        )?;
        Ok(updated.flatten())
    }

    /// Switch which branch of a message is shown.
    ///
    /// `false` if the message does not own the branch or `user` cannot see it.
    pub fn set_active_branch(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
        message_id: &MessageId,
        branch_id: &BranchId,
    ) -> Result<bool> {
        let switched = self.write_tree(
            conversation_id,
            user,
            Capability::Write,
            |state| {
                if !sees_branch(state, message_id, branch_id, user) {
                    return Ok(None);
                }
                Ok(state
                    .plan_set_active(message_id, branch_id)
                    .map(|event| (vec![event], ())))
            },
            |_, ()| (),
        )?;
        Ok(switched.is_some())
    }

    /// Delete a message and everything whose ancestry ran only through it.
    ///
    /// Returns what was removed as `user` saw it, or `None` if the message
    /// does not exist or is invisible to `user`.
    #[instrument(skip_all, fields(conversation_id = %conversation_id, message_id = %message_id))]
    pub fn delete_message(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
        message_id: &MessageId,
    ) -> Result<Option<CascadePlan>> {
        self.write_tree(
            conversation_id,
            user,
            Capability::Edit,
            |state| {
                if !sees_message(state, message_id, user) {
                    return Ok(None);
                }
                Ok(state.plan_delete_message(message_id).map(|event| {
                    let cascade = match &event {
                        TreeEvent::MessageDeleted { cascade, .. } => visible_cascade(state, cascade.clone(), user),
                        _ => CascadePlan::default(),
                    };
                    (vec![event], cascade)
                }))
            },
            |_, cascade| cascade,
        )
    }

    /// Delete one branch with everything that depends on it.
    ///
    /// `None` if the message does not own the branch or `user` cannot see it.
    #[instrument(skip_all, fields(conversation_id = %conversation_id, branch_id = %branch_id))]
    pub fn delete_branch(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
        message_id: &MessageId,
        branch_id: &BranchId,
    ) -> Result<Option<BranchDeletion>> {
        self.write_tree(
            conversation_id,
            user,
            Capability::Edit,
            |state| {
                let Some(removed) = state
                    .message(message_id)
                    .and_then(|m| m.branch(branch_id))
                    .filter(|b| b.visible_to(user))
                    .cloned()
                else {
                    return Ok(None);
                };
                Ok(state.plan_delete_branch(message_id, branch_id).map(|event| {
                    let cascade = match &event {
                        TreeEvent::BranchDeleted { cascade, .. } => visible_cascade(state, cascade.clone(), user),
                        _ => CascadePlan::default(),
                    };
                    (vec![event], (removed, cascade))
                }))
            },
            |state, (removed_branch, cascade)| BranchDeletion {
                message: state.message(message_id).and_then(|m| visible_message(m, user)),
                deleted_message_ids: cascade.deleted_messages,
                pruned_branches: cascade
                    .pruned_branches
                    .into_iter()
                    .filter(|p| p.branch_id != removed_branch.id)
                    .map(|p| (p.message_id, p.branch_id))
                    .collect(),
                removed_branch,
            },
        )
    }

    /// Split a branch's content at `position` characters into a new message.
    ///
    /// `None` if the target does not exist, `user` cannot see it, or the
    /// position is not strictly inside the content.
    #[instrument(skip_all, fields(conversation_id = %conversation_id, message_id = %message_id, position))]
    pub fn split_message(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
        message_id: &MessageId,
        branch_id: &BranchId,
        position: usize,
    ) -> Result<Option<SplitOutcome>> {
        let outcome = self.write_tree(
            conversation_id,
            user,
            Capability::Edit,
            |state| {
                if !sees_branch(state, message_id, branch_id, user) {
                    return Ok(None);
                }
                Ok(state.plan_split(message_id, branch_id, position).map(|events| {
                    let created = events.first().and_then(|e| match e {
                        TreeEvent::MessageSplit { created, .. } => Some(created.id.clone()),
                        _ => None,
                    });
                    (events, created)
                }))
            },
            |state, created| {
                let original = visible_message(state.message(message_id)?, user)?;
                let created = visible_message(state.message(&created?)?, user)?;
                Some(SplitOutcome { original, created })
            },
        )?;
        Ok(outcome.flatten())
    }

    /// Put back a previously deleted message, re-validating its parents.
    ///
    /// Snapshots carrying branches private to another user are refused.
    #[instrument(skip_all, fields(conversation_id = %conversation_id, message_id = %snapshot.id))]
    pub fn restore_message(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
        snapshot: Message,
    ) -> Result<Message> {
        if snapshot.branches.iter().any(|b| !b.visible_to(user)) {
            return Err(StoreError::AccessDenied);
        }
        let id = snapshot.id.clone();
        let restored = self.write_tree(
            conversation_id,
            user,
            Capability::Edit,
            |state| Ok(Some((vec![state.plan_restore_message(snapshot)?], ()))),
            |state, ()| state.message(&id).and_then(|m| visible_message(m, user)),
        )?;
        restored
            .flatten()
            .ok_or_else(|| StoreError::Internal("restored message missing after apply".into()))
    }

    /// Put back a previously deleted branch.
    ///
    /// `None` if the message does not exist or `user` sees none of its
    /// branches. A branch private to another user is refused.
    pub fn restore_branch(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
        message_id: &MessageId,
        branch: Branch,
    ) -> Result<Option<Message>> {
        if !branch.visible_to(user) {
            return Err(StoreError::AccessDenied);
        }
        let restored = self.write_tree(
            conversation_id,
            user,
            Capability::Edit,
            |state| {
                if !sees_message(state, message_id, user) {
                    return Ok(None);
                }
                Ok(state
                    .plan_restore_branch(message_id, branch)?
                    .map(|event| (vec![event], ())))
            },
            |state, ()| state.message(message_id).and_then(|m| visible_message(m, user)),
        )?;
        Ok(restored.flatten())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Streaming
    // ─────────────────────────────────────────────────────────────────────

    /// Append streamed text to a generating branch.
    ///
    /// `false` if the target does not exist or `user` cannot see it.
    pub fn append_stream_delta(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
        message_id: &MessageId,
        branch_id: &BranchId,
        delta: &str,
    ) -> Result<bool> {
        let appended = self.write_tree(
            conversation_id,
            user,
            Capability::Write,
            |state| {
                if !sees_branch(state, message_id, branch_id, user) {
                    return Ok(None);
                }
                Ok(state
                    .plan_append_delta(message_id, branch_id, delta)?
                    .map(|event| (vec![event], ())))
            },
            |_, ()| (),
        )?;
        Ok(appended.is_some())
    }

    /// Mark a streaming branch complete, optionally attaching structured blocks.
    pub fn finish_generation(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
        message_id: &MessageId,
        branch_id: &BranchId,
        content_blocks: Option<Vec<ContentBlock>>,
    ) -> Result<Option<Message>> {
        self.end_generation(conversation_id, user, message_id, branch_id, false, content_blocks)
    }

    /// Stop a streaming branch, keeping whatever content arrived.
    pub fn abort_generation(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
        message_id: &MessageId,
        branch_id: &BranchId,
    ) -> Result<Option<Message>> {
        self.end_generation(conversation_id, user, message_id, branch_id, true, None)
    }

    fn end_generation(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
        message_id: &MessageId,
        branch_id: &BranchId,
        aborted: bool,
        content_blocks: Option<Vec<ContentBlock>>,
    ) -> Result<Option<Message>> {
        let ended = self.write_tree(
            conversation_id,
            user,
            Capability::Write,
            |state| {
                if !sees_branch(state, message_id, branch_id, user) {
                    return Ok(None);
                }
                Ok(state
                    .plan_end_generation(message_id, branch_id, aborted, content_blocks)?
                    .map(|event| (vec![event], ())))
            },
            |state, ()| state.message(message_id).and_then(|m| visible_message(m, user)),
        )?;
        Ok(ended.flatten())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Bookmarks
    // ─────────────────────────────────────────────────────────────────────

    /// Set or relabel the bookmark on a branch `user` can see.
    pub fn set_bookmark(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
        message_id: &MessageId,
        branch_id: &BranchId,
        label: &str,
    ) -> Result<Option<Bookmark>> {
        let set = self.write_tree(
            conversation_id,
            user,
            Capability::Write,
            |state| {
                if !sees_branch(state, message_id, branch_id, user) {
                    return Ok(None);
                }
                Ok(state
                    .plan_set_bookmark(message_id, branch_id, label)
                    .map(|event| (vec![event], ())))
            },
            |state, ()| state.bookmark(message_id, branch_id).cloned(),
        )?;
        Ok(set.flatten())
    }

    /// Remove the bookmark on a branch. `false` if there was none or `user`
    /// cannot see the branch.
    pub fn remove_bookmark(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
        message_id: &MessageId,
        branch_id: &BranchId,
    ) -> Result<bool> {
        let removed = self.write_tree(
            conversation_id,
            user,
            Capability::Write,
            |state| {
                if !sees_branch(state, message_id, branch_id, user) {
                    return Ok(None);
                }
                Ok(state
                    .plan_remove_bookmark(message_id, branch_id)
                    .map(|event| (vec![event], ())))
            },
            |_, ()| (),
        )?;
        Ok(removed.is_some())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────

    /// Role expected to answer next, judged from the last message `user`
    /// can see. `None` if the conversation does not exist.
    pub fn next_responder(&self, conversation_id: &ConversationId, user: &UserId) -> Result<Option<Role>> {
        self.read_tree(conversation_id, user, |state| {
            let last = last_visible(state, user).and_then(|m| m.active_branch().map(|b| b.role));
            rules_for(state.format()).responder_role(last)
        })
    }

    /// Every message `user` can see, in display order.
    ///
    /// Empty if the conversation does not exist.
    pub fn get_messages(&self, conversation_id: &ConversationId, user: &UserId) -> Result<Vec<Message>> {
        Ok(self
            .read_tree(conversation_id, user, |state| visible_messages(state.ordered(), user))?
            .unwrap_or_default())
    }

    /// One message as `user` sees it.
    pub fn get_message(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
        message_id: &MessageId,
    ) -> Result<Option<Message>> {
        Ok(self
            .read_tree(conversation_id, user, |state| {
                state.message(message_id).and_then(|m| visible_message(m, user))
            })?
            .flatten())
    }

    /// Chronological path from the root to `from_branch`, each message
    /// presented with the branch on the path as active.
    ///
    /// Messages whose path branch `user` cannot see are left out.
    pub fn get_history(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
        from_branch: &BranchId,
    ) -> Result<Vec<Message>> {
        Ok(self
            .read_tree(conversation_id, user, |state| {
                state
                    .history(from_branch)
                    .iter()
                    .filter(|m| m.active_branch().is_some_and(|b| b.visible_to(user)))
                    .filter_map(|m| visible_message(m, user))
                    .collect()
            })?
            .unwrap_or_default())
    }

    /// [`get_history`](Self::get_history) as the model should see it, with
    /// post-hoc operations applied and AI-hidden branches removed.
    pub fn get_ai_history(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
        from_branch: &BranchId,
    ) -> Result<Vec<Message>> {
        Ok(ai_visible(self.get_history(conversation_id, user, from_branch)?))
    }

    /// Bookmarks on branches `user` can see.
    pub fn get_bookmarks(&self, conversation_id: &ConversationId, user: &UserId) -> Result<Vec<Bookmark>> {
        Ok(self
            .read_tree(conversation_id, user, |state| {
                let visible = visible_messages(state.ordered(), user);
                visible_bookmarks(state.bookmarks(), &visible)
            })?
            .unwrap_or_default())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
