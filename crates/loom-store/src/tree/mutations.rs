//! Mutation planning.
//!
//! Each `plan_*` method inspects the current tree, validates the request and
//! returns the events that perform it. Planning never changes the tree;
//! callers persist the events and then fold them with [`TreeState::apply`].
//!
//! `None` means the target message or branch does not exist; `Err` means the
//! request would break a tree invariant.

use chrono::Utc;
use loom_core::{
    BranchId, ContentBlock, CreationSource, GenerationState, MessageId, ParentRef, Role,
};

use crate::errors::TreeError;
use crate::events::TreeEvent;
use crate::tree::cascade::plan_cascade;
use crate::tree::format::rules_for;
use crate::tree::state::TreeState;
use crate::types::{Bookmark, Branch, BranchDraft, Message};

impl TreeState {
    /// Plan a new message after the last one.
    pub fn plan_create_message(&self, draft: BranchDraft) -> Result<TreeEvent, TreeError> {
        let rules = rules_for(self.format());
        rules.validate(&draft)?;
        let parent = match &draft.parent {
            Some(parent) => parent.clone(),
            None => rules.default_parent(self),
        };
        self.check_parent(None, &parent)?;

        let source = match draft.role {
            Role::Assistant => CreationSource::Inference,
            Role::User | Role::System => CreationSource::Human,
        };
        let branch = draft.into_branch(parent, source);
        Ok(TreeEvent::MessageCreated {
            message: Message {
                id: MessageId::new(),
                conversation_id: self.conversation_id().clone(),
                order: self.next_order(),
                active_branch_id: branch.id.clone(),
                branches: vec![branch],
                prefix_history: None,
            },
        })
    }

    /// Plan an alternative branch on an existing message.
    ///
    /// Without an explicit parent the new branch shares the parent of the
    /// currently active branch. The new branch becomes active unless
    /// `preserve_active` is set.
    pub fn plan_add_branch(
        &self,
        message_id: &MessageId,
        draft: BranchDraft,
        preserve_active: bool,
    ) -> Result<Option<TreeEvent>, TreeError> {
        let Some(message) = self.message(message_id) else {
            return Ok(None);
        };
        rules_for(self.format()).validate(&draft)?;
        let parent = match &draft.parent {
            Some(parent) => parent.clone(),
            None => message
                .active_branch()
                .map_or(ParentRef::Root, |b| b.parent_branch_id.clone()),
        };
        self.check_parent(Some(message_id), &parent)?;

        let source = match draft.role {
            Role::Assistant => CreationSource::Regeneration,
            Role::User | Role::System => CreationSource::HumanEdit,
        };
        Ok(Some(TreeEvent::BranchAdded {
            message_id: message_id.clone(),
            branch: draft.into_branch(parent, source),
            activate: !preserve_active,
        }))
    }

    /// Plan switching the active branch. `None` if the branch is not part
    /// of the message.
    pub fn plan_set_active(&self, message_id: &MessageId, branch_id: &BranchId) -> Option<TreeEvent> {
        let message = self.message(message_id)?;
        message.has_branch(branch_id).then(|| TreeEvent::BranchActivated {
            message_id: message_id.clone(),
            branch_id: branch_id.clone(),
        })
    }

    /// Plan deleting a message and everything that depends on it.
    pub fn plan_delete_message(&self, message_id: &MessageId) -> Option<TreeEvent> {
        let message = self.message(message_id)?;
        let seeds: Vec<BranchId> = message.branches.iter().map(|b| b.id.clone()).collect();
        Some(TreeEvent::MessageDeleted {
            message_id: message_id.clone(),
            cascade: plan_cascade(&self.ordered(), &seeds),
        })
    }

    /// Plan deleting one branch and everything that depends on it.
    ///
    /// Deleting the last branch deletes the message. Deleting the active
    /// branch activates the oldest remaining one.
    pub fn plan_delete_branch(&self, message_id: &MessageId, branch_id: &BranchId) -> Option<TreeEvent> {
        let message = self.message(message_id)?;
        if !message.has_branch(branch_id) {
            return None;
        }
        Some(TreeEvent::BranchDeleted {
            message_id: message_id.clone(),
            branch_id: branch_id.clone(),
            cascade: plan_cascade(&self.ordered(), std::slice::from_ref(branch_id)),
        })
    }

    /// Plan splitting a branch's content at `position` characters.
    ///
    /// The tail moves into a new message placed directly after the original;
    /// later messages shift down by one. Branches that answered the split
    /// branch now answer the tail. `None` when the target is missing or the
    /// position does not fall strictly inside the content.
    pub fn plan_split(
        &self,
        message_id: &MessageId,
        branch_id: &BranchId,
        position: usize,
    ) -> Option<Vec<TreeEvent>> {
        let message = self.message(message_id)?;
        let branch = message.branch(branch_id)?;
        if position == 0 || position >= branch.content.chars().count() {
            return None;
        }
        let byte = branch.content.char_indices().nth(position).map(|(i, _)| i)?;
        let (head, tail) = branch.content.split_at(byte);

        let tail_branch = Branch {
            id: BranchId::new(),
            parent_branch_id: ParentRef::Branch(branch_id.clone()),
            role: branch.role,
            content: tail.to_string(),
            content_blocks: Vec::new(),
            attachments: Vec::new(),
            model: branch.model.clone(),
            participant_id: branch.participant_id.clone(),
            hidden_from_ai: branch.hidden_from_ai,
            private_to_user_id: branch.private_to_user_id.clone(),
            creation_source: CreationSource::Split,
            post_hoc_operation: None,
            debug: None,
            debug_blob_id: None,
            generation: GenerationState::Complete,
            created_at: Utc::now(),
        };

        let ordered = self.ordered();
        let reparented: Vec<(MessageId, BranchId)> = ordered
            .iter()
            .flat_map(|m| {
                m.branches
                    .iter()
                    .filter(|b| b.parent_branch_id.branch() == Some(branch_id))
                    .map(|b| (m.id.clone(), b.id.clone()))
            })
            .collect();

        let mut events = vec![TreeEvent::MessageSplit {
            message_id: message_id.clone(),
            branch_id: branch_id.clone(),
            head: head.to_string(),
            created: Message {
                id: MessageId::new(),
                conversation_id: self.conversation_id().clone(),
                order: message.order + 1,
                active_branch_id: tail_branch.id.clone(),
                branches: vec![tail_branch],
                prefix_history: None,
            },
            reparented,
        }];
        events.extend(
            ordered
                .iter()
                .filter(|m| m.order > message.order)
                .map(|m| TreeEvent::MessageReordered {
                    message_id: m.id.clone(),
                    order: m.order + 1,
                }),
        );
        Some(events)
    }

    /// Plan putting back a previously deleted message.
    pub fn plan_restore_message(&self, mut snapshot: Message) -> Result<TreeEvent, TreeError> {
        if self.message(&snapshot.id).is_some() {
            return Err(TreeError::DuplicateMessage(snapshot.id));
        }
        if snapshot.branches.is_empty() {
            return Err(TreeError::EmptyMessage(snapshot.id));
        }
        if !snapshot.has_branch(&snapshot.active_branch_id) {
            return Err(TreeError::InvalidActiveBranch {
                message_id: snapshot.id,
                branch_id: snapshot.active_branch_id,
            });
        }
        for (index, branch) in snapshot.branches.iter().enumerate() {
            if self.owner_of(&branch.id).is_some()
                || snapshot.branches[..index].iter().any(|b| b.id == branch.id)
            {
                return Err(TreeError::DuplicateBranch(branch.id.clone()));
            }
            if let Some(parent) = branch.parent_branch_id.branch() {
                if snapshot.has_branch(parent) {
                    return Err(TreeError::SameMessageParent {
                        message_id: snapshot.id.clone(),
                        parent: parent.clone(),
                    });
                }
                self.check_parent(None, &branch.parent_branch_id)?;
            }
        }
        snapshot.conversation_id = self.conversation_id().clone();
        Ok(TreeEvent::MessageRestored { message: snapshot })
    }

    /// Plan putting back a previously deleted branch.
    pub fn plan_restore_branch(
        &self,
        message_id: &MessageId,
        branch: Branch,
    ) -> Result<Option<TreeEvent>, TreeError> {
        if self.message(message_id).is_none() {
            return Ok(None);
        }
        if self.owner_of(&branch.id).is_some() {
            return Err(TreeError::DuplicateBranch(branch.id));
        }
        self.check_parent(Some(message_id), &branch.parent_branch_id)?;
        Ok(Some(TreeEvent::BranchRestored {
            message_id: message_id.clone(),
            branch,
        }))
    }

    /// Plan appending streamed text to a generating branch.
    pub fn plan_append_delta(
        &self,
        message_id: &MessageId,
        branch_id: &BranchId,
        delta: &str,
    ) -> Result<Option<TreeEvent>, TreeError> {
        let Some(branch) = self.message(message_id).and_then(|m| m.branch(branch_id)) else {
            return Ok(None);
        };
        if branch.generation != GenerationState::Streaming {
            return Err(TreeError::NotStreaming(branch_id.clone()));
        }
        Ok(Some(TreeEvent::BranchContentAppended {
            message_id: message_id.clone(),
            branch_id: branch_id.clone(),
            delta: delta.to_string(),
        }))
    }

    /// Plan ending generation on a streaming branch.
    pub fn plan_end_generation(
        &self,
        message_id: &MessageId,
        branch_id: &BranchId,
        aborted: bool,
        content_blocks: Option<Vec<ContentBlock>>,
    ) -> Result<Option<TreeEvent>, TreeError> {
        let Some(branch) = self.message(message_id).and_then(|m| m.branch(branch_id)) else {
            return Ok(None);
        };
        if branch.generation != GenerationState::Streaming {
            return Err(TreeError::NotStreaming(branch_id.clone()));
        }
        Ok(Some(TreeEvent::BranchGenerationEnded {
            message_id: message_id.clone(),
            branch_id: branch_id.clone(),
            state: if aborted {
                GenerationState::Aborted
            } else {
                GenerationState::Complete
            },
            content_blocks,
        }))
    }

    /// Plan setting or relabelling a bookmark.
    pub fn plan_set_bookmark(
        &self,
        message_id: &MessageId,
        branch_id: &BranchId,
        label: &str,
    ) -> Option<TreeEvent> {
        if !self.message(message_id)?.has_branch(branch_id) {
            return None;
        }
        let created_at = self
            .bookmark(message_id, branch_id)
            .map_or_else(Utc::now, |b| b.created_at);
        Some(TreeEvent::BookmarkSet {
            bookmark: Bookmark {
                message_id: message_id.clone(),
                branch_id: branch_id.clone(),
                label: label.to_string(),
                created_at,
            },
        })
    }

    /// Plan removing a bookmark. `None` if there is none.
    pub fn plan_remove_bookmark(&self, message_id: &MessageId, branch_id: &BranchId) -> Option<TreeEvent> {
        let _ = self.bookmark(message_id, branch_id)?;
        Some(TreeEvent::BookmarkRemoved {
            message_id: message_id.clone(),
            branch_id: branch_id.clone(),
        })
    }

    /// Check that `parent` exists and, for a branch of `message_id`, lies in
    /// another message that does not descend from it.
    fn check_parent(&self, message_id: Option<&MessageId>, parent: &ParentRef) -> Result<(), TreeError> {
        let ParentRef::Branch(parent_id) = parent else {
            return Ok(());
        };
        let Some(owner) = self.owner_of(parent_id) else {
            return Err(TreeError::UnknownParent {
                parent: parent_id.clone(),
            });
        };
        if let Some(message_id) = message_id {
            if owner == message_id {
                return Err(TreeError::SameMessageParent {
                    message_id: message_id.clone(),
                    parent: parent_id.clone(),
                });
            }
            if self.is_ancestor_message(message_id, parent_id) {
                return Err(TreeError::CycleDetected {
                    message_id: message_id.clone(),
                    parent: parent_id.clone(),
                });
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
