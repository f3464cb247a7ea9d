//! Per-format tree rules.
//!
//! Conversation formats differ in which parent a new message attaches to by
//! default, which role answers next, and which drafts are acceptable.

use loom_core::{ConversationFormat, ParentRef, Role};

use crate::errors::TreeError;
use crate::tree::state::TreeState;
use crate::types::BranchDraft;

/// Format-specific behavior consulted while planning mutations.
pub trait FormatRules: Send + Sync {
    /// Format these rules implement.
    fn format(&self) -> ConversationFormat;

    /// Parent used when a new message names none: the active branch of the
    /// last message in display order, or root for an empty tree.
    fn default_parent(&self, state: &TreeState) -> ParentRef {
        state
            .last_message()
            .map_or(ParentRef::Root, |m| ParentRef::Branch(m.active_branch_id.clone()))
    }

    /// Role expected to answer after `last`.
    fn responder_role(&self, last: Option<Role>) -> Role;

    /// Reject drafts this format cannot hold.
    fn validate(&self, draft: &BranchDraft) -> Result<(), TreeError> {
        if draft.post_hoc_operation.is_some() && draft.role != Role::System {
            return Err(TreeError::PostHocRequiresSystemRole);
        }
        Ok(())
    }
}

/// Alternating user/assistant chat.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardFormat;

impl FormatRules for StandardFormat {
    fn format(&self) -> ConversationFormat {
        ConversationFormat::Standard
    }

    fn responder_role(&self, last: Option<Role>) -> Role {
        match last {
            Some(Role::User) => Role::Assistant,
            _ => Role::User,
        }
    }
}

/// Participant transcript the model continues.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrefillFormat;

impl FormatRules for PrefillFormat {
    fn format(&self) -> ConversationFormat {
        ConversationFormat::Prefill
    }

    fn responder_role(&self, _last: Option<Role>) -> Role {
        Role::Assistant
    }

    fn validate(&self, draft: &BranchDraft) -> Result<(), TreeError> {
        if draft.post_hoc_operation.is_some() && draft.role != Role::System {
            return Err(TreeError::PostHocRequiresSystemRole);
        }
        if draft.role == Role::Assistant && draft.participant_id.is_none() {
            return Err(TreeError::MissingParticipant);
        }
        Ok(())
    }
}

/// Rules for `format`.
pub fn rules_for(format: ConversationFormat) -> &'static dyn FormatRules {
    match format {
        ConversationFormat::Standard => &StandardFormat,
        ConversationFormat::Prefill => &PrefillFormat,
    }
}
