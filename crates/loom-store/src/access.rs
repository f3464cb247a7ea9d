//! Who may do what to a conversation, and what each user may see.

use loom_core::{Permission, UserId};

use crate::types::{Bookmark, Message};

/// A user's standing on one conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Access {
    /// Granted through a collaborator record.
    Granted(Permission),
    /// Owns the conversation.
    Owner,
}

/// What an operation needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    /// Queries, forks, duplicates and exports.
    Read,
    /// New messages, branches, active-branch switches, streaming, bookmarks.
    Write,
    /// Deleting, splitting and restoring.
    Edit,
    /// Renaming, archiving, deleting, sharing and maintenance.
    Own,
}

impl Access {
    /// Whether this standing covers `capability`.
    pub fn allows(self, capability: Capability) -> bool {
        match (self, capability) {
            (Self::Owner, _) => true,
            (Self::Granted(_), Capability::Own) => false,
            (Self::Granted(_), Capability::Read) => true,
            (Self::Granted(p), Capability::Write) => p >= Permission::Collaborator,
            (Self::Granted(p), Capability::Edit) => p >= Permission::Editor,
        }
    }
}

/// Whether `access` exists and covers `capability`.
pub fn permits(access: Option<Access>, capability: Capability) -> bool {
    access.is_some_and(|a| a.allows(capability))
}

/// `message` as `viewer` sees it.
///
/// Branches private to other users are removed. If the active branch was
/// removed, the first remaining branch is presented as active. Returns
/// `None` when no branch is visible.
pub fn visible_message(message: &Message, viewer: &UserId) -> Option<Message> {
    if message.branches.iter().all(|b| b.visible_to(viewer)) {
        return Some(message.clone());
    }
    let branches: Vec<_> = message
        .branches
        .iter()
        .filter(|b| b.visible_to(viewer))
        .cloned()
        .collect();
    let first = branches.first()?.id.clone();
    let active_branch_id = if branches.iter().any(|b| b.id == message.active_branch_id) {
        message.active_branch_id.clone()
    } else {
        first
    };
    Some(Message {
        active_branch_id,
        branches,
        ..message.clone()
    })
}

/// Every message `viewer` can see, with invisible branches removed.
pub fn visible_messages<'a>(messages: impl IntoIterator<Item = &'a Message>, viewer: &UserId) -> Vec<Message> {
    messages
        .into_iter()
        .filter_map(|m| visible_message(m, viewer))
        .collect()
}

/// Bookmarks whose branch `viewer` can see.
pub fn visible_bookmarks<'a>(
    bookmarks: impl IntoIterator<Item = &'a Bookmark>,
    messages: &[Message],
) -> Vec<Bookmark> {
    bookmarks
        .into_iter()
        .filter(|b| {
            messages
                .iter()
                .any(|m| m.id == b.message_id && m.has_branch(&b.branch_id))
        })
        .cloned()
        .collect()
}
