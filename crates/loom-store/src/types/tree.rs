//! Materialized message tree types.
//!
//! A [`Message`] is a slot in display order holding one or more [`Branch`]es
//! (alternative contents). Every branch points at its parent branch in some
//! other message, or at the `root` sentinel.

use chrono::{DateTime, Utc};
use loom_core::{
    Attachment, BranchId, ContentBlock, ConversationId, CreationSource, GenerationState, MessageId,
    ParentRef, PostHocOperation, Role, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One alternative content of a message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    /// Branch ID.
    pub id: BranchId,
    /// Parent branch in another message, or root.
    pub parent_branch_id: ParentRef,
    /// Author role.
    pub role: Role,
    /// Plain text content.
    pub content: String,
    /// Structured content (thinking, images).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content_blocks: Vec<ContentBlock>,
    /// Attached files.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    /// Model that produced the content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Named participant (prefill conversations).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<String>,
    /// Excluded from model context.
    #[serde(default)]
    pub hidden_from_ai: bool,
    /// Only visible to this user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_to_user_id: Option<UserId>,
    /// How the branch came to exist.
    pub creation_source: CreationSource,
    /// Edit instruction applied to earlier messages when building model context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_hoc_operation: Option<PostHocOperation>,
    /// Raw provider request/response captured for debugging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<Value>,
    /// Blob holding `debug` after compaction moved it out of the log.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_blob_id: Option<String>,
    /// Streaming lifecycle.
    #[serde(default)]
    pub generation: GenerationState,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Branch {
    /// Whether `viewer` may see this branch.
    pub fn visible_to(&self, viewer: &UserId) -> bool {
        self.private_to_user_id.as_ref().is_none_or(|owner| owner == viewer)
    }
}

/// Condensed history carried by the first message of a compressed fork.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefixEntry {
    /// Author role.
    pub role: Role,
    /// Content of the path branch.
    pub content: String,
    /// Participant, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<String>,
    /// Model, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// A message slot in display order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Message ID.
    pub id: MessageId,
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Display position; larger is later.
    pub order: i64,
    /// Branch currently presented.
    pub active_branch_id: BranchId,
    /// Branches in creation order.
    pub branches: Vec<Branch>,
    /// History that preceded this message in the source of a compressed fork.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_history: Option<Vec<PrefixEntry>>,
}

impl Message {
    /// Find a branch by ID.
    pub fn branch(&self, id: &BranchId) -> Option<&Branch> {
        self.branches.iter().find(|b| &b.id == id)
    }

    pub(crate) fn branch_mut(&mut self, id: &BranchId) -> Option<&mut Branch> {
        self.branches.iter_mut().find(|b| &b.id == id)
    }

    /// The branch named by `active_branch_id`.
    pub fn active_branch(&self) -> Option<&Branch> {
        self.branch(&self.active_branch_id)
    }

    /// Whether this message owns the branch.
    pub fn has_branch(&self, id: &BranchId) -> bool {
        self.branches.iter().any(|b| &b.id == id)
    }
}

/// A user-visible label on a specific branch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bookmark {
    /// Bookmarked message.
    pub message_id: MessageId,
    /// Bookmarked branch.
    pub branch_id: BranchId,
    /// Label text.
    pub label: String,
    /// When the bookmark was first set.
    pub created_at: DateTime<Utc>,
}

/// Caller-supplied content for a new branch.
///
/// ```ignore
/// let draft = BranchDraft::new(Role::Assistant, "")
///     .with_model("claude-sonnet")
///     .streaming();
/// ```
#[derive(Clone, Debug)]
pub struct BranchDraft {
    /// Author role.
    pub role: Role,
    /// Plain text content.
    pub content: String,
    /// Explicit parent; `None` lets the format pick one.
    pub parent: Option<ParentRef>,
    /// Structured content.
    pub content_blocks: Vec<ContentBlock>,
    /// Attached files.
    pub attachments: Vec<Attachment>,
    /// Producing model.
    pub model: Option<String>,
    /// Named participant.
    pub participant_id: Option<String>,
    /// Excluded from model context.
    pub hidden_from_ai: bool,
    /// Only visible to this user.
    pub private_to_user_id: Option<UserId>,
    /// Overrides the default creation source.
    pub creation_source: Option<CreationSource>,
    /// Post-hoc edit instruction.
    pub post_hoc_operation: Option<PostHocOperation>,
    /// Provider debug payload.
    pub debug: Option<Value>,
    /// Start in the streaming state.
    pub streaming: bool,
}

impl BranchDraft {
    /// Draft with the given role and content and nothing else set.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            parent: None,
            content_blocks: Vec::new(),
            attachments: Vec::new(),
            model: None,
            participant_id: None,
            hidden_from_ai: false,
            private_to_user_id: None,
            creation_source: None,
            post_hoc_operation: None,
            debug: None,
            streaming: false,
        }
    }

    /// Set an explicit parent.
    #[must_use]
    pub fn with_parent(mut self, parent: impl Into<ParentRef>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Set the producing model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the participant.
    #[must_use]
    pub fn with_participant(mut self, participant: impl Into<String>) -> Self {
        self.participant_id = Some(participant.into());
        self
    }

    /// Make the branch private to `user`.
    #[must_use]
    pub fn private_to(mut self, user: UserId) -> Self {
        self.private_to_user_id = Some(user);
        self
    }

    /// Exclude the branch from model context.
    #[must_use]
    pub fn hidden_from_ai(mut self) -> Self {
        self.hidden_from_ai = true;
        self
    }

    /// Override the creation source.
    #[must_use]
    pub fn with_source(mut self, source: CreationSource) -> Self {
        self.creation_source = Some(source);
        self
    }

    /// Attach structured content blocks.
    #[must_use]
    pub fn with_content_blocks(mut self, blocks: Vec<ContentBlock>) -> Self {
        self.content_blocks = blocks;
        self
    }

    /// Add an attachment.
    #[must_use]
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Carry a post-hoc operation.
    #[must_use]
    pub fn with_post_hoc(mut self, op: PostHocOperation) -> Self {
        self.post_hoc_operation = Some(op);
        self
    }

    /// Attach a provider debug payload.
    #[must_use]
    pub fn with_debug(mut self, debug: Value) -> Self {
        self.debug = Some(debug);
        self
    }

    /// Start the branch in the streaming state.
    #[must_use]
    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    /// Build the branch, assigning a fresh ID.
    ///
    /// `default_source` applies when the draft does not override it.
    pub(crate) fn into_branch(self, parent: ParentRef, default_source: CreationSource) -> Branch {
        Branch {
            id: BranchId::new(),
            parent_branch_id: parent,
            role: self.role,
            content: self.content,
            content_blocks: self.content_blocks,
            attachments: self.attachments,
            model: self.model,
            participant_id: self.participant_id,
            hidden_from_ai: self.hidden_from_ai,
            private_to_user_id: self.private_to_user_id,
            creation_source: self.creation_source.unwrap_or(default_source),
            post_hoc_operation: self.post_hoc_operation,
            debug: self.debug,
            debug_blob_id: None,
            generation: if self.streaming {
                GenerationState::Streaming
            } else {
                GenerationState::Complete
            },
            created_at: Utc::now(),
        }
    }
}

/// Result of deleting a branch.
#[derive(Clone, Debug, PartialEq)]
pub struct BranchDeletion {
    /// The removed branch as it was before deletion.
    pub removed_branch: Branch,
    /// Target message after deletion; `None` if it had no branches left.
    pub message: Option<Message>,
    /// Messages removed because none of their branches survived.
    pub deleted_message_ids: Vec<MessageId>,
    /// Branches of surviving messages removed because their parent died.
    pub pruned_branches: Vec<(MessageId, BranchId)>,
}

/// Result of splitting a message.
#[derive(Clone, Debug, PartialEq)]
pub struct SplitOutcome {
    /// Original message, holding the head of the split branch.
    pub original: Message,
    /// New message holding the tail, directly after the original.
    pub created: Message,
}

/// Order-independent view of a tree used to compare two materializations.
///
/// Covers IDs, orders, contents, parents, active pointers, roles,
/// generation state, privacy and bookmarks. Attachment storage location is
/// not part of it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservableState {
    /// Messages sorted by ID.
    pub messages: Vec<ObservableMessage>,
    /// Bookmarks sorted by (message, branch).
    pub bookmarks: Vec<(MessageId, BranchId, String)>,
}

/// One message inside [`ObservableState`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservableMessage {
    /// Message ID.
    pub id: MessageId,
    /// Display position.
    pub order: i64,
    /// Active pointer.
    pub active_branch_id: BranchId,
    /// Branches in creation order.
    pub branches: Vec<ObservableBranch>,
}

/// One branch inside [`ObservableMessage`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservableBranch {
    /// Branch ID.
    pub id: BranchId,
    /// Parent pointer.
    pub parent: ParentRef,
    /// Role.
    pub role: Role,
    /// Text content.
    pub content: String,
    /// Generation state.
    pub generation: GenerationState,
    /// Privacy owner.
    pub private_to_user_id: Option<UserId>,
    /// Hidden from model context.
    pub hidden_from_ai: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branch(private_to: Option<&str>) -> Branch {
        let mut b = BranchDraft::new(Role::User, "hi").into_branch(ParentRef::Root, CreationSource::Human);
        b.private_to_user_id = private_to.map(UserId::from);
        b
    }

    #[test]
    fn public_branch_visible_to_everyone() {
        assert!(branch(None).visible_to(&UserId::from("user_a")));
    }

    #[test]
    fn private_branch_visible_only_to_owner() {
        let b = branch(Some("user_a"));
        assert!(b.visible_to(&UserId::from("user_a")));
        assert!(!b.visible_to(&UserId::from("user_b")));
    }

    #[test]
    fn draft_defaults_creation_source() {
        let b = BranchDraft::new(Role::Assistant, "")
            .streaming()
            .into_branch(ParentRef::Root, CreationSource::Inference);
        assert_eq!(b.creation_source, CreationSource::Inference);
        assert_eq!(b.generation, GenerationState::Streaming);

        let edited = BranchDraft::new(Role::User, "x")
            .with_source(CreationSource::Import)
            .into_branch(ParentRef::Root, CreationSource::Human);
        assert_eq!(edited.creation_source, CreationSource::Import);
    }

    #[test]
    fn branch_serializes_parent_as_string() {
        let b = branch(None);
        let json = serde_json::to_value(&b).unwrap();
        assert_eq!(json["parentBranchId"], "root");
        assert_eq!(json["creationSource"], "human");
        assert!(json.get("debug").is_none());
    }
}
