//! Content types carried by branches.
//!
//! A branch always has a plain `content` string. Providers that return
//! structured output (extended thinking, images) additionally populate
//! [`ContentBlock`]s; attachments uploaded by users travel as [`Attachment`]s.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ids::{BranchId, MessageId};

/// Author role of a branch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Human participant.
    User,
    /// Model output.
    Assistant,
    /// System prompt or synthetic system note.
    System,
}

impl Role {
    /// Wire string for this role.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// How a branch came into existence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreationSource {
    /// Typed by a user.
    Human,
    /// A user edit of an earlier branch.
    HumanEdit,
    /// A regenerated model response.
    Regeneration,
    /// A model response produced by normal inference.
    Inference,
    /// Brought in by a conversation import.
    Import,
    /// Copied by a fork or duplicate.
    Fork,
    /// Second half of a split message.
    Split,
    /// Synthetic branch recording a post-hoc operation.
    PostHoc,
}

/// Lifecycle of streamed content on a branch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationState {
    /// Content is final.
    #[default]
    Complete,
    /// Deltas are still being appended.
    Streaming,
    /// Generation was stopped; partial content is kept as-is.
    Aborted,
}

/// Structured content block (thinking, images, redacted reasoning).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// The text.
        text: String,
    },
    /// Extended thinking output.
    Thinking {
        /// The thinking text.
        thinking: String,
        /// Provider verification signature.
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    /// Reasoning withheld by the provider.
    RedactedThinking {
        /// Opaque provider payload.
        data: String,
    },
    /// Inline image.
    Image {
        /// Base64-encoded image data.
        data: String,
        /// MIME type (e.g. `image/png`).
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
}

/// A file attached to a branch.
///
/// Exactly one of `data` (inline base64) or `blob_id` (externalized into the
/// blob store) is expected to be set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Attachment ID, stable across blob externalization.
    pub id: String,
    /// Original file name.
    pub file_name: String,
    /// MIME type.
    pub mime_type: String,
    /// Size of the decoded content in bytes.
    pub size: u64,
    /// Inline base64 content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Blob store reference once externalized.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob_id: Option<String>,
}

impl Attachment {
    /// Whether the content lives in the blob store.
    pub fn is_externalized(&self) -> bool {
        self.data.is_none() && self.blob_id.is_some()
    }
}

/// Kind of retroactive action applied to an earlier branch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostHocAction {
    /// Hide the target from the model's context.
    Hide,
    /// Reverse an earlier hide.
    Unhide,
    /// Replace the target's content in the model's context.
    Edit,
}

/// Payload of a synthetic system branch recording a post-hoc operation.
///
/// The target branch itself is never mutated; context builders apply these
/// when linearizing history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostHocOperation {
    /// What to do to the target.
    pub action: PostHocAction,
    /// Message holding the target branch.
    pub target_message_id: MessageId,
    /// Branch the operation applies to.
    pub target_branch_id: BranchId,
    /// Replacement text for [`PostHocAction::Edit`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replacement_content: Option<String>,
}
