//! # loom-core
//!
//! Foundation types shared by every Loom crate:
//!
//! - **IDs**: branded newtypes ([`ConversationId`], [`MessageId`], [`BranchId`], ...)
//!   and the [`ParentRef`] pointer used by the branch tree
//! - **Content**: roles, structured content blocks, attachments, post-hoc operations
//! - **Access**: collaboration permission tiers
//! - **Format**: the [`ConversationFormat`] discriminator
//! - **Logging**: `tracing` subscriber initialisation

#![deny(unsafe_code)]

pub mod access;
pub mod content;
pub mod format;
pub mod ids;
pub mod logging;

pub use access::{Permission, PermissionParseError};
pub use content::{
    Attachment, ContentBlock, CreationSource, GenerationState, PostHocAction, PostHocOperation,
    Role,
};
pub use format::ConversationFormat;
pub use ids::{BranchId, ConversationId, MessageId, ParentRef, UserId, ROOT_PARENT};
