//! Domain types shared across the tree, fork and store layers.

pub mod export;
pub mod tree;

pub use export::{ConversationExport, EXPORT_FORMAT_VERSION};
pub use tree::{
    Bookmark, Branch, BranchDeletion, BranchDraft, Message, ObservableBranch, ObservableMessage,
    ObservableState, PrefixEntry, SplitOutcome,
};
