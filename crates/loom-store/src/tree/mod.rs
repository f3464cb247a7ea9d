//! The message tree: materialized state, mutation planning, cascade
//! deletion, format rules and history extraction.
//!
//! Nothing in this module touches storage. The store layer persists the
//! events planned here and folds them back in with [`TreeState::apply`].

pub mod cascade;
pub mod format;
pub mod history;
mod mutations;
pub mod state;

pub use cascade::{CascadePlan, ChildIndex, PrunedBranch, plan_cascade};
pub use format::{FormatRules, PrefillFormat, StandardFormat, rules_for};
pub use history::{ai_visible, build_history};
pub use state::TreeState;
