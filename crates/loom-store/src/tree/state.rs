//! In-memory materialization of one conversation's message tree.
//!
//! [`TreeState`] is an arena keyed by ID: messages by [`MessageId`] and a
//! reverse index from every [`BranchId`] to its owning message. Parent
//! pointers stay as IDs, never references.
//!
//! The only way to change a `TreeState` is [`TreeState::apply`], which folds
//! one [`TreeEvent`]. Folding is strict: an event that references a missing
//! message or branch, or would duplicate an ID, is rejected with
//! [`TreeError::Corrupt`].

use std::collections::{BTreeMap, HashMap};

use loom_core::{BranchId, ConversationFormat, ConversationId, MessageId, ParentRef};

use crate::errors::TreeError;
use crate::events::TreeEvent;
use crate::tree::cascade::CascadePlan;
use crate::tree::history;
use crate::types::{
    Bookmark, Branch, Message, ObservableBranch, ObservableMessage, ObservableState,
};

/// Materialized message tree of one conversation.
#[derive(Clone, Debug)]
pub struct TreeState {
    conversation_id: ConversationId,
    format: ConversationFormat,
    messages: HashMap<MessageId, Message>,
    branch_owner: HashMap<BranchId, MessageId>,
    bookmarks: BTreeMap<(MessageId, BranchId), Bookmark>,
    events_applied: u64,
}

impl TreeState {
    /// Empty tree.
    pub fn new(conversation_id: ConversationId, format: ConversationFormat) -> Self {
        Self {
            conversation_id,
            format,
            messages: HashMap::new(),
            branch_owner: HashMap::new(),
            bookmarks: BTreeMap::new(),
            events_applied: 0,
        }
    }

    /// Fold `events` into an empty tree.
    ///
    /// On failure returns the index of the first event that could not be
    /// applied together with the reason.
    pub fn from_events<'a>(
        conversation_id: ConversationId,
        format: ConversationFormat,
        events: impl IntoIterator<Item = &'a TreeEvent>,
    ) -> Result<Self, (usize, TreeError)> {
        let mut state = Self::new(conversation_id, format);
        for (index, event) in events.into_iter().enumerate() {
            state.apply(event).map_err(|e| (index, e))?;
        }
        Ok(state)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────

    /// Conversation this tree belongs to.
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Conversation format.
    pub fn format(&self) -> ConversationFormat {
        self.format
    }

    /// Number of events folded into this state.
    pub fn events_applied(&self) -> u64 {
        self.events_applied
    }

    /// Number of messages.
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Number of branches across all messages.
    pub fn branch_count(&self) -> usize {
        self.branch_owner.len()
    }

    /// Whether the tree has no messages.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Look up a message.
    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        self.messages.get(id)
    }

    /// Look up a branch and its owning message.
    pub fn branch(&self, id: &BranchId) -> Option<(&Message, &Branch)> {
        let message = self.messages.get(self.branch_owner.get(id)?)?;
        Some((message, message.branch(id)?))
    }

    /// Message owning `branch`.
    pub fn owner_of(&self, branch: &BranchId) -> Option<&MessageId> {
        self.branch_owner.get(branch)
    }

    /// Messages sorted by display order (ties broken by ID).
    pub fn ordered(&self) -> Vec<&Message> {
        let mut list: Vec<&Message> = self.messages.values().collect();
        list.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
        list
    }

    /// Owned copy of every message in display order.
    pub fn messages(&self) -> Vec<Message> {
        self.ordered().into_iter().cloned().collect()
    }

    /// Last message in display order.
    pub fn last_message(&self) -> Option<&Message> {
        self.messages
            .values()
            .max_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)))
    }

    /// Order for a message appended after every existing one.
    pub fn next_order(&self) -> i64 {
        self.messages.values().map(|m| m.order).max().map_or(0, |max| max + 1)
    }

    /// All bookmarks sorted by (message, branch).
    pub fn bookmarks(&self) -> Vec<&Bookmark> {
        self.bookmarks.values().collect()
    }

    /// Bookmark on a specific branch.
    pub fn bookmark(&self, message_id: &MessageId, branch_id: &BranchId) -> Option<&Bookmark> {
        self.bookmarks.get(&(message_id.clone(), branch_id.clone()))
    }

    /// Path from the root to `from_branch`, each message presented with its
    /// on-path branch active. Empty if the branch is unknown.
    pub fn history(&self, from_branch: &BranchId) -> Vec<Message> {
        history::walk(|b| self.branch_owner.get(b).and_then(|m| self.messages.get(m)), from_branch)
    }

    /// Whether following parent pointers upward from `from` visits a branch
    /// of `message_id`.
    pub fn is_ancestor_message(&self, message_id: &MessageId, from: &BranchId) -> bool {
        let mut current = Some(from.clone());
        let mut steps = 0usize;
        while let Some(branch_id) = current {
            let Some((message, branch)) = self.branch(&branch_id) else {
                return false;
            };
            if &message.id == message_id {
                return true;
            }
            steps += 1;
            if steps > self.branch_owner.len() {
                return true;
            }
            current = branch.parent_branch_id.branch().cloned();
        }
        false
    }

    /// Comparable snapshot of everything a reader can observe.
    pub fn observable(&self) -> ObservableState {
        let mut messages: Vec<ObservableMessage> = self
            .messages
            .values()
            .map(|m| ObservableMessage {
                id: m.id.clone(),
                order: m.order,
                active_branch_id: m.active_branch_id.clone(),
                branches: m
                    .branches
                    .iter()
                    .map(|b| ObservableBranch {
                        id: b.id.clone(),
                        parent: b.parent_branch_id.clone(),
                        role: b.role,
                        content: b.content.clone(),
                        generation: b.generation,
                        private_to_user_id: b.private_to_user_id.clone(),
                        hidden_from_ai: b.hidden_from_ai,
                    })
                    .collect(),
            })
            .collect();
        messages.sort_by(|a, b| a.id.cmp(&b.id));

        let bookmarks = self
            .bookmarks
            .values()
            .map(|b| (b.message_id.clone(), b.branch_id.clone(), b.label.clone()))
            .collect();

        ObservableState { messages, bookmarks }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Fold
    // ─────────────────────────────────────────────────────────────────────

    /// Apply one event.
    pub fn apply(&mut self, event: &TreeEvent) -> Result<(), TreeError> {
        match event {
            TreeEvent::MessageCreated { message } | TreeEvent::MessageRestored { message } => {
                self.insert_message(message.clone())?;
            }
            TreeEvent::MessageDeleted { message_id, cascade } => {
                if !self.messages.contains_key(message_id) {
                    return Err(corrupt(format!("delete of unknown message {message_id}")));
                }
                self.apply_cascade(cascade)?;
            }
            TreeEvent::BranchDeleted {
                message_id,
                branch_id,
                cascade,
            } => {
                self.require_branch_of(message_id, branch_id)?;
                self.apply_cascade(cascade)?;
            }
            TreeEvent::MessageSplit {
                message_id,
                branch_id,
                head,
                created,
                reparented,
            } => {
                self.require_branch_of(message_id, branch_id)?;
                for (owner, child) in reparented {
                    self.require_branch_of(owner, child)?;
                }
                let new_branch = created.active_branch_id.clone();
                self.insert_message(created.clone())?;
                if let Some(branch) = self.branch_mut(message_id, branch_id) {
                    branch.content.clone_from(head);
                }
                for (owner, child) in reparented {
                    if let Some(branch) = self.branch_mut(owner, child) {
                        branch.parent_branch_id = ParentRef::Branch(new_branch.clone());
                    }
                }
            }
            TreeEvent::MessageReordered { message_id, order } => {
                let message = self.message_mut(message_id)?;
                message.order = *order;
            }
            TreeEvent::BranchAdded {
                message_id,
                branch,
                activate,
            } => {
                self.ensure_branch_free(&branch.id)?;
                let message = self.message_mut(message_id)?;
                message.branches.push(branch.clone());
                if *activate {
                    message.active_branch_id = branch.id.clone();
                }
                let _ = self.branch_owner.insert(branch.id.clone(), message_id.clone());
            }
            TreeEvent::BranchActivated {
                message_id,
                branch_id,
            } => {
                self.require_branch_of(message_id, branch_id)?;
                let message = self.message_mut(message_id)?;
                message.active_branch_id = branch_id.clone();
            }
            TreeEvent::BranchRestored { message_id, branch } => {
                self.ensure_branch_free(&branch.id)?;
                let message = self.message_mut(message_id)?;
                let position = message
                    .branches
                    .iter()
                    .position(|b| b.created_at > branch.created_at)
                    .unwrap_or(message.branches.len());
                message.branches.insert(position, branch.clone());
                let _ = self.branch_owner.insert(branch.id.clone(), message_id.clone());
            }
            TreeEvent::BranchContentAppended {
                message_id,
                branch_id,
                delta,
            } => {
                self.require_branch_of(message_id, branch_id)?;
                if let Some(branch) = self.branch_mut(message_id, branch_id) {
                    branch.content.push_str(delta);
                }
            }
            TreeEvent::BranchGenerationEnded {
                message_id,
                branch_id,
                state,
                content_blocks,
            } => {
                self.require_branch_of(message_id, branch_id)?;
                if let Some(branch) = self.branch_mut(message_id, branch_id) {
                    branch.generation = *state;
                    if let Some(blocks) = content_blocks {
                        branch.content_blocks.clone_from(blocks);
                    }
                }
            }
            TreeEvent::BookmarkSet { bookmark } => {
                self.require_branch_of(&bookmark.message_id, &bookmark.branch_id)?;
                let _ = self.bookmarks.insert(
                    (bookmark.message_id.clone(), bookmark.branch_id.clone()),
                    bookmark.clone(),
                );
            }
            TreeEvent::BookmarkRemoved {
                message_id,
                branch_id,
            } => {
                let _ = self.bookmarks.remove(&(message_id.clone(), branch_id.clone()));
            }
        }
        self.events_applied += 1;
        Ok(())
    }

    fn insert_message(&mut self, message: Message) -> Result<(), TreeError> {
        if self.messages.contains_key(&message.id) {
            return Err(corrupt(format!("message {} already exists", message.id)));
        }
        if message.branches.is_empty() {
            return Err(corrupt(format!("message {} has no branches", message.id)));
        }
        if !message.has_branch(&message.active_branch_id) {
            return Err(corrupt(format!(
                "message {} has dangling active branch {}",
                message.id, message.active_branch_id
            )));
        }
        for branch in &message.branches {
            self.ensure_branch_free(&branch.id)?;
        }
        for branch in &message.branches {
            let _ = self.branch_owner.insert(branch.id.clone(), message.id.clone());
        }
        let _ = self.messages.insert(message.id.clone(), message);
        Ok(())
    }

    fn apply_cascade(&mut self, cascade: &CascadePlan) -> Result<(), TreeError> {
        for message_id in &cascade.deleted_messages {
            if !self.messages.contains_key(message_id) {
                return Err(corrupt(format!("cascade deletes unknown message {message_id}")));
            }
        }
        for pruned in &cascade.pruned_branches {
            self.require_branch_of(&pruned.message_id, &pruned.branch_id)?;
        }

        for message_id in &cascade.deleted_messages {
            if let Some(message) = self.messages.remove(message_id) {
                for branch in &message.branches {
                    let _ = self.branch_owner.remove(&branch.id);
                }
                self.bookmarks.retain(|(m, _), _| m != message_id);
            }
        }

        for pruned in &cascade.pruned_branches {
            let message = self.message_mut(&pruned.message_id)?;
            message.branches.retain(|b| b.id != pruned.branch_id);
            if let Some(next) = &pruned.next_active {
                message.active_branch_id = next.clone();
            } else if message.active_branch_id == pruned.branch_id {
                // Active pointer moved since the plan was made; fall back to
                // the oldest survivor.
                if let Some(first) = message.branches.first() {
                    message.active_branch_id = first.id.clone();
                }
            }
            if message.branches.is_empty() {
                return Err(corrupt(format!(
                    "pruning {} left message {} without branches",
                    pruned.branch_id, pruned.message_id
                )));
            }
            if !message.has_branch(&message.active_branch_id) {
                return Err(corrupt(format!(
                    "message {} has dangling active branch after prune",
                    pruned.message_id
                )));
            }
            let _ = self.branch_owner.remove(&pruned.branch_id);
            let _ = self
                .bookmarks
                .remove(&(pruned.message_id.clone(), pruned.branch_id.clone()));
        }
        Ok(())
    }

    fn message_mut(&mut self, id: &MessageId) -> Result<&mut Message, TreeError> {
        self.messages
            .get_mut(id)
            .ok_or_else(|| corrupt(format!("unknown message {id}")))
    }

    fn branch_mut(&mut self, message_id: &MessageId, branch_id: &BranchId) -> Option<&mut Branch> {
        self.messages.get_mut(message_id)?.branch_mut(branch_id)
    }

    fn require_branch_of(&self, message_id: &MessageId, branch_id: &BranchId) -> Result<(), TreeError> {
        match self.branch_owner.get(branch_id) {
            Some(owner) if owner == message_id => Ok(()),
            Some(owner) => Err(corrupt(format!(
                "branch {branch_id} belongs to {owner}, not {message_id}"
            ))),
            None => Err(corrupt(format!("unknown branch {branch_id}"))),
        }
    }

    fn ensure_branch_free(&self, branch_id: &BranchId) -> Result<(), TreeError> {
        if self.branch_owner.contains_key(branch_id) {
            return Err(corrupt(format!("branch {branch_id} already exists")));
        }
        Ok(())
    }
}

fn corrupt(reason: String) -> TreeError {
    TreeError::Corrupt(reason)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::cascade::PrunedBranch;
    use crate::types::BranchDraft;
    use assert_matches::assert_matches;
    use loom_core::{CreationSource, Role};

    fn created(id: &str, order: i64, branch: &str, parent: Option<&str>) -> TreeEvent {
        let mut b = BranchDraft::new(Role::User, format!("{id} text")).into_branch(
            parent.map_or(ParentRef::Root, |p| ParentRef::Branch(BranchId::from(p))),
            CreationSource::Human,
        );
        b.id = BranchId::from(branch);
        TreeEvent::MessageCreated {
            message: Message {
                id: MessageId::from(id),
                conversation_id: ConversationId::from("conv_t"),
                order,
                active_branch_id: b.id.clone(),
                branches: vec![b],
                prefix_history: None,
            },
        }
    }

    fn state_with(events: &[TreeEvent]) -> TreeState {
        TreeState::from_events(ConversationId::from("conv_t"), ConversationFormat::Standard, events)
            .unwrap()
    }

    #[test]
    fn fold_builds_indexes() {
        let state = state_with(&[created("A", 0, "a1", None), created("B", 1, "b1", Some("a1"))]);
        assert_eq!(state.message_count(), 2);
        assert_eq!(state.branch_count(), 2);
        assert_eq!(state.owner_of(&BranchId::from("b1")), Some(&MessageId::from("B")));
        assert_eq!(state.next_order(), 2);
        assert_eq!(state.last_message().unwrap().id, MessageId::from("B"));
        assert_eq!(state.events_applied(), 2);
    }

    #[test]
    fn duplicate_message_is_corrupt() {
        let result = TreeState::from_events(
            ConversationId::from("conv_t"),
            ConversationFormat::Standard,
            &[created("A", 0, "a1", None), created("A", 1, "a2", None)],
        );
        assert_matches!(result, Err((1, TreeError::Corrupt(_))));
    }

    #[test]
    fn activation_of_foreign_branch_is_corrupt() {
        let mut state = state_with(&[created("A", 0, "a1", None), created("B", 1, "b1", Some("a1"))]);
        let err = state
            .apply(&TreeEvent::BranchActivated {
                message_id: MessageId::from("A"),
                branch_id: BranchId::from("b1"),
            })
            .unwrap_err();
        assert_matches!(err, TreeError::Corrupt(_));
        assert_eq!(state.events_applied(), 2);
    }

    #[test]
    fn cascade_removes_bookmarks() {
        let mut state = state_with(&[created("A", 0, "a1", None), created("B", 1, "b1", Some("a1"))]);
        state
            .apply(&TreeEvent::BookmarkSet {
                bookmark: Bookmark {
                    message_id: MessageId::from("B"),
                    branch_id: BranchId::from("b1"),
                    label: "here".into(),
                    created_at: chrono::Utc::now(),
                },
            })
            .unwrap();
        assert_eq!(state.bookmarks().len(), 1);

        state
            .apply(&TreeEvent::MessageDeleted {
                message_id: MessageId::from("A"),
                cascade: CascadePlan {
                    deleted_messages: vec![MessageId::from("A"), MessageId::from("B")],
                    pruned_branches: vec![],
                },
            })
            .unwrap();
        assert!(state.is_empty());
        assert!(state.bookmarks().is_empty());
        assert_eq!(state.branch_count(), 0);
    }

    #[test]
    fn prune_falls_back_to_oldest_survivor() {
        let mut state = state_with(&[created("A", 0, "a1", None)]);
        let mut extra = BranchDraft::new(Role::User, "alt").into_branch(ParentRef::Root, CreationSource::HumanEdit);
        extra.id = BranchId::from("a2");
        state
            .apply(&TreeEvent::BranchAdded {
                message_id: MessageId::from("A"),
                branch: extra,
                activate: true,
            })
            .unwrap();

        state
            .apply(&TreeEvent::BranchDeleted {
                message_id: MessageId::from("A"),
                branch_id: BranchId::from("a2"),
                cascade: CascadePlan {
                    deleted_messages: vec![],
                    pruned_branches: vec![PrunedBranch {
                        message_id: MessageId::from("A"),
                        branch_id: BranchId::from("a2"),
                        next_active: None,
                    }],
                },
            })
            .unwrap();
        let message = state.message(&MessageId::from("A")).unwrap();
        assert_eq!(message.active_branch_id, BranchId::from("a1"));
    }

    #[test]
    fn ancestor_walk_detects_membership() {
        let state = state_with(&[
            created("A", 0, "a1", None),
            created("B", 1, "b1", Some("a1")),
            created("C", 2, "c1", Some("b1")),
        ]);
        assert!(state.is_ancestor_message(&MessageId::from("A"), &BranchId::from("c1")));
        assert!(!state.is_ancestor_message(&MessageId::from("C"), &BranchId::from("b1")));
    }

    #[test]
    fn observable_ignores_application_order() {
        let a = state_with(&[created("A", 0, "a1", None), created("B", 1, "b1", None)]);
        let b = state_with(&[created("B", 1, "b1", None), created("A", 0, "a1", None)]);
        assert_eq!(a.observable(), b.observable());
    }
}
