//! Copying parts of a tree into a new conversation.
//!
//! Forks, duplicates, exports and imports all copy a set of source branches,
//! remapping every parent pointer onto the copy. A branch whose parent was
//! not copied is skipped, and so is everything beneath it, so the copy never
//! contains a dangling pointer. Branches private to someone other than the
//! requesting user are never copied.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use loom_core::{BranchId, ConversationId, CreationSource, MessageId, ParentRef, UserId};
use serde::{Deserialize, Serialize};

use crate::events::TreeEvent;
use crate::tree::TreeState;
use crate::tree::cascade::ChildIndex;
use crate::types::{Bookmark, Branch, Message, PrefixEntry};

/// How much of the history above the fork point is carried over.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForkMode {
    /// Copy the history path as real messages.
    #[default]
    Full,
    /// Fold the history path into `prefix_history` on the first copied message.
    Compressed,
    /// Drop the history; the fork point becomes a root.
    Truncated,
}

impl ForkMode {
    /// Wire string for this mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Compressed => "compressed",
            Self::Truncated => "truncated",
        }
    }
}

impl fmt::Display for ForkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ForkMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "compressed" => Ok(Self::Compressed),
            "truncated" => Ok(Self::Truncated),
            other => Err(format!("unknown fork mode: {other}")),
        }
    }
}

/// Messages and bookmarks to write into the target conversation.
#[derive(Clone, Debug, Default)]
pub struct CopyPlan {
    /// Copied messages in display order.
    pub messages: Vec<Message>,
    /// Bookmarks whose branch was copied.
    pub bookmarks: Vec<Bookmark>,
    /// History messages copied (full) or folded into the prefix (compressed).
    pub history_messages: usize,
    /// Messages copied from the fork point downward.
    pub subtree_messages: usize,
    /// Source branches left out because they were private or orphaned.
    pub skipped_branches: usize,
}

impl CopyPlan {
    /// Events that recreate the plan in an empty conversation.
    pub fn into_events(self) -> Vec<TreeEvent> {
        let mut events: Vec<TreeEvent> = self
            .messages
            .into_iter()
            .map(|message| TreeEvent::MessageCreated { message })
            .collect();
        events.extend(self.bookmarks.into_iter().map(|bookmark| TreeEvent::BookmarkSet { bookmark }));
        events
    }
}

/// Plan a fork at `target_message`.
///
/// `target_branch` selects which branch of the fork point defines the
/// history path; it defaults to the active branch. Returns `None` if the
/// message or branch does not exist.
pub fn plan_fork(
    state: &TreeState,
    target: ConversationId,
    target_message: &MessageId,
    target_branch: Option<&BranchId>,
    mode: ForkMode,
    viewer: &UserId,
) -> Option<CopyPlan> {
    let message = state.message(target_message)?;
    let path_branch = target_branch.unwrap_or(&message.active_branch_id);
    let path_parent = message.branch(path_branch)?.parent_branch_id.clone();

    let history = match &path_parent {
        ParentRef::Root => Vec::new(),
        ParentRef::Branch(parent) => state.history(parent),
    };
    let history_ids: HashSet<&MessageId> = history.iter().map(|m| &m.id).collect();

    let ordered = state.ordered();
    let index = ChildIndex::build(ordered.iter().copied());
    let mut in_subtree: HashSet<MessageId> = HashSet::from([target_message.clone()]);
    let mut frontier = vec![message];
    while let Some(current) = frontier.pop() {
        for branch in &current.branches {
            for child in index.children_of(&branch.id) {
                let Some(owner) = state.owner_of(child) else {
                    continue;
                };
                if history_ids.contains(owner) || !in_subtree.insert(owner.clone()) {
                    continue;
                }
                if let Some(next) = state.message(owner) {
                    frontier.push(next);
                }
            }
        }
    }
    let subtree: Vec<&Message> = ordered
        .iter()
        .copied()
        .filter(|m| in_subtree.contains(&m.id))
        .collect();

    let excluded = private_closure(state, Some(viewer));
    let mut copier = Copier::new(target, Some(CreationSource::Fork), false, &excluded);

    let mut sources: Vec<Source<'_>> = Vec::new();
    if mode == ForkMode::Full {
        for on_path in &history {
            if let Some(original) = state.message(&on_path.id) {
                sources.push(Source {
                    message: original,
                    only: Some(on_path.active_branch_id.clone()),
                });
            }
        }
    }
    sources.extend(subtree.iter().map(|m| Source { message: *m, only: None }));

    let redirect: HashMap<MessageId, BranchId> = if mode == ForkMode::Full {
        history.iter().map(|m| (m.id.clone(), m.active_branch_id.clone())).collect()
    } else {
        HashMap::new()
    };
    let outside = if mode == ForkMode::Full {
        Outside::Skip
    } else {
        Outside::Root
    };
    copier.run(state, &sources, &redirect, outside);

    let prefix: Vec<PrefixEntry> = if mode == ForkMode::Compressed {
        history
            .iter()
            .filter_map(Message::active_branch)
            .filter(|b| !excluded.contains(&b.id))
            .map(|b| PrefixEntry {
                role: b.role,
                content: b.content.clone(),
                participant_id: b.participant_id.clone(),
                model: b.model.clone(),
            })
            .collect()
    } else {
        Vec::new()
    };

    let mut plan = copier.finish(state);
    plan.history_messages = if mode == ForkMode::Full {
        copier.copied_messages(history.iter().map(|m| &m.id))
    } else {
        prefix.len()
    };
    plan.subtree_messages = copier.copied_messages(subtree.iter().map(|m| &m.id));
    if !prefix.is_empty() {
        if let Some(first) = plan.messages.first_mut() {
            first.prefix_history = Some(prefix);
        }
    }
    Some(plan)
}

/// Plan a full copy of the tree under new IDs.
///
/// With a `viewer`, branches private to other users are left out. Original
/// creation sources are kept unless `source` overrides them.
pub fn plan_duplicate(
    state: &TreeState,
    target: ConversationId,
    viewer: Option<&UserId>,
    source: Option<CreationSource>,
) -> CopyPlan {
    let excluded = private_closure(state, viewer);
    let mut copier = Copier::new(target, source, false, &excluded);
    let ordered = state.ordered();
    let sources: Vec<Source<'_>> = ordered.iter().map(|m| Source { message: *m, only: None }).collect();
    copier.run(state, &sources, &HashMap::new(), Outside::Skip);
    let mut plan = copier.finish(state);
    plan.subtree_messages = plan.messages.len();
    plan
}

/// What `viewer` may take out of the tree, keeping original IDs and orders.
pub fn plan_export(state: &TreeState, viewer: &UserId) -> CopyPlan {
    let excluded = private_closure(state, Some(viewer));
    let mut copier = Copier::new(state.conversation_id().clone(), None, true, &excluded);
    let ordered = state.ordered();
    let sources: Vec<Source<'_>> = ordered.iter().map(|m| Source { message: *m, only: None }).collect();
    copier.run(state, &sources, &HashMap::new(), Outside::Skip);
    let mut plan = copier.finish(state);
    plan.subtree_messages = plan.messages.len();
    plan
}

/// Branches private to someone other than `viewer`, plus everything beneath
/// them. With no viewer nothing is excluded.
fn private_closure(state: &TreeState, viewer: Option<&UserId>) -> HashSet<BranchId> {
    let Some(viewer) = viewer else {
        return HashSet::new();
    };
    let ordered = state.ordered();
    let seeds: Vec<BranchId> = ordered
        .iter()
        .flat_map(|m| m.branches.iter())
        .filter(|b| !b.visible_to(viewer))
        .map(|b| b.id.clone())
        .collect();
    if seeds.is_empty() {
        return HashSet::new();
    }
    ChildIndex::build(ordered.iter().copied()).closure(seeds)
}

// ─────────────────────────────────────────────────────────────────────────────
// Copier
// ─────────────────────────────────────────────────────────────────────────────

struct Source<'a> {
    message: &'a Message,
    /// Copy only this branch of the message.
    only: Option<BranchId>,
}

/// Treatment of parents that are neither copied nor redirected.
#[derive(Clone, Copy)]
enum Outside {
    Skip,
    Root,
}

#[derive(Clone)]
enum Slot {
    Copied(BranchId),
    Skipped,
}

enum Resolution {
    Ready(ParentRef),
    Skip,
    Wait,
}

struct Copier<'a> {
    target: ConversationId,
    source: Option<CreationSource>,
    keep_ids: bool,
    excluded: &'a HashSet<BranchId>,
    slots: HashMap<BranchId, Slot>,
    parents: HashMap<BranchId, ParentRef>,
    order: Vec<MessageId>,
    message_ids: HashMap<MessageId, MessageId>,
    skipped: usize,
}

impl<'a> Copier<'a> {
    fn new(
        target: ConversationId,
        source: Option<CreationSource>,
        keep_ids: bool,
        excluded: &'a HashSet<BranchId>,
    ) -> Self {
        Self {
            target,
            source,
            keep_ids,
            excluded,
            slots: HashMap::new(),
            parents: HashMap::new(),
            order: Vec::new(),
            message_ids: HashMap::new(),
            skipped: 0,
        }
    }

    /// Resolve every source branch to a copy or a skip.
    ///
    /// Branches are resolved in passes so a parent appearing later in
    /// display order than its child still gets copied first.
    fn run(
        &mut self,
        state: &TreeState,
        sources: &[Source<'_>],
        redirect: &HashMap<MessageId, BranchId>,
        outside: Outside,
    ) {
        let mut pending: Vec<&Branch> = Vec::new();
        for source in sources {
            self.order.push(source.message.id.clone());
            for branch in &source.message.branches {
                if source.only.as_ref().is_some_and(|only| only != &branch.id) {
                    continue;
                }
                if self.excluded.contains(&branch.id) {
                    self.skip(&branch.id);
                } else {
                    pending.push(branch);
                }
            }
        }
        let mut waiting: HashSet<BranchId> = pending.iter().map(|b| b.id.clone()).collect();

        loop {
            let mut progressed = false;
            pending.retain(|branch| {
                match self.resolve(state, &branch.parent_branch_id, &waiting, redirect, outside) {
                    Resolution::Wait => return true,
                    Resolution::Ready(parent) => {
                        let id = if self.keep_ids {
                            branch.id.clone()
                        } else {
                            BranchId::new()
                        };
                        let _ = self.slots.insert(branch.id.clone(), Slot::Copied(id));
                        let _ = self.parents.insert(branch.id.clone(), parent);
                    }
                    Resolution::Skip => self.skip(&branch.id),
                }
                let _ = waiting.remove(&branch.id);
                progressed = true;
                false
            });
            if pending.is_empty() || !progressed {
                break;
            }
        }
        for branch in pending {
            self.skip(&branch.id);
        }
    }

    fn resolve(
        &self,
        state: &TreeState,
        parent: &ParentRef,
        waiting: &HashSet<BranchId>,
        redirect: &HashMap<MessageId, BranchId>,
        outside: Outside,
    ) -> Resolution {
        let ParentRef::Branch(parent_id) = parent else {
            return Resolution::Ready(ParentRef::Root);
        };
        let target = match (self.slots.get(parent_id), waiting.contains(parent_id)) {
            (Some(slot), _) => Some(slot.clone()),
            (None, true) => return Resolution::Wait,
            (None, false) => None,
        };
        if let Some(slot) = target {
            return match slot {
                Slot::Copied(id) => Resolution::Ready(ParentRef::Branch(id)),
                Slot::Skipped => Resolution::Skip,
            };
        }

        let redirected = state.owner_of(parent_id).and_then(|owner| redirect.get(owner));
        if let Some(path_branch) = redirected {
            return match self.slots.get(path_branch) {
                Some(Slot::Copied(id)) => Resolution::Ready(ParentRef::Branch(id.clone())),
                Some(Slot::Skipped) => Resolution::Skip,
                None if waiting.contains(path_branch) => Resolution::Wait,
                None => Resolution::Skip,
            };
        }

        match outside {
            Outside::Skip => Resolution::Skip,
            Outside::Root => Resolution::Ready(ParentRef::Root),
        }
    }

    fn skip(&mut self, branch: &BranchId) {
        let _ = self.slots.insert(branch.clone(), Slot::Skipped);
        self.skipped += 1;
    }

    fn copied_id(&self, branch: &BranchId) -> Option<&BranchId> {
        match self.slots.get(branch) {
            Some(Slot::Copied(id)) => Some(id),
            _ => None,
        }
    }

    fn copied_messages<'m>(&self, ids: impl Iterator<Item = &'m MessageId>) -> usize {
        ids.filter(|id| self.message_ids.contains_key(*id)).count()
    }

    fn finish(&mut self, state: &TreeState) -> CopyPlan {
        let mut messages: Vec<Message> = Vec::new();
        for source_id in std::mem::take(&mut self.order) {
            let Some(original) = state.message(&source_id) else {
                continue;
            };
            let branches: Vec<Branch> = original
                .branches
                .iter()
                .filter_map(|b| {
                    let id = self.copied_id(&b.id)?.clone();
                    let parent = self.parents.get(&b.id)?.clone();
                    let mut copy = b.clone();
                    copy.id = id;
                    copy.parent_branch_id = parent;
                    if let Some(source) = self.source {
                        copy.creation_source = source;
                    }
                    Some(copy)
                })
                .collect();
            let Some(first) = branches.first() else {
                continue;
            };
            let active = self
                .copied_id(&original.active_branch_id)
                .cloned()
                .unwrap_or_else(|| first.id.clone());
            let id = if self.keep_ids {
                original.id.clone()
            } else {
                MessageId::new()
            };
            let order = if self.keep_ids {
                original.order
            } else {
                i64::try_from(messages.len()).unwrap_or(i64::MAX)
            };
            let _ = self.message_ids.insert(original.id.clone(), id.clone());
            messages.push(Message {
                id,
                conversation_id: self.target.clone(),
                order,
                active_branch_id: active,
                branches,
                prefix_history: original.prefix_history.clone(),
            });
        }

        let bookmarks = state
            .bookmarks()
            .into_iter()
            .filter_map(|b| {
                Some(Bookmark {
                    message_id: self.message_ids.get(&b.message_id)?.clone(),
                    branch_id: self.copied_id(&b.branch_id)?.clone(),
                    label: b.label.clone(),
                    created_at: b.created_at,
                })
            })
            .collect();

        CopyPlan {
            messages,
            bookmarks,
            history_messages: 0,
            subtree_messages: 0,
            skipped_branches: self.skipped,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BranchDraft;
    use loom_core::{ConversationFormat, Role};

    struct Fixture {
        state: TreeState,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                state: TreeState::new(ConversationId::from("conv_src"), ConversationFormat::Standard),
            }
        }

        fn say(&mut self, role: Role, text: &str) -> Message {
            self.create(BranchDraft::new(role, text))
        }

        fn create(&mut self, draft: BranchDraft) -> Message {
            let event = self.state.plan_create_message(draft).unwrap();
            self.state.apply(&event).unwrap();
            let TreeEvent::MessageCreated { message } = event else {
                unreachable!()
            };
            message
        }

        fn alt(&mut self, message: &MessageId, draft: BranchDraft, preserve: bool) -> BranchId {
            let event = self.state.plan_add_branch(message, draft, preserve).unwrap().unwrap();
            self.state.apply(&event).unwrap();
            let TreeEvent::BranchAdded { branch, .. } = event else {
                unreachable!()
            };
            branch.id
        }

        fn bookmark(&mut self, message: &MessageId, branch: &BranchId) {
            let event = self.state.plan_set_bookmark(message, branch, "mark").unwrap();
            self.state.apply(&event).unwrap();
        }
    }

    fn owner() -> UserId {
        UserId::from("user_owner")
    }

    fn assert_closed(plan: &CopyPlan) {
        let copied: HashSet<&BranchId> = plan
            .messages
            .iter()
            .flat_map(|m| m.branches.iter().map(|b| &b.id))
            .collect();
        for message in &plan.messages {
            assert!(message.has_branch(&message.active_branch_id));
            for branch in &message.branches {
                if let Some(parent) = branch.parent_branch_id.branch() {
                    assert!(copied.contains(parent), "dangling parent {parent}");
                }
            }
        }
    }

    #[test]
    fn full_fork_copies_history_and_subtree() {
        let mut f = Fixture::new();
        let _a = f.say(Role::User, "a");
        let _b = f.say(Role::Assistant, "b");
        let c = f.say(Role::User, "c");
        let _d = f.say(Role::Assistant, "d");

        let plan = plan_fork(
            &f.state,
            ConversationId::from("conv_new"),
            &c.id,
            None,
            ForkMode::Full,
            &owner(),
        )
        .unwrap();
        assert_eq!(plan.history_messages, 2);
        assert_eq!(plan.subtree_messages, 2);
        assert_eq!(plan.messages.len(), 4);
        assert!(plan.messages.iter().all(|m| m.conversation_id.as_str() == "conv_new"));
        assert!(
            plan.messages
                .iter()
                .flat_map(|m| &m.branches)
                .all(|b| b.creation_source == CreationSource::Fork)
        );
        assert_closed(&plan);
    }

    #[test]
    fn full_fork_keeps_only_path_branch_of_history() {
        let mut f = Fixture::new();
        let a = f.say(Role::User, "a");
        let _alt = f.alt(&a.id, BranchDraft::new(Role::User, "a-alt"), true);
        let b = f.say(Role::Assistant, "b");

        let plan = plan_fork(&f.state, ConversationId::new(), &b.id, None, ForkMode::Full, &owner()).unwrap();
        assert_eq!(plan.messages[0].branches.len(), 1);
        assert_eq!(plan.messages[0].branches[0].content, "a");
        assert_closed(&plan);
    }

    #[test]
    fn subtree_branch_on_sibling_history_branch_is_remapped() {
        let mut f = Fixture::new();
        let a = f.say(Role::User, "a");
        let a_alt = f.alt(&a.id, BranchDraft::new(Role::User, "a-alt"), true);
        let b = f.say(Role::Assistant, "b");
        let _b_alt = f.alt(&b.id, BranchDraft::new(Role::Assistant, "b-alt").with_parent(a_alt), true);

        let plan = plan_fork(&f.state, ConversationId::new(), &b.id, None, ForkMode::Full, &owner()).unwrap();
        let copied_a = plan.messages[0].branches[0].id.clone();
        let fork_point = &plan.messages[1];
        assert_eq!(fork_point.branches.len(), 2);
        assert!(
            fork_point
                .branches
                .iter()
                .all(|br| br.parent_branch_id == ParentRef::Branch(copied_a.clone()))
        );
        assert_closed(&plan);
    }

    #[test]
    fn truncated_fork_roots_the_fork_point() {
        let mut f = Fixture::new();
        let _a = f.say(Role::User, "a");
        let b = f.say(Role::Assistant, "b");
        let _c = f.say(Role::User, "c");

        let plan = plan_fork(&f.state, ConversationId::new(), &b.id, None, ForkMode::Truncated, &owner()).unwrap();
        assert_eq!(plan.messages.len(), 2);
        assert_eq!(plan.history_messages, 0);
        assert!(plan.messages[0].branches.iter().all(|br| br.parent_branch_id.is_root()));
        assert_closed(&plan);
    }

    #[test]
    fn compressed_fork_carries_prefix() {
        let mut f = Fixture::new();
        let _a = f.say(Role::User, "question");
        let _b = f.say(Role::Assistant, "answer");
        let c = f.say(Role::User, "follow-up");

        let plan = plan_fork(&f.state, ConversationId::new(), &c.id, None, ForkMode::Compressed, &owner()).unwrap();
        assert_eq!(plan.messages.len(), 1);
        let prefix = plan.messages[0].prefix_history.as_ref().unwrap();
        assert_eq!(prefix.len(), 2);
        assert_eq!(prefix[0].content, "question");
        assert_eq!(plan.history_messages, 2);
        assert!(plan.messages[0].branches[0].parent_branch_id.is_root());
    }

    #[test]
    fn private_branches_of_others_are_excluded_with_descendants() {
        let mut f = Fixture::new();
        let a = f.say(Role::User, "a");
        let secret = f.alt(
            &a.id,
            BranchDraft::new(Role::User, "secret").private_to(UserId::from("user_other")),
            false,
        );
        let _b = f.create(BranchDraft::new(Role::Assistant, "reply to secret").with_parent(secret));

        let plan = plan_duplicate(&f.state, ConversationId::new(), Some(&owner()), None);
        assert_eq!(plan.messages.len(), 1);
        assert_eq!(plan.skipped_branches, 2);
        assert_closed(&plan);

        let everything = plan_duplicate(&f.state, ConversationId::new(), None, None);
        assert_eq!(everything.messages.len(), 2);
    }

    #[test]
    fn missing_fork_target_is_none() {
        let f = Fixture::new();
        assert!(
            plan_fork(
                &f.state,
                ConversationId::new(),
                &MessageId::from("msg_nope"),
                None,
                ForkMode::Full,
                &owner()
            )
            .is_none()
        );
    }

    #[test]
    fn bookmarks_follow_copied_branches() {
        let mut f = Fixture::new();
        let a = f.say(Role::User, "a");
        f.bookmark(&a.id, &a.active_branch_id);

        let plan = plan_duplicate(&f.state, ConversationId::new(), Some(&owner()), None);
        assert_eq!(plan.bookmarks.len(), 1);
        assert_eq!(plan.bookmarks[0].message_id, plan.messages[0].id);
        assert_eq!(plan.bookmarks[0].branch_id, plan.messages[0].active_branch_id);

        let events = plan.into_events();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn export_keeps_ids() {
        let mut f = Fixture::new();
        let a = f.say(Role::User, "a");
        let plan = plan_export(&f.state, &owner());
        assert_eq!(plan.messages[0].id, a.id);
        assert_eq!(plan.messages[0].active_branch_id, a.active_branch_id);
    }

    #[test]
    fn fork_mode_parses() {
        assert_eq!("compressed".parse::<ForkMode>().unwrap(), ForkMode::Compressed);
        assert!("partial".parse::<ForkMode>().is_err());
        assert_eq!(ForkMode::Truncated.to_string(), "truncated");
    }
}
