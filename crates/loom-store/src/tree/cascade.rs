//! Transitive removal of branches whose ancestors are gone.
//!
//! A branch is dead when it was removed directly or its parent branch is
//! dead. A message with every branch dead is deleted; a message with some
//! survivors keeps them and has its dead branches pruned. The result is a
//! [`CascadePlan`] computed from a pre-mutation snapshot, so planning never
//! observes half-applied state.

use std::collections::{HashMap, HashSet, VecDeque};

use loom_core::{BranchId, MessageId};
use serde::{Deserialize, Serialize};

use crate::types::Message;

/// Parent branch to child branches, across every message of a tree.
#[derive(Debug, Default)]
pub struct ChildIndex {
    children: HashMap<BranchId, Vec<BranchId>>,
}

impl ChildIndex {
    /// Index the given messages. Children are listed in message-iteration
    /// then branch-creation order.
    pub fn build<'a>(messages: impl IntoIterator<Item = &'a Message>) -> Self {
        let mut children: HashMap<BranchId, Vec<BranchId>> = HashMap::new();
        for message in messages {
            for branch in &message.branches {
                if let Some(parent) = branch.parent_branch_id.branch() {
                    children.entry(parent.clone()).or_default().push(branch.id.clone());
                }
            }
        }
        Self { children }
    }

    /// Direct children of `branch`.
    pub fn children_of(&self, branch: &BranchId) -> &[BranchId] {
        self.children.get(branch).map_or(&[], Vec::as_slice)
    }

    /// `seeds` plus every branch transitively parented to one of them.
    pub fn closure(&self, seeds: impl IntoIterator<Item = BranchId>) -> HashSet<BranchId> {
        let mut dead: HashSet<BranchId> = HashSet::new();
        let mut queue: VecDeque<BranchId> = VecDeque::new();
        for seed in seeds {
            if dead.insert(seed.clone()) {
                queue.push_back(seed);
            }
        }
        while let Some(branch) = queue.pop_front() {
            for child in self.children_of(&branch) {
                if dead.insert(child.clone()) {
                    queue.push_back(child.clone());
                }
            }
        }
        dead
    }
}

/// A branch removed from a message that otherwise survives.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrunedBranch {
    /// Surviving message.
    pub message_id: MessageId,
    /// Removed branch.
    pub branch_id: BranchId,
    /// Set when the removed branch was active: the branch that takes over.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_active: Option<BranchId>,
}

/// Everything one deletion removes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CascadePlan {
    /// Messages whose every branch died, in display order.
    pub deleted_messages: Vec<MessageId>,
    /// Dead branches of surviving messages, in display then creation order.
    pub pruned_branches: Vec<PrunedBranch>,
}

impl CascadePlan {
    /// Whether the plan removes anything.
    pub fn is_empty(&self) -> bool {
        self.deleted_messages.is_empty() && self.pruned_branches.is_empty()
    }

    /// Whether `message_id` is removed entirely.
    pub fn deletes_message(&self, message_id: &MessageId) -> bool {
        self.deleted_messages.contains(message_id)
    }
}

/// Plan the removal of `seeds` and everything that depends on them.
///
/// `messages` must be in display order; the plan lists its results in the
/// same order so replaying it is deterministic.
pub fn plan_cascade(messages: &[&Message], seeds: &[BranchId]) -> CascadePlan {
    let index = ChildIndex::build(messages.iter().copied());
    let dead = index.closure(seeds.iter().cloned());

    let mut plan = CascadePlan::default();
    for message in messages {
        let dead_count = message.branches.iter().filter(|b| dead.contains(&b.id)).count();
        if dead_count == 0 {
            continue;
        }
        if dead_count == message.branches.len() {
            plan.deleted_messages.push(message.id.clone());
            continue;
        }

        let successor = message
            .branches
            .iter()
            .find(|b| !dead.contains(&b.id))
            .map(|b| b.id.clone());
        for branch in message.branches.iter().filter(|b| dead.contains(&b.id)) {
            let next_active = if branch.id == message.active_branch_id {
                successor.clone()
            } else {
                None
            };
            plan.pruned_branches.push(PrunedBranch {
                message_id: message.id.clone(),
                branch_id: branch.id.clone(),
                next_active,
            });
        }
    }
    plan
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BranchDraft;
    use loom_core::{ConversationId, CreationSource, ParentRef, Role};

    fn message(id: &str, order: i64, branches: &[(&str, Option<&str>)]) -> Message {
        let branches: Vec<_> = branches
            .iter()
            .map(|(bid, parent)| {
                let mut b = BranchDraft::new(Role::User, *bid).into_branch(
                    parent.map_or(ParentRef::Root, |p| ParentRef::Branch(BranchId::from(p))),
                    CreationSource::Human,
                );
                b.id = BranchId::from(*bid);
                b
            })
            .collect();
        Message {
            id: MessageId::from(id),
            conversation_id: ConversationId::from("conv_t"),
            order,
            active_branch_id: branches[0].id.clone(),
            branches,
            prefix_history: None,
        }
    }

    #[test]
    fn linear_chain_deletes_descendants() {
        let a = message("A", 0, &[("a1", None)]);
        let b = message("B", 1, &[("b1", Some("a1"))]);
        let c = message("C", 2, &[("c1", Some("b1"))]);
        let plan = plan_cascade(&[&a, &b, &c], &[BranchId::from("a1")]);
        assert_eq!(
            plan.deleted_messages,
            vec![MessageId::from("A"), MessageId::from("B"), MessageId::from("C")]
        );
        assert!(plan.pruned_branches.is_empty());
    }

    #[test]
    fn message_with_independent_branch_survives() {
        let a = message("A", 0, &[("a1", None)]);
        let z = message("Z", 1, &[("z1", None)]);
        let b = message("B", 2, &[("b1", Some("a1")), ("b2", Some("z1"))]);
        let plan = plan_cascade(&[&a, &z, &b], &[BranchId::from("a1")]);
        assert_eq!(plan.deleted_messages, vec![MessageId::from("A")]);
        assert_eq!(
            plan.pruned_branches,
            vec![PrunedBranch {
                message_id: MessageId::from("B"),
                branch_id: BranchId::from("b1"),
                next_active: Some(BranchId::from("b2")),
            }]
        );
    }

    #[test]
    fn inactive_pruned_branch_keeps_active() {
        let a = message("A", 0, &[("a1", None), ("a2", None)]);
        let b = message("B", 1, &[("b1", Some("a1"))]);
        let plan = plan_cascade(&[&a, &b], &[BranchId::from("a2")]);
        assert!(plan.deleted_messages.is_empty());
        assert_eq!(plan.pruned_branches.len(), 1);
        assert_eq!(plan.pruned_branches[0].next_active, None);
    }

    #[test]
    fn closure_follows_grandchildren() {
        let a = message("A", 0, &[("a1", None)]);
        let b = message("B", 1, &[("b1", Some("a1")), ("b2", Some("a1"))]);
        let c = message("C", 2, &[("c1", Some("b2"))]);
        let index = ChildIndex::build([&a, &b, &c]);
        let dead = index.closure([BranchId::from("b2")]);
        assert_eq!(dead.len(), 2);
        assert!(dead.contains(&BranchId::from("c1")));
        assert_eq!(index.children_of(&BranchId::from("a1")).len(), 2);
        assert!(index.children_of(&BranchId::from("c1")).is_empty());
    }

    #[test]
    fn empty_seed_set_removes_nothing() {
        let a = message("A", 0, &[("a1", None)]);
        assert!(plan_cascade(&[&a], &[]).is_empty());
    }
}
