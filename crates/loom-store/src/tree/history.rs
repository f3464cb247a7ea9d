//! Linear history extraction and model-context shaping.

use std::collections::{HashMap, HashSet};

use loom_core::{BranchId, PostHocAction, Role};

use crate::types::Message;

/// Path from the root to `from_branch` over a flat message list.
///
/// Each returned message has its active pointer set to the branch on the
/// path. Unknown `from_branch` yields an empty history.
pub fn build_history(messages: &[Message], from_branch: &BranchId) -> Vec<Message> {
    let owner: HashMap<&BranchId, &Message> = messages
        .iter()
        .flat_map(|m| m.branches.iter().map(move |b| (&b.id, m)))
        .collect();
    walk(|b| owner.get(b).copied(), from_branch)
}

/// Walk parent pointers upward using `lookup` to resolve a branch's owner.
pub(crate) fn walk<'a>(
    lookup: impl Fn(&BranchId) -> Option<&'a Message>,
    from_branch: &BranchId,
) -> Vec<Message> {
    let mut path: Vec<Message> = Vec::new();
    let mut visited: HashSet<BranchId> = HashSet::new();
    let mut current = Some(from_branch.clone());

    while let Some(branch_id) = current {
        if !visited.insert(branch_id.clone()) {
            break;
        }
        let Some(message) = lookup(&branch_id) else {
            break;
        };
        let Some(branch) = message.branch(&branch_id) else {
            break;
        };
        current = branch.parent_branch_id.branch().cloned();
        let mut on_path = message.clone();
        on_path.active_branch_id = branch_id;
        path.push(on_path);
    }

    path.reverse();
    path
}

/// Shape a history for model consumption.
///
/// Post-hoc operations carried by system branches are applied to the
/// messages they target and then dropped, and branches hidden from the
/// model are removed.
pub fn ai_visible(history: Vec<Message>) -> Vec<Message> {
    let mut hidden: HashSet<BranchId> = HashSet::new();
    let mut edits: HashMap<BranchId, String> = HashMap::new();

    for message in &history {
        let Some(branch) = message.active_branch() else {
            continue;
        };
        let Some(op) = &branch.post_hoc_operation else {
            continue;
        };
        match op.action {
            PostHocAction::Hide => {
                let _ = hidden.insert(op.target_branch_id.clone());
            }
            PostHocAction::Unhide => {
                let _ = hidden.remove(&op.target_branch_id);
            }
            PostHocAction::Edit => {
                if let Some(text) = &op.replacement_content {
                    let _ = edits.insert(op.target_branch_id.clone(), text.clone());
                }
            }
        }
    }

    history
        .into_iter()
        .filter_map(|mut message| {
            let active = message.active_branch_id.clone();
            let branch = message.branch_mut(&active)?;
            if branch.hidden_from_ai || hidden.contains(&active) {
                return None;
            }
            if branch.role == Role::System && branch.post_hoc_operation.is_some() {
                return None;
            }
            if let Some(text) = edits.get(&active) {
                branch.content.clone_from(text);
            }
            Some(message)
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
