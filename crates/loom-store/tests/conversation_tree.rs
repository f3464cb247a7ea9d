//! End-to-end tree behaviour through the public store API.

use std::collections::HashSet;

use assert_matches::assert_matches;
use loom_core::{BranchId, ConversationId, ParentRef, Permission, Role, UserId};
use loom_store::{
    BranchDraft, ConversationStore, EventLog, ForkMode, ForkRequest, Message, NewConversation, StoreError,
    TreeError,
};

struct Chat {
    store: ConversationStore,
    id: ConversationId,
    owner: UserId,
}

impl Chat {
    fn new() -> Self {
        let store = ConversationStore::in_memory().unwrap();
        let owner = UserId::from("user_owner");
        let row = store
            .create_conversation(
                &owner,
                NewConversation {
                    title: "Tree".into(),
                    ..Default::default()
                },
            )
            .unwrap();
        Self {
            id: ConversationId::from(row.id.as_str()),
            store,
            owner,
        }
    }

    fn say(&self, role: Role, text: &str) -> Message {
        self.store
            .create_message(&self.id, &self.owner, BranchDraft::new(role, text))
            .unwrap()
    }

    fn messages(&self) -> Vec<Message> {
        self.store.get_messages(&self.id, &self.owner).unwrap()
    }
}

fn contents(messages: &[Message]) -> Vec<String> {
    messages
        .iter()
        .map(|m| m.active_branch().unwrap().content.clone())
        .collect()
}

#[test]
fn deleting_root_message_cascades_through_chain() {
    let chat = Chat::new();
    let a = chat.say(Role::User, "A");
    let b = chat.say(Role::Assistant, "B");
    let c = chat.say(Role::User, "C");

    let plan = chat.store.delete_message(&chat.id, &chat.owner, &a.id).unwrap().unwrap();
    assert_eq!(plan.deleted_messages, vec![a.id, b.id, c.id]);
    assert!(plan.pruned_branches.is_empty());
    assert!(chat.messages().is_empty());

    let row = chat.store.get_conversation(&chat.id, &chat.owner).unwrap().unwrap();
    assert_eq!((row.message_count, row.total_branch_count), (0, 0));
}

/// A with two answers B1 and B2, and C answering B1 twice over (C1, C2).
struct Fan {
    a: Message,
    b: Message,
    c: Message,
    b1: BranchId,
    b2: BranchId,
}

fn fan(chat: &Chat) -> Fan {
    let a = chat.say(Role::User, "A");
    let b = chat.say(Role::Assistant, "B1");
    let b1 = b.active_branch_id.clone();
    let b2 = chat
        .store
        .add_branch(&chat.id, &chat.owner, &b.id, BranchDraft::new(Role::Assistant, "B2"), true)
        .unwrap()
        .unwrap()
        .branches[1]
        .id
        .clone();
    let c = chat.say(Role::User, "C1");
    let c2 = chat
        .store
        .add_branch(
            &chat.id,
            &chat.owner,
            &c.id,
            BranchDraft::new(Role::User, "C2").with_parent(b1.clone()),
            true,
        )
        .unwrap()
        .unwrap();
    assert!(c2.branches.iter().all(|br| br.parent_branch_id == ParentRef::Branch(b1.clone())));
    Fan { a, b, c, b1, b2 }
}

#[test]
fn deleting_root_cascades_through_sibling_branches() {
    let chat = Chat::new();
    let fan = fan(&chat);
    let b = chat.store.get_message(&chat.id, &chat.owner, &fan.b.id).unwrap().unwrap();
    assert!(b.branches.iter().all(|br| br.parent_branch_id == ParentRef::Branch(fan.a.active_branch_id.clone())));

    let plan = chat.store.delete_message(&chat.id, &chat.owner, &fan.a.id).unwrap().unwrap();
    assert_eq!(plan.deleted_messages, vec![fan.a.id, fan.b.id, fan.c.id]);
    assert!(plan.pruned_branches.is_empty());
    assert!(chat.messages().is_empty());

    let row = chat.store.get_conversation(&chat.id, &chat.owner).unwrap().unwrap();
    assert_eq!((row.message_count, row.total_branch_count), (0, 0));
}

#[test]
fn deleting_one_sibling_takes_only_its_descendants() {
    let chat = Chat::new();
    let fan = fan(&chat);

    let deletion = chat
        .store
        .delete_branch(&chat.id, &chat.owner, &fan.b.id, &fan.b1)
        .unwrap()
        .unwrap();
    assert_eq!(deletion.deleted_message_ids, vec![fan.c.id]);
    assert_eq!(deletion.message.unwrap().active_branch_id, fan.b2);
    assert_eq!(contents(&chat.messages()), ["A", "B2"]);
}

#[test]
fn message_with_another_parent_survives_cascade() {
    let chat = Chat::new();
    let a = chat.say(Role::User, "A1");
    let a2 = chat
        .store
        .add_branch(&chat.id, &chat.owner, &a.id, BranchDraft::new(Role::User, "A2"), false)
        .unwrap()
        .unwrap();
    let a2_branch = a2.active_branch_id.clone();

    // B answers A2, then gets an alternative answering A1.
    let b = chat.say(Role::Assistant, "B under A2");
    let b_alt = chat
        .store
        .add_branch(
            &chat.id,
            &chat.owner,
            &b.id,
            BranchDraft::new(Role::Assistant, "B under A1").with_parent(a.active_branch_id.clone()),
            true,
        )
        .unwrap()
        .unwrap();
    assert_eq!(b_alt.branches.len(), 2);

    let deletion = chat
        .store
        .delete_branch(&chat.id, &chat.owner, &a.id, &a2_branch)
        .unwrap()
        .unwrap();
    assert!(deletion.deleted_message_ids.is_empty());
    assert_eq!(deletion.pruned_branches, vec![(b.id.clone(), b.active_branch_id.clone())]);
    assert_eq!(deletion.message.unwrap().active_branch_id, a.active_branch_id);

    let survivors = chat.messages();
    assert_eq!(contents(&survivors), ["A1", "B under A1"]);
    assert_eq!(survivors[1].branches.len(), 1);
}

#[test]
fn preserve_active_controls_switching() {
    let chat = Chat::new();
    chat.say(Role::User, "question");
    let answer = chat.say(Role::Assistant, "first");

    let kept = chat
        .store
        .add_branch(
            &chat.id,
            &chat.owner,
            &answer.id,
            BranchDraft::new(Role::Assistant, "second"),
            true,
        )
        .unwrap()
        .unwrap();
    assert_eq!(kept.active_branch().unwrap().content, "first");
    assert_eq!(kept.branches[1].parent_branch_id, answer.branches[0].parent_branch_id);

    let switched = chat
        .store
        .add_branch(
            &chat.id,
            &chat.owner,
            &answer.id,
            BranchDraft::new(Role::Assistant, "third"),
            false,
        )
        .unwrap()
        .unwrap();
    assert_eq!(switched.active_branch().unwrap().content, "third");
}

#[test]
fn split_preserves_history_text() {
    let chat = Chat::new();
    let a = chat.say(Role::User, "héllo wörld");
    let b = chat.say(Role::Assistant, "reply");

    let outcome = chat
        .store
        .split_message(&chat.id, &chat.owner, &a.id, &a.active_branch_id, 5)
        .unwrap()
        .unwrap();
    assert_eq!(outcome.created.order, a.order + 1);

    let history = chat
        .store
        .get_history(&chat.id, &chat.owner, &b.active_branch_id)
        .unwrap();
    assert_eq!(contents(&history), ["héllo", " wörld", "reply"]);

    let orders: Vec<i64> = chat.messages().iter().map(|m| m.order).collect();
    let mut sorted = orders.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(orders, sorted);

    for position in [0, 11, 50] {
        assert!(chat
            .store
            .split_message(&chat.id, &chat.owner, &a.id, &a.active_branch_id, position)
            .unwrap()
            .is_none());
    }
}

#[test]
fn fork_copy_is_closed_under_parent_pointers() {
    let chat = Chat::new();
    let q = chat.say(Role::User, "q");
    let r = chat.say(Role::Assistant, "r1");
    chat.store
        .add_branch(&chat.id, &chat.owner, &r.id, BranchDraft::new(Role::Assistant, "r2"), false)
        .unwrap();
    chat.say(Role::User, "follow-up");

    for mode in [ForkMode::Full, ForkMode::Compressed, ForkMode::Truncated] {
        let request = ForkRequest {
            mode,
            ..ForkRequest::at(r.id.clone())
        };
        let fork = chat
            .store
            .fork_conversation(&chat.id, &chat.owner, &request)
            .unwrap()
            .unwrap();
        let fork_id = ConversationId::from(fork.conversation.id.as_str());
        let copied = chat.store.get_messages(&fork_id, &chat.owner).unwrap();

        let ids: HashSet<&BranchId> = copied.iter().flat_map(|m| m.branches.iter().map(|b| &b.id)).collect();
        for branch in copied.iter().flat_map(|m| &m.branches) {
            if let ParentRef::Branch(parent) = &branch.parent_branch_id {
                assert!(ids.contains(parent), "{mode}: dangling parent {parent}");
            }
        }
        assert!(copied.iter().all(|m| m.id != q.id && m.id != r.id));

        match mode {
            ForkMode::Full => assert_eq!(contents(&copied)[0], "q"),
            ForkMode::Compressed => {
                let prefix = copied[0].prefix_history.as_ref().unwrap();
                assert_eq!(prefix[0].content, "q");
            }
            ForkMode::Truncated => assert!(copied[0].prefix_history.is_none()),
        }
    }
}

#[test]
fn private_branches_stay_private_everywhere() {
    let chat = Chat::new();
    let guest = UserId::from("user_guest");
    let invite = chat
        .store
        .create_invite(&chat.id, &chat.owner, Permission::Collaborator)
        .unwrap()
        .unwrap();
    chat.store.claim_invite(&invite.token, &guest).unwrap();

    let q = chat.say(Role::User, "shared question");
    let secret = chat
        .store
        .add_branch(
            &chat.id,
            &chat.owner,
            &q.id,
            BranchDraft::new(Role::User, "owner draft").private_to(chat.owner.clone()),
            false,
        )
        .unwrap()
        .unwrap();
    let follow = chat.say(Role::Assistant, "answer to draft");
    assert_eq!(
        follow.branches[0].parent_branch_id,
        ParentRef::Branch(secret.active_branch_id.clone())
    );

    let seen = chat.store.get_messages(&chat.id, &guest).unwrap();
    assert_eq!(contents(&seen), ["shared question", "answer to draft"]);
    assert!(chat
        .store
        .get_history(&chat.id, &guest, &follow.active_branch_id)
        .unwrap()
        .iter()
        .all(|m| m.active_branch().unwrap().content != "owner draft"));

    let export = chat.store.export_conversation(&chat.id, &guest).unwrap().unwrap();
    let exported: Vec<&str> = export
        .messages
        .iter()
        .flat_map(|m| m.branches.iter().map(|b| b.content.as_str()))
        .collect();
    assert_eq!(exported, ["shared question"]);
}

#[test]
fn replay_matches_live_state_after_mixed_edits() {
    let chat = Chat::new();
    let a = chat.say(Role::User, "a");
    let b = chat.say(Role::Assistant, "b");
    chat.store
        .add_branch(&chat.id, &chat.owner, &b.id, BranchDraft::new(Role::Assistant, "b2"), false)
        .unwrap();
    chat.store
        .set_active_branch(&chat.id, &chat.owner, &b.id, &b.active_branch_id)
        .unwrap();
    chat.store
        .set_bookmark(&chat.id, &chat.owner, &a.id, &a.active_branch_id, "start")
        .unwrap();
    chat.store
        .split_message(&chat.id, &chat.owner, &a.id, &a.active_branch_id, 1)
        .unwrap();
    let streaming = chat
        .store
        .create_message(
            &chat.id,
            &chat.owner,
            BranchDraft::new(Role::Assistant, "").streaming(),
        )
        .unwrap();
    chat.store
        .append_stream_delta(&chat.id, &chat.owner, &streaming.id, &streaming.active_branch_id, "partial")
        .unwrap();
    chat.store
        .finish_generation(&chat.id, &chat.owner, &streaming.id, &streaming.active_branch_id, None)
        .unwrap();

    let live = chat.store.cache().get(&chat.id).unwrap().snapshot();
    let conn = chat.store.pool().get().unwrap();
    let replayed = EventLog::load_state(&conn, &chat.id, live.format()).unwrap();
    assert_eq!(replayed.observable(), live.observable());
    assert_eq!(replayed.messages(), live.messages());
}

#[test]
fn mutations_cannot_reach_private_branches() {
    let chat = Chat::new();
    let guest = UserId::from("user_guest");
    let invite = chat
        .store
        .create_invite(&chat.id, &chat.owner, Permission::Editor)
        .unwrap()
        .unwrap();
    chat.store.claim_invite(&invite.token, &guest).unwrap();

    let q = chat.say(Role::User, "shared question");
    let shared = q.active_branch_id.clone();
    let secret = chat
        .store
        .add_branch(
            &chat.id,
            &chat.owner,
            &q.id,
            BranchDraft::new(Role::User, "owner draft").private_to(chat.owner.clone()),
            false,
        )
        .unwrap()
        .unwrap()
        .active_branch_id;
    let store = &chat.store;

    assert!(!store.set_active_branch(&chat.id, &guest, &q.id, &secret).unwrap());
    assert!(store.split_message(&chat.id, &guest, &q.id, &secret, 3).unwrap().is_none());
    assert!(store.set_bookmark(&chat.id, &guest, &q.id, &secret, "mine").unwrap().is_none());
    assert!(!store.remove_bookmark(&chat.id, &guest, &q.id, &secret).unwrap());
    assert!(!store.append_stream_delta(&chat.id, &guest, &q.id, &secret, "x").unwrap());
    assert!(store.abort_generation(&chat.id, &guest, &q.id, &secret).unwrap().is_none());
    assert!(store.delete_branch(&chat.id, &guest, &q.id, &secret).unwrap().is_none());

    assert_matches!(
        store.create_message(&chat.id, &guest, BranchDraft::new(Role::Assistant, "x").with_parent(secret.clone())),
        Err(StoreError::Invariant(TreeError::UnknownParent { .. }))
    );
    assert_matches!(
        store.add_branch(
            &chat.id,
            &guest,
            &q.id,
            BranchDraft::new(Role::User, "x").private_to(chat.owner.clone()),
            true
        ),
        Err(StoreError::AccessDenied)
    );

    let edited = store
        .add_branch(&chat.id, &guest, &q.id, BranchDraft::new(Role::User, "guest edit"), true)
        .unwrap()
        .unwrap();
    let texts: Vec<&str> = edited.branches.iter().map(|b| b.content.as_str()).collect();
    assert_eq!(texts, ["shared question", "guest edit"]);

    // The guest's default parent is the branch they see as active.
    let reply = store
        .create_message(&chat.id, &guest, BranchDraft::new(Role::Assistant, "reply"))
        .unwrap();
    assert_eq!(reply.branches[0].parent_branch_id, ParentRef::Branch(shared));

    let owner_view = store.get_message(&chat.id, &chat.owner, &q.id).unwrap().unwrap();
    assert_eq!(owner_view.active_branch_id, secret);
    assert_eq!(owner_view.active_branch().unwrap().content, "owner draft");
    assert!(store.get_bookmarks(&chat.id, &chat.owner).unwrap().is_empty());
}

#[test]
fn next_responder_follows_the_visible_tail() {
    let chat = Chat::new();
    assert_eq!(chat.store.next_responder(&chat.id, &chat.owner).unwrap(), Some(Role::User));
    chat.say(Role::User, "question");
    assert_eq!(chat.store.next_responder(&chat.id, &chat.owner).unwrap(), Some(Role::Assistant));
    chat.say(Role::Assistant, "answer");
    assert_eq!(chat.store.next_responder(&chat.id, &chat.owner).unwrap(), Some(Role::User));

    let missing = ConversationId::from("conv_missing");
    assert_eq!(chat.store.next_responder(&missing, &chat.owner).unwrap(), None);
}
