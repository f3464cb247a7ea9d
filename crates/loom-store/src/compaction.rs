//! Event log compaction planning.
//!
//! Compaction rewrites a conversation's log into a shorter one that folds
//! to the same observable tree:
//!
//! - last-writer-wins events (`branch.activated`, `message.reordered`,
//!   `bookmark.set`/`bookmark.removed`) are dropped when a later event of the
//!   same kind targets the same message or bookmark;
//! - strictly adjacent `branch.content_appended` events for the same branch
//!   are merged into one;
//! - provider debug payloads are dropped or moved into the blob store, and
//!   large inline attachments are moved into the blob store.
//!
//! Planning is pure; the caller supplies a blob sink and is responsible for
//! verifying the result by replay before swapping logs.

use std::collections::HashSet;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use loom_core::{BranchId, MessageId};

use crate::errors::Result;
use crate::events::TreeEvent;

/// One persisted event with its position in the log.
#[derive(Clone, Debug, PartialEq)]
pub struct LoggedEvent {
    /// Position in the conversation's log.
    pub sequence: i64,
    /// The event.
    pub event: TreeEvent,
    /// When the event was recorded (RFC 3339).
    pub recorded_at: String,
}

/// Payload handling during compaction.
#[derive(Clone, Debug, Default)]
pub struct CompactionOptions {
    /// Drop provider debug payloads entirely.
    pub strip_debug_payloads: bool,
    /// Move debug payloads and inline attachments larger than this into the
    /// blob store. Zero disables.
    pub externalize_threshold_bytes: usize,
}

impl From<&loom_settings::CompactionSettings> for CompactionOptions {
    fn from(settings: &loom_settings::CompactionSettings) -> Self {
        Self {
            strip_debug_payloads: settings.strip_debug_payloads,
            externalize_threshold_bytes: settings.externalize_threshold_bytes,
        }
    }
}

/// Counters describing what a compaction pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Superseded events dropped.
    pub dropped: usize,
    /// Append events merged into a predecessor.
    pub merged: usize,
    /// Debug payloads removed.
    pub debug_stripped: usize,
    /// Debug payloads and attachments moved into the blob store.
    pub externalized: usize,
}

#[derive(Hash, PartialEq, Eq)]
enum SupersedeKey {
    Active(MessageId),
    Order(MessageId),
    Bookmark(MessageId, BranchId),
}

fn supersede_key(event: &TreeEvent) -> Option<SupersedeKey> {
    match event {
        TreeEvent::BranchActivated { message_id, .. } => Some(SupersedeKey::Active(message_id.clone())),
        TreeEvent::MessageReordered { message_id, .. } => Some(SupersedeKey::Order(message_id.clone())),
        TreeEvent::BookmarkSet { bookmark } => Some(SupersedeKey::Bookmark(
            bookmark.message_id.clone(),
            bookmark.branch_id.clone(),
        )),
        TreeEvent::BookmarkRemoved {
            message_id,
            branch_id,
        } => Some(SupersedeKey::Bookmark(message_id.clone(), branch_id.clone())),
        _ => None,
    }
}

/// Drop superseded events and merge adjacent appends.
///
/// Retained events keep their relative order.
pub fn plan_compaction(events: Vec<LoggedEvent>, stats: &mut CompactionStats) -> Vec<LoggedEvent> {
    let mut seen: HashSet<SupersedeKey> = HashSet::new();
    let mut keep = vec![true; events.len()];
    for (index, logged) in events.iter().enumerate().rev() {
        if let Some(key) = supersede_key(&logged.event) {
            if !seen.insert(key) {
                keep[index] = false;
                stats.dropped += 1;
            }
        }
    }

    let mut out: Vec<LoggedEvent> = Vec::with_capacity(events.len());
    let mut previous_kept: Option<usize> = None;
    for (index, logged) in events.into_iter().enumerate() {
        if !keep[index] {
            continue;
        }
        // Only merge with the event that sat directly before this one in
        // the original log.
        let adjacent = previous_kept == index.checked_sub(1);
        previous_kept = Some(index);

        if adjacent {
            if let (
                Some(LoggedEvent {
                    event:
                        TreeEvent::BranchContentAppended {
                            message_id: prev_message,
                            branch_id: prev_branch,
                            delta: prev_delta,
                        },
                    recorded_at: prev_recorded,
                    ..
                }),
                TreeEvent::BranchContentAppended {
                    message_id,
                    branch_id,
                    delta,
                },
            ) = (out.last_mut(), &logged.event)
            {
                if prev_message == message_id && prev_branch == branch_id {
                    prev_delta.push_str(delta);
                    prev_recorded.clone_from(&logged.recorded_at);
                    stats.merged += 1;
                    continue;
                }
            }
        }
        out.push(logged);
    }
    out
}

/// Strip or externalize debug payloads and large attachments in place.
///
/// `save_blob` receives base64 data and a MIME type and returns the blob ID.
pub fn rewrite_payloads(
    events: &mut [LoggedEvent],
    options: &CompactionOptions,
    stats: &mut CompactionStats,
    save_blob: &mut dyn FnMut(&str, &str) -> Result<String>,
) -> Result<()> {
    let threshold = options.externalize_threshold_bytes;
    for logged in events.iter_mut() {
        for branch in logged.event.branches_mut() {
            if let Some(debug) = branch.debug.take() {
                if options.strip_debug_payloads {
                    stats.debug_stripped += 1;
                } else {
                    let encoded = serde_json::to_vec(&debug)?;
                    if threshold > 0 && encoded.len() > threshold {
                        let blob_id = save_blob(&STANDARD.encode(&encoded), "application/json")?;
                        branch.debug_blob_id = Some(blob_id);
                        stats.externalized += 1;
                    } else {
                        branch.debug = Some(debug);
                    }
                }
            }
            if threshold == 0 {
                continue;
            }
            for attachment in &mut branch.attachments {
                let oversized = attachment.data.as_ref().is_some_and(|d| d.len() > threshold);
                if !oversized {
                    continue;
                }
                if let Some(data) = attachment.data.take() {
                    attachment.blob_id = Some(save_blob(&data, &attachment.mime_type)?);
                    stats.externalized += 1;
                }
            }
        }
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::TreeState;
    use crate::types::BranchDraft;
    use loom_core::{Attachment, ConversationFormat, ConversationId, Role};

    fn log(events: Vec<TreeEvent>) -> Vec<LoggedEvent> {
        events
            .into_iter()
            .enumerate()
            .map(|(i, event)| LoggedEvent {
                sequence: i64::try_from(i).unwrap() + 1,
                event,
                recorded_at: format!("t{i}"),
            })
            .collect()
    }

    fn events_of(logged: &[LoggedEvent]) -> Vec<&TreeEvent> {
        logged.iter().map(|l| &l.event).collect()
    }

    fn fold(logged: &[LoggedEvent]) -> TreeState {
        TreeState::from_events(
            ConversationId::from("conv_t"),
            ConversationFormat::Standard,
            logged.iter().map(|l| &l.event),
        )
        .unwrap()
    }

    /// A message with two branches, toggled `toggles` times.
    fn toggled_log(toggles: usize) -> Vec<TreeEvent> {
        let mut state = TreeState::new(ConversationId::from("conv_t"), ConversationFormat::Standard);
        let mut events = Vec::new();
        let created = state.plan_create_message(BranchDraft::new(Role::User, "a")).unwrap();
        state.apply(&created).unwrap();
        let TreeEvent::MessageCreated { message } = &created else {
            unreachable!()
        };
        let first = message.active_branch_id.clone();
        let id = message.id.clone();
        events.push(created.clone());

        let added = state
            .plan_add_branch(&id, BranchDraft::new(Role::User, "b"), false)
            .unwrap()
            .unwrap();
        state.apply(&added).unwrap();
        let TreeEvent::BranchAdded { branch, .. } = &added else {
            unreachable!()
        };
        let second = branch.id.clone();
        events.push(added.clone());

        for i in 0..toggles {
            let target = if i % 2 == 0 { &first } else { &second };
            let event = state.plan_set_active(&id, target).unwrap();
            state.apply(&event).unwrap();
            events.push(event);
        }
        events
    }

    #[test]
    fn superseded_activations_are_dropped() {
        let logged = log(toggled_log(5));
        let before = fold(&logged).observable();

        let mut stats = CompactionStats::default();
        let compacted = plan_compaction(logged, &mut stats);
        assert_eq!(stats.dropped, 4);
        assert_eq!(compacted.len(), 3);
        assert_eq!(fold(&compacted).observable(), before);
    }

    #[test]
    fn adjacent_appends_merge() {
        let mut state = TreeState::new(ConversationId::from("conv_t"), ConversationFormat::Standard);
        let created = state
            .plan_create_message(BranchDraft::new(Role::Assistant, "").streaming())
            .unwrap();
        state.apply(&created).unwrap();
        let TreeEvent::MessageCreated { message } = &created else {
            unreachable!()
        };
        let (m, b) = (message.id.clone(), message.active_branch_id.clone());
        let mut events = vec![created.clone()];
        for piece in ["Hel", "lo", " there"] {
            let e = state.plan_append_delta(&m, &b, piece).unwrap().unwrap();
            state.apply(&e).unwrap();
            events.push(e);
        }

        let logged = log(events);
        let before = fold(&logged).observable();
        let mut stats = CompactionStats::default();
        let compacted = plan_compaction(logged, &mut stats);
        assert_eq!(stats.merged, 2);
        assert_eq!(compacted.len(), 2);
        assert_eq!(compacted[1].recorded_at, "t3");
        assert!(matches!(
            events_of(&compacted)[1],
            TreeEvent::BranchContentAppended { delta, .. } if delta == "Hello there"
        ));
        assert_eq!(fold(&compacted).observable(), before);
    }

    #[test]
    fn appends_separated_by_other_events_stay_apart() {
        let m = MessageId::from("m");
        let b = BranchId::from("b");
        let append = |d: &str| TreeEvent::BranchContentAppended {
            message_id: m.clone(),
            branch_id: b.clone(),
            delta: d.into(),
        };
        let logged = log(vec![
            append("a"),
            TreeEvent::BookmarkRemoved {
                message_id: m.clone(),
                branch_id: b.clone(),
            },
            append("b"),
        ]);
        let mut stats = CompactionStats::default();
        let compacted = plan_compaction(logged, &mut stats);
        assert_eq!(compacted.len(), 3);
        assert_eq!(stats.merged, 0);
    }

    #[test]
    fn debug_payloads_strip_or_externalize() {
        let mut state = TreeState::new(ConversationId::from("conv_t"), ConversationFormat::Standard);
        let big = serde_json::json!({"request": "x".repeat(200)});
        let created = state
            .plan_create_message(
                BranchDraft::new(Role::Assistant, "hi")
                    .with_debug(big)
                    .with_attachment(Attachment {
                        id: "att_1".into(),
                        file_name: "a.txt".into(),
                        mime_type: "text/plain".into(),
                        size: 300,
                        data: Some("A".repeat(300)),
                        blob_id: None,
                    }),
            )
            .unwrap();

        let mut stripped = log(vec![created.clone()]);
        let mut stats = CompactionStats::default();
        let mut never = |_: &str, _: &str| -> Result<String> { unreachable!() };
        rewrite_payloads(
            &mut stripped,
            &CompactionOptions {
                strip_debug_payloads: true,
                externalize_threshold_bytes: 0,
            },
            &mut stats,
            &mut never,
        )
        .unwrap();
        assert_eq!(stats.debug_stripped, 1);

        let mut moved = log(vec![created]);
        let mut stats = CompactionStats::default();
        let mut saved = Vec::new();
        let mut sink = |data: &str, mime: &str| -> Result<String> {
            saved.push((data.len(), mime.to_string()));
            Ok(format!("blob_{}", saved.len()))
        };
        rewrite_payloads(
            &mut moved,
            &CompactionOptions {
                strip_debug_payloads: false,
                externalize_threshold_bytes: 100,
            },
            &mut stats,
            &mut sink,
        )
        .unwrap();
        assert_eq!(stats.externalized, 2);
        let TreeEvent::MessageCreated { message } = &moved[0].event else {
            unreachable!()
        };
        let branch = &message.branches[0];
        assert!(branch.debug.is_none());
        assert_eq!(branch.debug_blob_id.as_deref(), Some("blob_1"));
        assert!(branch.attachments[0].is_externalized());
        assert_eq!(saved[1].1, "text/plain");
    }
}
