//! Portable conversation export format.

use chrono::{DateTime, Utc};
use loom_core::ConversationFormat;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::tree::{Bookmark, Message};

/// Current export format version.
pub const EXPORT_FORMAT_VERSION: u32 = 1;

/// A self-contained snapshot of one conversation, as seen by the exporting user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationExport {
    /// Format version; imports reject versions newer than [`EXPORT_FORMAT_VERSION`].
    pub format_version: u32,
    /// When the export was produced.
    pub exported_at: DateTime<Utc>,
    /// Conversation title.
    pub title: String,
    /// Conversation format.
    pub format: ConversationFormat,
    /// Opaque conversation settings.
    #[serde(default)]
    pub settings: Value,
    /// Messages in display order.
    pub messages: Vec<Message>,
    /// Bookmarks on exported branches.
    #[serde(default)]
    pub bookmarks: Vec<Bookmark>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_export_serializes_camel_case() {
        let export = ConversationExport {
            format_version: EXPORT_FORMAT_VERSION,
            exported_at: Utc::now(),
            title: "t".into(),
            format: ConversationFormat::Prefill,
            settings: serde_json::json!({}),
            messages: vec![],
            bookmarks: vec![],
        };
        let json = serde_json::to_value(&export).unwrap();
        assert_eq!(json["formatVersion"], 1);
        assert_eq!(json["format"], "prefill");
    }

    #[test]
    fn bookmarks_default_when_absent() {
        let json = r#"{"formatVersion":1,"exportedAt":"2026-01-01T00:00:00Z","title":"x","format":"standard","messages":[]}"#;
        let export: ConversationExport = serde_json::from_str(json).unwrap();
        assert!(export.bookmarks.is_empty());
        assert!(export.settings.is_null());
    }
}
